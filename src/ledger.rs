//! In-memory barrier ledger for participants
//!
//! Holds the ledger rows and the participant's business state `S` behind one
//! lock, so a [`MemoryTx`] sees both and commits or rolls back both together.
//! Transactions are serialized, which is enough for tests and single-process
//! participants.

use crate::barrier::{BarrierKey, BarrierStore, BarrierTx, LedgerRow, LocalTransaction};
use crate::LedgerError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Clone)]
struct LedgerState<S> {
    rows: HashMap<BarrierKey, LedgerRow>,
    data: S,
}

/// In-memory ledger with business state `S`
pub struct InMemoryLedger<S> {
    state: Mutex<LedgerState<S>>,
    fail_next_commit: AtomicBool,
}

impl<S: Clone + Send> InMemoryLedger<S> {
    /// Empty ledger over initial business state `data`
    pub fn new(data: S) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                rows: HashMap::new(),
                data,
            }),
            fail_next_commit: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerState<S>>, LedgerError> {
        self.state
            .lock()
            .map_err(|e| LedgerError::Storage(e.to_string().into()))
    }

    /// Copy of the committed business state
    pub fn snapshot(&self) -> Result<S, LedgerError> {
        Ok(self.lock()?.data.clone())
    }

    /// Number of committed ledger rows
    pub fn row_count(&self) -> Result<usize, LedgerError> {
        Ok(self.lock()?.rows.len())
    }

    /// Committed row for a key
    pub fn row(&self, key: &BarrierKey) -> Result<Option<LedgerRow>, LedgerError> {
        Ok(self.lock()?.rows.get(key).cloned())
    }

    /// Make the next commit fail, as a storage outage would
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }
}

impl<S: Clone + Send + Default> Default for InMemoryLedger<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S: Clone + Send> BarrierStore for InMemoryLedger<S> {
    type Tx<'a> = MemoryTx<'a, S> where Self: 'a;

    fn begin(&self) -> Result<Self::Tx<'_>, LedgerError> {
        let guard = self.lock()?;
        let undo = (*guard).clone();
        Ok(MemoryTx {
            guard,
            undo: Some(undo),
            fail_commit: &self.fail_next_commit,
        })
    }
}

/// Local transaction over an [`InMemoryLedger`].
///
/// Dropping it without `commit` rolls it back.
pub struct MemoryTx<'a, S: Clone> {
    guard: MutexGuard<'a, LedgerState<S>>,
    undo: Option<LedgerState<S>>,
    fail_commit: &'a AtomicBool,
}

impl<'a, S: Clone> MemoryTx<'a, S> {
    /// Business state, as seen inside this transaction
    pub fn data(&self) -> &S {
        &self.guard.data
    }

    /// Mutable business state; changes are undone on rollback
    pub fn data_mut(&mut self) -> &mut S {
        &mut self.guard.data
    }
}

impl<'a, S: Clone> BarrierTx for MemoryTx<'a, S> {
    fn insert_barrier(&mut self, key: &BarrierKey, row: LedgerRow) -> Result<bool, LedgerError> {
        if self.guard.rows.contains_key(key) {
            return Ok(false);
        }
        self.guard.rows.insert(key.clone(), row);
        Ok(true)
    }

    fn barrier_row(&mut self, key: &BarrierKey) -> Result<Option<LedgerRow>, LedgerError> {
        Ok(self.guard.rows.get(key).cloned())
    }
}

impl<'a, S: Clone> LocalTransaction for MemoryTx<'a, S> {
    fn commit(mut self) -> Result<(), LedgerError> {
        if self.fail_commit.swap(false, Ordering::SeqCst) {
            return Err(LedgerError::CommitFailed("injected commit failure".into()));
        }
        self.undo = None;
        Ok(())
    }

    fn rollback(self) -> Result<(), LedgerError> {
        Ok(())
    }
}

impl<'a, S: Clone> Drop for MemoryTx<'a, S> {
    fn drop(&mut self) {
        if let Some(undo) = self.undo.take() {
            *self.guard = undo;
        }
    }
}
