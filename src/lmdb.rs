//! LMDB-backed stores (feature `lmdb`)
//!
//! Both stores live in named databases of one [`heed::Env`], so a process can
//! keep the coordinator's records and a participant's barrier ledger in the
//! same environment. Transaction records are rkyv-encoded; ledger rows are
//! small JSON documents.
//!
//! Non-terminal records are also listed in a schedule index keyed by
//! big-endian next cron time followed by the gid. A sweep walks the index
//! from the start and stops at the first entry that is not yet due.

use crate::barrier::{BarrierKey, BarrierStore, BarrierTx, LedgerRow, LocalTransaction};
use crate::store::{check_save, due_entry};
use crate::{codec, LedgerError, StoreError, TransGlobal, TransStore};
use heed::types::{Bytes, Str, Unit};
use heed::{Database, Env, EnvOpenOptions, RwTxn};
use std::path::Path;

const TRANS_DB: &str = "trans_global";
const DUE_DB: &str = "trans_due";
const BARRIER_DB: &str = "barrier";

/// Open (creating if needed) an environment at `dir` sized for both stores
pub fn open_env(dir: impl AsRef<Path>, map_size: usize) -> Result<Env, heed::Error> {
    std::fs::create_dir_all(dir.as_ref()).map_err(heed::Error::Io)?;
    // SAFETY: the environment is opened once per directory by this process
    // and the memory map is not modified outside of heed.
    unsafe { EnvOpenOptions::new().map_size(map_size).max_dbs(4).open(dir.as_ref()) }
}

fn storage(e: heed::Error) -> StoreError {
    StoreError::Storage(e.to_string().into())
}

/// Coordinator record store over LMDB
pub struct LmdbTransStore {
    env: Env,
    records: Database<Str, Bytes>,
    due: Database<Bytes, Unit>,
}

fn due_key((at, gid): (u64, &str)) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + gid.len());
    key.extend_from_slice(&at.to_be_bytes());
    key.extend_from_slice(gid.as_bytes());
    key
}

fn split_due_key(key: &[u8]) -> Result<(u64, &str), StoreError> {
    let bad = || StoreError::Codec("malformed schedule key".into());
    let (at, gid) = key.split_first_chunk::<8>().ok_or_else(bad)?;
    let gid = std::str::from_utf8(gid).map_err(|_| bad())?;
    Ok((u64::from_be_bytes(*at), gid))
}

impl LmdbTransStore {
    /// Open the record databases, creating them if needed
    pub fn new(env: &Env) -> Result<Self, StoreError> {
        let mut wtxn = env.write_txn().map_err(storage)?;
        let records = env
            .create_database(&mut wtxn, Some(TRANS_DB))
            .map_err(storage)?;
        let due = env.create_database(&mut wtxn, Some(DUE_DB)).map_err(storage)?;
        wtxn.commit().map_err(storage)?;
        Ok(Self {
            env: env.clone(),
            records,
            due,
        })
    }

    fn reindex(
        &self,
        wtxn: &mut RwTxn,
        before: Option<(u64, &str)>,
        after: Option<(u64, &str)>,
    ) -> Result<(), StoreError> {
        if let Some(entry) = before {
            self.due.delete(wtxn, &due_key(entry)).map_err(storage)?;
        }
        if let Some(entry) = after {
            self.due.put(wtxn, &due_key(entry), &()).map_err(storage)?;
        }
        Ok(())
    }

    fn load_in(&self, txn: &heed::RoTxn, gid: &str) -> Result<Option<TransGlobal>, StoreError> {
        self.records
            .get(txn, gid)
            .map_err(storage)?
            .map(codec::decode)
            .transpose()
    }
}

impl TransStore for LmdbTransStore {
    fn create(&self, trans: &TransGlobal) -> Result<(), StoreError> {
        let bytes = codec::encode(trans)?;
        let mut wtxn = self.env.write_txn().map_err(storage)?;
        if self.records.get(&wtxn, &trans.gid).map_err(storage)?.is_some() {
            return Err(StoreError::AlreadyExists(trans.gid.clone()));
        }
        self.records
            .put(&mut wtxn, &trans.gid, &bytes)
            .map_err(storage)?;
        self.reindex(&mut wtxn, None, due_entry(trans))?;
        wtxn.commit().map_err(storage)
    }

    fn load(&self, gid: &str) -> Result<Option<TransGlobal>, StoreError> {
        let rtxn = self.env.read_txn().map_err(storage)?;
        self.load_in(&rtxn, gid)
    }

    fn save(&self, trans: &TransGlobal) -> Result<u64, StoreError> {
        let mut wtxn = self.env.write_txn().map_err(storage)?;
        let current = self
            .load_in(&wtxn, &trans.gid)?
            .ok_or_else(|| StoreError::NotFound(trans.gid.clone()))?;
        let version = check_save(&current, trans)?;

        let mut next = trans.clone();
        next.version = version;
        self.records
            .put(&mut wtxn, &trans.gid, &codec::encode(&next)?)
            .map_err(storage)?;
        self.reindex(&mut wtxn, due_entry(&current), due_entry(&next))?;
        wtxn.commit().map_err(storage)?;
        Ok(version)
    }

    fn claim_due(&self, now_millis: u64, lease_millis: u64, limit: usize) -> Result<Vec<TransGlobal>, StoreError> {
        let mut wtxn = self.env.write_txn().map_err(storage)?;
        let mut entries = Vec::new();
        for item in self.due.iter(&wtxn).map_err(storage)? {
            let (key, ()) = item.map_err(storage)?;
            let (at, gid) = split_due_key(key)?;
            if at > now_millis || entries.len() == limit {
                break;
            }
            entries.push((at, gid.to_string()));
        }

        let mut claimed = Vec::with_capacity(entries.len());
        for (at, gid) in entries {
            let Some(mut trans) = self.load_in(&wtxn, &gid)? else {
                self.reindex(&mut wtxn, Some((at, &gid)), None)?;
                continue;
            };
            trans.next_cron_time_millis = now_millis + lease_millis;
            trans.version += 1;
            self.records
                .put(&mut wtxn, &gid, &codec::encode(&trans)?)
                .map_err(storage)?;
            self.reindex(&mut wtxn, Some((at, &gid)), due_entry(&trans))?;
            claimed.push(trans);
        }
        wtxn.commit().map_err(storage)?;
        Ok(claimed)
    }

    fn list_unfinished(&self) -> Result<Vec<String>, StoreError> {
        let rtxn = self.env.read_txn().map_err(storage)?;
        let mut gids = Vec::new();
        for item in self.due.iter(&rtxn).map_err(storage)? {
            let (key, ()) = item.map_err(storage)?;
            gids.push(split_due_key(key)?.1.to_string());
        }
        gids.sort();
        Ok(gids)
    }
}

fn ledger_err(e: heed::Error) -> LedgerError {
    LedgerError::Storage(e.to_string().into())
}

/// Participant barrier ledger over LMDB.
///
/// Business tables opened in the same environment can be written through
/// [`LmdbTx::txn`], so they commit atomically with the barrier rows.
pub struct LmdbLedger {
    env: Env,
    barriers: Database<Str, Bytes>,
}

impl LmdbLedger {
    /// Open the barrier database, creating it if needed
    pub fn new(env: &Env) -> Result<Self, LedgerError> {
        let mut wtxn = env.write_txn().map_err(ledger_err)?;
        let barriers = env
            .create_database(&mut wtxn, Some(BARRIER_DB))
            .map_err(ledger_err)?;
        wtxn.commit().map_err(ledger_err)?;
        Ok(Self {
            env: env.clone(),
            barriers,
        })
    }

    /// Environment shared with business tables
    pub fn env(&self) -> &Env {
        &self.env
    }

    /// Committed row for a key
    pub fn row(&self, key: &BarrierKey) -> Result<Option<LedgerRow>, LedgerError> {
        let rtxn = self.env.read_txn().map_err(ledger_err)?;
        self.barriers
            .get(&rtxn, &key.encode())
            .map_err(ledger_err)?
            .map(decode_row)
            .transpose()
    }
}

fn decode_row(bytes: &[u8]) -> Result<LedgerRow, LedgerError> {
    serde_json::from_slice(bytes).map_err(|e| LedgerError::Storage(e.to_string().into()))
}

impl BarrierStore for LmdbLedger {
    type Tx<'a> = LmdbTx<'a> where Self: 'a;

    fn begin(&self) -> Result<Self::Tx<'_>, LedgerError> {
        Ok(LmdbTx {
            txn: self.env.write_txn().map_err(ledger_err)?,
            barriers: self.barriers,
        })
    }
}

/// Write transaction over an [`LmdbLedger`]'s environment.
///
/// Dropping it without `commit` aborts it.
pub struct LmdbTx<'e> {
    txn: RwTxn<'e>,
    barriers: Database<Str, Bytes>,
}

impl<'e> LmdbTx<'e> {
    /// Underlying write transaction, for business tables
    pub fn txn(&mut self) -> &mut RwTxn<'e> {
        &mut self.txn
    }
}

impl BarrierTx for LmdbTx<'_> {
    fn insert_barrier(&mut self, key: &BarrierKey, row: LedgerRow) -> Result<bool, LedgerError> {
        let encoded = key.encode();
        if self.barriers.get(&self.txn, &encoded).map_err(ledger_err)?.is_some() {
            return Ok(false);
        }
        let value = serde_json::to_vec(&row).map_err(|e| LedgerError::Storage(e.to_string().into()))?;
        self.barriers
            .put(&mut self.txn, &encoded, &value)
            .map_err(ledger_err)?;
        Ok(true)
    }

    fn barrier_row(&mut self, key: &BarrierKey) -> Result<Option<LedgerRow>, LedgerError> {
        self.barriers
            .get(&self.txn, &key.encode())
            .map_err(ledger_err)?
            .map(decode_row)
            .transpose()
    }
}

impl LocalTransaction for LmdbTx<'_> {
    fn commit(self) -> Result<(), LedgerError> {
        self.txn
            .commit()
            .map_err(|e| LedgerError::CommitFailed(e.to_string().into()))
    }

    fn rollback(self) -> Result<(), LedgerError> {
        self.txn.abort();
        Ok(())
    }
}
