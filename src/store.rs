//! Transaction record storage
//!
//! The store is the single source of truth for global transaction state.
//! Writers never lock a record across a branch call; instead every `save` is
//! a compare-and-swap on [`TransGlobal::version`], so two dispatchers working
//! the same gid cannot interleave their writes.

use crate::{codec, StoreError, TransGlobal};
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

/// Transaction storage trait
pub trait TransStore: Send + Sync + 'static {
    /// Persist a new record together with its branch plan
    fn create(&self, trans: &TransGlobal) -> Result<(), StoreError>;

    /// Load a record by gid
    fn load(&self, gid: &str) -> Result<Option<TransGlobal>, StoreError>;

    /// Replace a record if its stored version equals `trans.version`.
    /// Returns the new version. Terminal records are immutable.
    fn save(&self, trans: &TransGlobal) -> Result<u64, StoreError>;

    /// Claim up to `limit` non-terminal records whose next cron time has
    /// passed, pushing their next cron time to `now + lease` so concurrent
    /// schedulers skip them. Returned records carry the bumped version.
    fn claim_due(&self, now_millis: u64, lease_millis: u64, limit: usize) -> Result<Vec<TransGlobal>, StoreError>;

    /// Gids of every non-terminal record
    fn list_unfinished(&self) -> Result<Vec<String>, StoreError>;
}

/// Shared CAS rule for stores holding encoded records
pub(crate) fn check_save(current: &TransGlobal, incoming: &TransGlobal) -> Result<u64, StoreError> {
    if current.status.is_terminal() {
        return Err(StoreError::Finished(current.gid.clone()));
    }
    if current.version != incoming.version {
        return Err(StoreError::VersionConflict {
            gid: incoming.gid.clone(),
            expected: incoming.version,
            actual: current.version,
        });
    }
    Ok(current.version + 1)
}

/// Schedule index entry of a record; terminal records have none
pub(crate) fn due_entry(trans: &TransGlobal) -> Option<(u64, &str)> {
    (!trans.status.is_terminal()).then_some((trans.next_cron_time_millis, trans.gid.as_str()))
}

#[derive(Default)]
struct Records {
    /// Encoded records by gid
    data: HashMap<String, Vec<u8>>,
    /// `(next_cron_time, gid)` of every non-terminal record
    due: BTreeSet<(u64, String)>,
}

impl Records {
    fn reindex(&mut self, before: Option<(u64, &str)>, after: Option<(u64, &str)>) {
        if let Some((at, gid)) = before {
            self.due.remove(&(at, gid.to_string()));
        }
        if let Some((at, gid)) = after {
            self.due.insert((at, gid.to_string()));
        }
    }
}

/// In-memory store for testing.
///
/// Records are kept encoded, so every load returns an independent copy just
/// as a durable store would. A schedule index keeps sweeps from decoding
/// finished records.
pub struct InMemoryTransStore {
    records: RwLock<Records>,
}

impl InMemoryTransStore {
    /// Empty store
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Records::default()),
        }
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.data.len()).unwrap_or(0)
    }

    /// Check if no record was ever created
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryTransStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Storage(e.to_string().into())
}

impl TransStore for InMemoryTransStore {
    fn create(&self, trans: &TransGlobal) -> Result<(), StoreError> {
        let bytes = codec::encode(trans)?;
        let mut records = self.records.write().map_err(poisoned)?;
        if records.data.contains_key(&trans.gid) {
            return Err(StoreError::AlreadyExists(trans.gid.clone()));
        }
        records.data.insert(trans.gid.clone(), bytes);
        records.reindex(None, due_entry(trans));
        Ok(())
    }

    fn load(&self, gid: &str) -> Result<Option<TransGlobal>, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        records.data.get(gid).map(|bytes| codec::decode(bytes)).transpose()
    }

    fn save(&self, trans: &TransGlobal) -> Result<u64, StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        let current = records
            .data
            .get(&trans.gid)
            .ok_or_else(|| StoreError::NotFound(trans.gid.clone()))
            .and_then(|bytes| codec::decode(bytes))?;
        let version = check_save(&current, trans)?;

        let mut next = trans.clone();
        next.version = version;
        records.data.insert(trans.gid.clone(), codec::encode(&next)?);
        records.reindex(due_entry(&current), due_entry(&next));
        Ok(version)
    }

    fn claim_due(&self, now_millis: u64, lease_millis: u64, limit: usize) -> Result<Vec<TransGlobal>, StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        let gids: Vec<String> = records
            .due
            .iter()
            .take_while(|(at, _)| *at <= now_millis)
            .take(limit)
            .map(|(_, gid)| gid.clone())
            .collect();

        let mut claimed = Vec::with_capacity(gids.len());
        for gid in gids {
            let Some(bytes) = records.data.get(&gid) else {
                continue;
            };
            let mut trans = codec::decode(bytes)?;
            let at = trans.next_cron_time_millis;
            trans.next_cron_time_millis = now_millis + lease_millis;
            trans.version += 1;
            records.data.insert(gid.clone(), codec::encode(&trans)?);
            records.reindex(Some((at, &gid)), due_entry(&trans));
            claimed.push(trans);
        }
        Ok(claimed)
    }

    fn list_unfinished(&self) -> Result<Vec<String>, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        let mut gids: Vec<String> = records.due.iter().map(|(_, gid)| gid.clone()).collect();
        gids.sort();
        Ok(gids)
    }
}
