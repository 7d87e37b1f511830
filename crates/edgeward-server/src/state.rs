use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::store::AdminId;

/// Held for the whole lifetime of one operation on an administrator
pub type AdminGuard = OwnedMutexGuard<()>;

/// Keyed locks serializing operations per administrator
///
/// Locks for different administrators are independent. Acquisition never waits: a second
/// operation while one is in flight is turned away.
#[derive(Default)]
pub struct AdminLocks {
    locks: DashMap<AdminId, Arc<Mutex<()>>>,
}

impl AdminLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the administrator's lock if nothing else holds it
    pub fn try_acquire(&self, admin_id: AdminId) -> Option<AdminGuard> {
        let lock = self
            .locks
            .entry(admin_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.try_lock_owned().ok()
    }
}
