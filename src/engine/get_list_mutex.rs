use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Per-`(scope, type)` coordination between GET and LIST work.
///
/// Any number of GETs may run concurrently, a LIST runs exclusively, and a
/// waiting LIST blocks GETs that arrive after it. The LIST then populates the
/// cache, so the queued GETs are served from it instead of hitting the
/// backend. SEARCH never participates; its cache entries are independent.
///
/// Built on tokio's fair `RwLock`: readers arriving after a queued writer
/// wait behind it, which is exactly the ordering required here.
#[derive(Default)]
pub struct GetListMutex {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl GetListMutex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, scope: &str, item_type: &str) -> Arc<RwLock<()>> {
        let key = format!("{scope}.{item_type}");
        let mut locks = self.locks.lock().unwrap();
        Arc::clone(locks.entry(key).or_default())
    }

    /// Holds for the duration of a GET. Many may be held at once.
    pub async fn lock_get(&self, scope: &str, item_type: &str) -> OwnedRwLockReadGuard<()> {
        self.lock_for(scope, item_type).read_owned().await
    }

    /// Holds for the duration of a LIST, exclusively.
    pub async fn lock_list(&self, scope: &str, item_type: &str) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(scope, item_type).write_owned().await
    }
}
