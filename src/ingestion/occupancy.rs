use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::models::SectionId;

/// Per-section serialization points. Transitions touching a section take its
/// guard first, so entry/exit events for that section are globally ordered.
pub struct SectionLocks {
    locks: RwLock<HashMap<SectionId, Arc<Mutex<()>>>>,
}

impl Default for SectionLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl SectionLocks {
    pub fn new() -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, section_id: SectionId) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().await.get(&section_id) {
            return lock.clone();
        }
        let mut locks = self.locks.write().await;
        locks.entry(section_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Guard one or two sections for a transition. Guards are always taken in
    /// ascending section order so concurrent transitions cannot deadlock.
    pub async fn guard(
        &self,
        entering: SectionId,
        exiting: Option<SectionId>,
    ) -> Vec<OwnedMutexGuard<()>> {
        let mut ids = vec![entering];
        if let Some(exit) = exiting {
            if exit != entering {
                ids.push(exit);
            }
        }
        ids.sort_unstable();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let lock = self.lock_for(id).await;
            guards.push(lock.lock_owned().await);
        }
        guards
    }
}
