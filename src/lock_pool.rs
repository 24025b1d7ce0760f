use std::hash::BuildHasherDefault;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use rustc_hash::FxHasher;

/// Per-feature update locks plus the bias lock.
///
/// A lock only serializes the FTRL update of one unit's parameters; unit
/// creation is handled by the model's own maps. One mutex is kept per
/// distinct feature key for the lifetime of the pool, so memory grows with
/// feature cardinality.
pub struct LockPool {
    locks: DashMap<String, Arc<Mutex<()>>, BuildHasherDefault<FxHasher>>,
    bias_lock: Arc<Mutex<()>>,
}

impl LockPool {
    pub fn new() -> LockPool {
        LockPool {
            locks: DashMap::with_hasher(BuildHasherDefault::default()),
            bias_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn lock_for(&self, feature: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(feature) {
            return Arc::clone(lock.value());
        }
        let lock = self
            .locks
            .entry(feature.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(lock.value())
    }

    pub fn bias_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.bias_lock)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }
}

impl Default for LockPool {
    fn default() -> Self {
        LockPool::new()
    }
}
