//! Process-wide pool registry
//!
//! Keyed map of live pools holding weak references, so a pool's lifetime
//! stays with its strong handles. Lookups upgrade under the lock and
//! evict entries whose pool already wound down; dropping the registry
//! closes and joins everything that is still alive.

use crate::config::PoolConfig;
use crate::pool::{self, PoolHandle, WeakPoolHandle};
use fibra_core::{PoolId, PoolResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

pub struct Runtime {
    pools: Mutex<HashMap<PoolId, WeakPoolHandle>>,
}

impl Runtime {
    pub fn new() -> Runtime {
        Runtime {
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide registry
    pub fn global() -> &'static Runtime {
        static GLOBAL: OnceLock<Runtime> = OnceLock::new();
        GLOBAL.get_or_init(Runtime::new)
    }

    /// Validate the config, start a pool and register it
    pub fn spawn_pool(&self, config: &PoolConfig) -> PoolResult<PoolHandle> {
        let id = PoolId::new(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed));
        let handle = pool::spawn_pool(config, id)?;
        self.pools.lock().unwrap().insert(id, handle.downgrade());
        Ok(handle)
    }

    /// Upgrade a pool id to a strong handle, evicting dead entries
    pub fn query_pool_by_id(&self, id: PoolId) -> Option<PoolHandle> {
        let mut pools = self.pools.lock().unwrap();
        match pools.get(&id).and_then(|weak| weak.upgrade()) {
            Some(handle) if !handle.shared().has_joined() => Some(handle),
            _ => {
                pools.remove(&id);
                None
            }
        }
    }

    /// All live pools that opted into visibility
    pub fn query_all_pools(&self) -> Vec<PoolHandle> {
        let mut pools = self.pools.lock().unwrap();
        let mut result = Vec::new();
        pools.retain(|_, weak| match weak.upgrade() {
            Some(handle) if !handle.shared().has_joined() => {
                if handle.is_public() {
                    result.push(handle);
                }
                true
            }
            _ => false,
        });
        result
    }

    /// Registered pools that are still alive (any visibility)
    pub fn len(&self) -> usize {
        let mut pools = self.pools.lock().unwrap();
        pools.retain(|_, weak| weak.upgrade().is_some());
        pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // Close-on-drop: every pool still alive is asked to wind down
        // and joined before the map goes away
        let pools: Vec<PoolHandle> = self
            .pools
            .lock()
            .unwrap()
            .drain()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect();
        for handle in pools {
            handle.request_close();
            handle.join();
        }
    }
}
