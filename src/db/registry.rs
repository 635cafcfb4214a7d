//! Shared connection-pool registry.
//!
//! Several client handles in one process may point at the same endpoint. The
//! registry maps a password-free endpoint identity to one lazily created
//! pool with a reference count: `acquire` creates the pool on first use and
//! bumps the count otherwise, `release` decrements and closes the pool when
//! the count reaches zero. The registry is an explicit object handed to each
//! client handle; there is no hidden process-global state.

use crate::config::PoolSettings;
use sqlx::PgPool;
use sqlx::postgres::PgConnectOptions;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

struct PoolEntry {
    pool: PgPool,
    refcount: usize,
}

/// Registry of shared, refcounted connection pools.
#[derive(Default)]
pub struct PoolRegistry {
    pools: RwLock<HashMap<String, PoolEntry>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the pool for an endpoint identity, creating it lazily on
    /// first acquisition. No connection is opened here; the pool dials out
    /// on first use.
    pub async fn acquire(
        self: &Arc<Self>,
        key: &str,
        options: PgConnectOptions,
        settings: &PoolSettings,
    ) -> PoolHandle {
        let mut pools = self.pools.write().await;
        let entry = pools.entry(key.to_string()).or_insert_with(|| {
            debug!(endpoint = %key, "Creating shared connection pool");
            PoolEntry {
                pool: settings.pool_options().connect_lazy_with(options),
                refcount: 0,
            }
        });
        entry.refcount += 1;
        debug!(endpoint = %key, refcount = entry.refcount, "Acquired shared pool");
        PoolHandle {
            registry: Arc::clone(self),
            key: key.to_string(),
            pool: entry.pool.clone(),
            released: false,
        }
    }

    /// Number of live pools.
    pub async fn pool_count(&self) -> usize {
        self.pools.read().await.len()
    }

    /// Current reference count for an endpoint, if its pool exists.
    pub async fn refcount(&self, key: &str) -> Option<usize> {
        self.pools.read().await.get(key).map(|entry| entry.refcount)
    }

    async fn release(&self, key: &str) {
        // Decide under the lock, close outside it.
        let to_close = {
            let mut pools = self.pools.write().await;
            match pools.get_mut(key) {
                Some(entry) if entry.refcount > 1 => {
                    entry.refcount -= 1;
                    debug!(endpoint = %key, refcount = entry.refcount, "Released shared pool");
                    None
                }
                Some(_) => pools.remove(key).map(|entry| entry.pool),
                None => {
                    warn!(endpoint = %key, "Release for unknown pool - extra release call");
                    None
                }
            }
        };

        if let Some(pool) = to_close {
            info!(endpoint = %key, "Closing shared connection pool");
            pool.close().await;
        }
    }
}

/// Counted handle to a shared pool.
///
/// Prefer explicit [`release`](PoolHandle::release); the `Drop` fallback
/// spawns a task so the count still reaches the registry on early exits.
pub struct PoolHandle {
    registry: Arc<PoolRegistry>,
    key: String,
    pool: PgPool,
    released: bool,
}

impl PoolHandle {
    /// The shared pool this handle counts toward.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Release the handle, closing the pool if this was the last one.
    pub async fn release(mut self) {
        self.released = true;
        self.registry.release(&self.key).await;
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let registry = Arc::clone(&self.registry);
        let key = self.key.clone();
        tokio::spawn(async move {
            registry.release(&key).await;
            warn!(endpoint = %key, "Pool handle released via Drop - prefer explicit release()");
        });
    }
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}
