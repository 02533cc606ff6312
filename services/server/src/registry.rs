//! Identity → pool registry.
//!
//! Pools are created on first reference and live for the lifetime of the
//! registry. Deregistration drains a pool but keeps its entry, so an agent
//! coming back under the same identity reuses it.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::pool::{Closable, Pool, DEFAULT_POOL_CAPACITY};

/// Point-in-time view of one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub identity: String,
    pub idle: usize,
    pub capacity: usize,
}

/// Registry of per-identity pools.
pub struct Registry<C> {
    pools: RwLock<HashMap<String, Arc<Pool<C>>>>,
    /// Capacity for newly created pools.
    capacity: usize,
}

impl<C: Closable> Registry<C> {
    /// Create a registry whose pools use the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY)
    }

    /// Create a registry whose pools hold at most `capacity` idle connections.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Get or create the pool for an identity.
    pub async fn get_or_create(&self, identity: &str) -> Arc<Pool<C>> {
        // Fast path: read lock
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(identity) {
                return Arc::clone(pool);
            }
        }

        // Slow path: write lock
        let mut pools = self.pools.write().await;
        pools
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Pool::with_capacity(identity, self.capacity)))
            .clone()
    }

    /// Get the pool for an identity (if it exists).
    pub async fn get(&self, identity: &str) -> Option<Arc<Pool<C>>> {
        let pools = self.pools.read().await;
        pools.get(identity).cloned()
    }

    /// Dequeue and close every idle connection of `identity`.
    ///
    /// Returns the number of connections closed.
    pub async fn deregister(&self, identity: &str) -> usize {
        let Some(pool) = self.get(identity).await else {
            return 0;
        };

        let drained = pool.drain();
        let closed = drained.len();
        join_all(drained.into_iter().map(Closable::close)).await;

        info!(identity = %identity, closed, "Identity deregistered");
        closed
    }

    /// Tear down every pool, closing idle connections.
    ///
    /// Returns the number of connections closed.
    pub async fn close_all(&self) -> usize {
        let pools: Vec<_> = self.pools.read().await.values().cloned().collect();

        let idle: Vec<C> = pools.iter().flat_map(|pool| pool.close()).collect();
        let closed = idle.len();
        join_all(idle.into_iter().map(Closable::close)).await;
        closed
    }

    /// Stats for every known identity, sorted by identity.
    pub async fn snapshot(&self) -> Vec<PoolStats> {
        let pools = self.pools.read().await;
        let mut stats: Vec<_> = pools
            .values()
            .map(|pool| PoolStats {
                identity: pool.identity().to_string(),
                idle: pool.idle_count(),
                capacity: pool.capacity(),
            })
            .collect();
        stats.sort_by(|a, b| a.identity.cmp(&b.identity));
        stats
    }

    /// All identities with a pool.
    pub async fn identities(&self) -> Vec<String> {
        let pools = self.pools.read().await;
        pools.keys().cloned().collect()
    }
}

impl<C: Closable> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}
