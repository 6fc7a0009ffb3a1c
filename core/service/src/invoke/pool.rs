// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Runs at most `size` tasks at a time.
#[derive(Debug)]
pub struct WorkerPool {
    size: usize,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    last_used: Mutex<Instant>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        WorkerPool {
            size,
            permits: Arc::new(Semaphore::new(size)),
            shutdown: CancellationToken::new(),
            last_used: Mutex::new(Instant::now()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a task. The handle yields `None` when the pool was shut down
    /// before the task could complete.
    pub fn submit<F, T>(&self, task: F) -> JoinHandle<Option<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permits = self.permits.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let _permit = tokio::select! {
                _ = shutdown.cancelled() => return None,
                permit = permits.acquire_owned() => permit.ok()?,
            };

            tokio::select! {
                _ = shutdown.cancelled() => None,
                out = task => Some(out),
            }
        })
    }

    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    /// Interrupt every queued and running task.
    pub fn shutdown_now(&self) {
        self.shutdown.cancel();
        self.permits.close();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Worker pools shared between batches, keyed by size.
pub struct PoolCache {
    pools: Mutex<HashMap<usize, Arc<WorkerPool>>>,
    idle_timeout: Duration,
    sweeper: CancellationToken,
}

impl PoolCache {
    pub fn new(idle_timeout: Duration) -> Self {
        PoolCache {
            pools: Mutex::new(HashMap::new()),
            idle_timeout,
            sweeper: CancellationToken::new(),
        }
    }

    pub fn get(&self, size: usize) -> Arc<WorkerPool> {
        let size = size.max(1);
        let mut pools = self.pools.lock();

        if let Some(pool) = pools.get(&size) {
            if !pool.is_shutdown() {
                pool.touch();
                return pool.clone();
            }
        }

        let pool = Arc::new(WorkerPool::new(size));
        pools.insert(size, pool.clone());
        info!(%size, "worker pool created");
        pool
    }

    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.lock().is_empty()
    }

    /// Shut down pools idle for longer than the idle timeout. A pool still
    /// held by a running batch is kept. Returns the number of evicted pools.
    pub fn sweep(&self) -> usize {
        let evicted: Vec<_> = {
            let mut pools = self.pools.lock();
            let expired: Vec<usize> = pools
                .iter()
                .filter(|(_, p)| Arc::strong_count(p) == 1 && p.idle_for() > self.idle_timeout)
                .map(|(size, _)| *size)
                .collect();
            expired
                .into_iter()
                .filter_map(|size| pools.remove(&size))
                .collect()
        };

        for pool in &evicted {
            pool.shutdown_now();
            info!(size = pool.size(), "idle worker pool shut down");
        }
        evicted.len()
    }

    /// Sweep every `interval` until [`PoolCache::shutdown_now`].
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let cache: Weak<PoolCache> = Arc::downgrade(self);
        let cancel = self.sweeper.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("pool sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else {
                            break;
                        };
                        let evicted = cache.sweep();
                        debug!(%evicted, "pool sweep");
                    }
                }
            }
        });
    }

    /// Stop the sweeper and interrupt every pool.
    pub fn shutdown_now(&self) {
        self.sweeper.cancel();
        let pools: Vec<_> = self.pools.lock().drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.shutdown_now();
        }
    }
}

impl Drop for PoolCache {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}
