//! Bot worker pool.
//!
//! Each worker is one authenticated MTProto session backed by one bot token.
//! HTTP requests lease a worker for the lifetime of a single response;
//! leases are counted as per-worker pressure so the pool can spread
//! sustained load while still giving the currently hot worker enough
//! locality to keep its upstream session caches warm.
//!
//! # Dispatch policy
//!
//! - **Sticky**: within [`REBALANCE_WINDOW_SECS`](crate::config::REBALANCE_WINDOW_SECS)
//!   of the last rebalance every `hire` returns the same worker.
//! - **Rebalance**: once the window elapses, the next `hire` picks the
//!   worker with minimum pressure (first found on ties, early exit on an
//!   idle worker) and restarts the window.
//!
//! Releases happen in [`WorkerLease::drop`], so a lease is returned exactly
//! once on every exit path, including mid-stream client disconnects.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use grammers_client::{Client, Config as ClientConfig, InitParams};
use grammers_session::Session;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::Config;

/// One authenticated upstream session.
pub struct BotWorker {
    pub client: Client,
    /// Self-reported identity, populated once after sign-in.
    pub username: String,
    /// At most one worker per pool is default; it owns incoming-message
    /// dispatch. Unrelated to leasing.
    pub is_default: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("no bot workers available in the pool")]
    NoWorkers,
}

struct PoolState {
    /// In-flight lease count per worker, indexed like `workers`.
    pressure: Vec<u32>,
    /// Index of the currently preferred worker.
    running_index: usize,
    /// When the last rebalance happened.
    timer: Instant,
}

/// Leaseable set of workers. Generic over the worker type so the dispatch
/// policy can be exercised without live sessions.
pub struct WorkerPool<W = BotWorker> {
    workers: Vec<Arc<W>>,
    rebalance_window: Duration,
    state: Mutex<PoolState>,
}

impl<W> WorkerPool<W> {
    pub fn new(workers: Vec<Arc<W>>, rebalance_window: Duration) -> Self {
        let len = workers.len();
        Self {
            workers,
            rebalance_window,
            state: Mutex::new(PoolState {
                pressure: vec![0; len],
                running_index: 0,
                timer: Instant::now(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn workers(&self) -> &[Arc<W>] {
        &self.workers
    }

    /// Reserve a worker for the duration of one response.
    pub fn hire(self: &Arc<Self>) -> Result<WorkerLease<W>, PoolError> {
        if self.workers.is_empty() {
            return Err(PoolError::NoWorkers);
        }
        let mut state = self.state.lock().expect("pool mutex poisoned");
        let index = if state.timer.elapsed() < self.rebalance_window {
            state.running_index
        } else {
            let mut best = 0;
            let mut min_pressure = state.pressure[0];
            for (i, &pressure) in state.pressure.iter().enumerate() {
                if pressure < min_pressure {
                    min_pressure = pressure;
                    best = i;
                }
                if min_pressure == 0 {
                    break;
                }
            }
            state.timer = Instant::now();
            state.running_index = best;
            best
        };
        state.pressure[index] += 1;
        Ok(WorkerLease {
            pool: Arc::clone(self),
            index,
        })
    }

    fn release(&self, index: usize) {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        if state.pressure[index] > 0 {
            state.pressure[index] -= 1;
        }
    }

    #[cfg(test)]
    fn pressures(&self) -> Vec<u32> {
        self.state.lock().unwrap().pressure.clone()
    }
}

impl WorkerPool<BotWorker> {
    /// The worker that owns incoming-message dispatch, if it came up.
    pub fn default_worker(&self) -> Option<&Arc<BotWorker>> {
        self.workers.iter().find(|w| w.is_default)
    }
}

/// Reserved claim on one worker, accounted as pressure until dropped.
pub struct WorkerLease<W = BotWorker> {
    pool: Arc<WorkerPool<W>>,
    index: usize,
}

impl<W> WorkerLease<W> {
    pub fn worker(&self) -> &W {
        &self.pool.workers[self.index]
    }
}

impl WorkerLease<BotWorker> {
    pub fn client(&self) -> &Client {
        &self.worker().client
    }
}

impl<W> Drop for WorkerLease<W> {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

// ============================================================================
// Startup
// ============================================================================

/// Connect and authenticate one worker per configured bot token.
///
/// Workers come up concurrently; individual failures are logged and the
/// worker is skipped. Worker 0 is the default worker. The caller treats an
/// empty result as fatal.
pub async fn spawn_workers(cfg: &Config) -> Vec<Arc<BotWorker>> {
    let mut set = JoinSet::new();
    for (index, token) in cfg.bot_tokens.iter().cloned().enumerate() {
        let api_id = cfg.api_id;
        let api_hash = cfg.api_hash.clone();
        set.spawn(async move {
            (index, start_worker(api_id, api_hash, token, index == 0).await)
        });
    }

    let mut slots: Vec<Option<Arc<BotWorker>>> = vec![None; cfg.bot_tokens.len()];
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, Ok(worker))) => {
                info!(
                    worker = index,
                    username = %worker.username,
                    is_default = worker.is_default,
                    "bot worker started"
                );
                slots[index] = Some(Arc::new(worker));
            }
            Ok((index, Err(error))) => {
                error!(worker = index, error = %error, "failed to start bot worker");
            }
            Err(error) => {
                error!(error = %error, "bot worker task panicked");
            }
        }
    }
    slots.into_iter().flatten().collect()
}

async fn start_worker(
    api_id: i32,
    api_hash: String,
    token: String,
    is_default: bool,
) -> anyhow::Result<BotWorker> {
    let client = Client::connect(ClientConfig {
        session: Session::new(),
        api_id,
        api_hash,
        params: InitParams::default(),
    })
    .await
    .map_err(|e| anyhow!("failed to connect: {e}"))?;

    if !client
        .is_authorized()
        .await
        .map_err(|e| anyhow!("authorization check failed: {e}"))?
    {
        client
            .bot_sign_in(&token)
            .await
            .map_err(|e| anyhow!("bot sign-in failed: {e}"))?;
    }

    let me = client
        .get_me()
        .await
        .map_err(|e| anyhow!("get_me failed: {e}"))?;
    let username = me.username().unwrap_or_default().to_string();

    Ok(BotWorker {
        client,
        username,
        is_default,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(n: usize, window: Duration) -> Arc<WorkerPool<usize>> {
        let workers = (0..n).map(Arc::new).collect();
        Arc::new(WorkerPool::new(workers, window))
    }

    #[test]
    fn test_hire_on_empty_pool_fails() {
        let pool = test_pool(0, Duration::from_secs(30));
        assert_eq!(pool.hire().err(), Some(PoolError::NoWorkers));
    }

    #[test]
    fn test_sticky_mode_reuses_running_worker() {
        let pool = test_pool(3, Duration::from_secs(3600));
        let leases: Vec<_> = (0..5).map(|_| pool.hire().unwrap()).collect();
        assert_eq!(pool.pressures(), vec![5, 0, 0]);
        drop(leases);
        assert_eq!(pool.pressures(), vec![0, 0, 0]);
    }

    #[test]
    fn test_rebalance_picks_minimum_pressure() {
        // Zero window: every hire runs the rebalance scan.
        let pool = test_pool(3, Duration::ZERO);
        let _a = pool.hire().unwrap();
        let _b = pool.hire().unwrap();
        let _c = pool.hire().unwrap();
        assert_eq!(pool.pressures(), vec![1, 1, 1]);

        // All equal: first worker wins the tie, and the next hire after it
        // must land on a minimum-pressure worker again.
        let _d = pool.hire().unwrap();
        assert_eq!(pool.pressures(), vec![2, 1, 1]);
        let _e = pool.hire().unwrap();
        let pressures = pool.pressures();
        assert_eq!(pressures.iter().sum::<u32>(), 5);
        assert_eq!(*pressures.iter().min().unwrap(), 1);
    }

    #[test]
    fn test_pressure_matches_outstanding_leases() {
        let pool = test_pool(2, Duration::ZERO);
        let mut leases: Vec<_> = (0..6).map(|_| pool.hire().unwrap()).collect();
        assert_eq!(pool.pressures().iter().sum::<u32>(), 6);
        leases.truncate(2);
        assert_eq!(pool.pressures().iter().sum::<u32>(), 2);
        drop(leases);
        assert_eq!(pool.pressures().iter().sum::<u32>(), 0);
    }

    #[test]
    fn test_release_clamps_at_zero() {
        let pool = test_pool(1, Duration::ZERO);
        pool.release(0);
        assert_eq!(pool.pressures(), vec![0]);
        let lease = pool.hire().unwrap();
        drop(lease);
        pool.release(0);
        assert_eq!(pool.pressures(), vec![0]);
    }

    #[test]
    fn test_lease_exposes_worker() {
        let pool = test_pool(2, Duration::from_secs(3600));
        let lease = pool.hire().unwrap();
        assert_eq!(*lease.worker(), 0);
    }
}
