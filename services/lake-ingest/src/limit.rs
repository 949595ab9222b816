//! Process-wide rate limiting for vendor calls.
//!
//! The vendor enforces a hard per-minute cap per API method, per account.
//! Every fetch path must pass through [`RateLimitManager::acquire`] before
//! touching the network; the manager is a single shared instance because the
//! cap is per account, not per worker.
//!
//! Each task type gets its own bucket with a sliding 60-second window:
//! a call is admitted once fewer than `N` grants fall within the last 60
//! seconds. Waiters on the same bucket are served FIFO.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use lake_common::config::RateLimitConfig;

/// The rolling window the vendor budgets against.
const WINDOW: Duration = Duration::from_secs(60);

/// Errors from token acquisition. Acquisition itself never fails; only
/// cancellation interrupts a waiter, without consuming a token.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AcquireError {
    #[error("cancelled while waiting for a rate token")]
    Cancelled,
}

/// One task type's sliding-window budget.
#[derive(Debug)]
struct Bucket {
    name: String,
    capacity: u32,
    /// FIFO turn lock. Tokio mutexes queue waiters in acquisition order, so
    /// holding the turn while waiting for a slot keeps the bucket fair.
    turn: tokio::sync::Mutex<()>,
    /// Grant instants within the current window, oldest first.
    grants: Mutex<VecDeque<Instant>>,
}

impl Bucket {
    fn new(name: String, capacity: u32) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            turn: tokio::sync::Mutex::new(()),
            grants: Mutex::new(VecDeque::new()),
        }
    }

    /// Block until a token is granted, or the caller is cancelled.
    async fn acquire(&self, cancel: &CancellationToken) -> Result<(), AcquireError> {
        let _turn = tokio::select! {
            guard = self.turn.lock() => guard,
            () = cancel.cancelled() => return Err(AcquireError::Cancelled),
        };

        loop {
            let wait = {
                let mut grants = self.grants.lock().expect("rate bucket poisoned");
                let now = Instant::now();
                while grants
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= WINDOW)
                {
                    grants.pop_front();
                }

                if (grants.len() as u32) < self.capacity {
                    grants.push_back(now);
                    return Ok(());
                }

                // Window is full; sleep until the oldest grant ages out.
                let oldest = *grants.front().expect("full window has a front");
                WINDOW.saturating_sub(now.duration_since(oldest))
            };

            debug!(
                bucket = %self.name,
                wait_ms = wait.as_millis() as u64,
                "Rate window full, waiting for a slot"
            );

            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = cancel.cancelled() => return Err(AcquireError::Cancelled),
            }
        }
    }

    /// Grants currently inside the window.
    fn in_window(&self) -> usize {
        let mut grants = self.grants.lock().expect("rate bucket poisoned");
        let now = Instant::now();
        while grants
            .front()
            .is_some_and(|t| now.duration_since(*t) >= WINDOW)
        {
            grants.pop_front();
        }
        grants.len()
    }
}

/// Shared manager holding one bucket per task type.
///
/// Buckets are created lazily from configuration on first use.
#[derive(Debug)]
pub struct RateLimitManager {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Arc<Bucket>>>,
}

impl RateLimitManager {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn bucket(&self, task_name: &str) -> Arc<Bucket> {
        let mut buckets = self.buckets.lock().expect("bucket map poisoned");
        if let Some(bucket) = buckets.get(task_name) {
            return Arc::clone(bucket);
        }
        let capacity = self.config.budget_for(task_name);
        debug!(task = task_name, capacity, "Created rate bucket");
        let bucket = Arc::new(Bucket::new(task_name.to_string(), capacity));
        buckets.insert(task_name.to_string(), Arc::clone(&bucket));
        bucket
    }

    /// Acquire a token for a task type, waiting as long as needed.
    ///
    /// Cancellation while waiting returns without consuming a token.
    pub async fn acquire(
        &self,
        task_name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AcquireError> {
        self.bucket(task_name).acquire(cancel).await
    }

    /// Configured budget for a task type.
    pub fn budget_for(&self, task_name: &str) -> u32 {
        self.config.budget_for(task_name)
    }

    /// Grants currently in the window, for monitoring and tests.
    pub fn in_window(&self, task_name: &str) -> usize {
        self.bucket(task_name).in_window()
    }
}
