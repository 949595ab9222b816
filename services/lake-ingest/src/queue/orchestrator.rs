//! Wiring of the plan → download → persist pipeline.
//!
//! The orchestrator owns the three worker pools and the dispatcher they
//! share. A completed download enqueues its paired persist onto SLOW under
//! the same correlation id before the download itself is marked done, so the
//! pairing is never lost, and SLOW's single FIFO worker preserves the plan's
//! enumeration order for persists of the same dataset.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use lake_common::config::Config;

use super::planner::Planner;
use super::store::TaskStore;
use super::task::{MaintKind, QueueName, Task, TaskError, TaskKind};
use super::worker::{QueueStats, TaskHandler, WorkerPool};
use crate::catalog::{Catalog, UpdateStrategy};
use crate::fetch::FetcherBuilder;
use crate::limit::RateLimitManager;
use crate::store::DatasetStore;
use crate::vendor::VendorApi;

/// Per-queue success/fail counts reported at shutdown.
#[derive(Debug)]
pub struct ExitSummary {
    pub per_queue: Vec<(QueueName, u64, u64)>,
    pub dead_letters: u64,
    pub cancelled: bool,
}

impl std::fmt::Display for ExitSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (queue, succeeded, failed) in &self.per_queue {
            write!(f, "{queue}: {succeeded} ok / {failed} failed; ")?;
        }
        write!(f, "dead letters: {}", self.dead_letters)?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

/// Executes tasks on behalf of every worker pool.
struct Dispatcher {
    catalog: Arc<Catalog>,
    limiter: Arc<RateLimitManager>,
    lake: Arc<DatasetStore>,
    vendor: Arc<dyn VendorApi>,
    fetchers: FetcherBuilder,
    planner: Planner,
    queue_store: Arc<TaskStore>,
    notifies: HashMap<QueueName, Arc<Notify>>,
    cancel: CancellationToken,
    max_attempts: u32,
    persist_max_attempts: u32,
    /// Fixed range end for deterministic runs; `None` uses the local date.
    today_override: Option<NaiveDate>,
}

impl Dispatcher {
    fn today(&self) -> NaiveDate {
        self.today_override
            .unwrap_or_else(|| Local::now().date_naive())
    }

    fn notify(&self, queue: QueueName) {
        if let Some(notify) = self.notifies.get(&queue) {
            notify.notify_waiters();
        }
    }

    async fn handle_plan(&self, task: &Task) -> Result<(), TaskError> {
        let outcome = self.planner.expand(&task.task_name, self.today())?;
        for download in &outcome.downloads {
            self.queue_store
                .enqueue(download)
                .await
                .map_err(|e| TaskError::transient("enqueue", e))?;
        }
        if !outcome.downloads.is_empty() {
            self.notify(QueueName::Fast);
        }
        Ok(())
    }

    async fn handle_download(&self, task: &Task) -> Result<(), TaskError> {
        let fetcher = self.fetchers.build(&task.task_name, &task.params)?;
        let frame = fetcher
            .call(&self.limiter, self.vendor.as_ref(), &self.cancel)
            .await?;

        // Empty payloads still persist, so the correlation stays observable.
        let persist = Task::persist(task, frame);
        self.queue_store
            .enqueue(&persist)
            .await
            .map_err(|e| TaskError::transient("enqueue", e))?;
        self.notify(QueueName::Slow);
        Ok(())
    }

    async fn handle_persist(&self, task: &Task) -> Result<(), TaskError> {
        let Some(payload) = &task.payload else {
            return Err(TaskError::permanent("missing_payload", "persist task without payload"));
        };
        let outcome = self
            .lake
            .persist(&task.task_name, payload)
            .map_err(|e| TaskError::transient("write_failed", e))?;
        info!(
            dataset = %task.task_name,
            correlation_id = %task.correlation_id,
            strategy = ?outcome.strategy,
            rows = outcome.rows,
            "Persisted payload"
        );
        Ok(())
    }

    async fn handle_maintenance(&self, task: &Task) -> Result<(), TaskError> {
        let kind = MaintKind::parse(&task.task_name)
            .ok_or_else(|| TaskError::permanent("unknown_maintenance", &task.task_name))?;

        match kind {
            MaintKind::RebuildManifest => {
                self.lake
                    .rebuild_manifest()
                    .map_err(|e| TaskError::transient("maintenance", e))?;
            }
            MaintKind::Compact => {
                for dataset in self.catalog.dataset_names() {
                    let descriptor = self
                        .catalog
                        .get(dataset)
                        .map_err(|e| TaskError::permanent("unknown_task", e))?;
                    if descriptor.update_strategy != UpdateStrategy::Incremental {
                        continue;
                    }
                    if let Err(err) = self.lake.compact(dataset) {
                        warn!(dataset, error = %err, "Compaction failed, continuing");
                    }
                }
                self.lake
                    .sweep()
                    .map_err(|e| TaskError::transient("maintenance", e))?;
            }
            MaintKind::Sweep => {
                self.lake
                    .sweep()
                    .map_err(|e| TaskError::transient("maintenance", e))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for Dispatcher {
    async fn handle(&self, task: &Task) -> Result<(), TaskError> {
        match task.kind {
            TaskKind::Plan => self.handle_plan(task).await,
            TaskKind::Download => self.handle_download(task).await,
            TaskKind::Persist => self.handle_persist(task).await,
            TaskKind::Maintenance => self.handle_maintenance(task).await,
        }
    }

    fn max_attempts(&self, kind: TaskKind) -> u32 {
        match kind {
            TaskKind::Download | TaskKind::Plan => self.max_attempts,
            TaskKind::Persist => self.persist_max_attempts,
            TaskKind::Maintenance => 1,
        }
    }
}

/// The assembled pipeline.
pub struct Orchestrator {
    queue_store: Arc<TaskStore>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    fast_workers: usize,
    base_delay_ms: u64,
    notifies: HashMap<QueueName, Arc<Notify>>,
    stats: HashMap<QueueName, Arc<QueueStats>>,
    pools: Vec<WorkerPool>,
}

impl Orchestrator {
    /// Build the component graph. Construction is explicit: every
    /// collaborator arrives through here, nothing is looked up at runtime.
    pub fn new(
        config: &Config,
        catalog: Arc<Catalog>,
        limiter: Arc<RateLimitManager>,
        lake: Arc<DatasetStore>,
        vendor: Arc<dyn VendorApi>,
        queue_store: Arc<TaskStore>,
        cancel: CancellationToken,
    ) -> Self {
        let notifies: HashMap<QueueName, Arc<Notify>> = QueueName::ALL
            .iter()
            .map(|&q| (q, Arc::new(Notify::new())))
            .collect();
        let stats: HashMap<QueueName, Arc<QueueStats>> = QueueName::ALL
            .iter()
            .map(|&q| (q, Arc::new(QueueStats::default())))
            .collect();

        let planner = Planner::new(
            Arc::clone(&catalog),
            Arc::clone(&lake),
            config.planner.clone(),
        );

        let dispatcher = Arc::new(Dispatcher {
            catalog: Arc::clone(&catalog),
            limiter,
            lake,
            vendor,
            fetchers: FetcherBuilder::new(catalog),
            planner,
            queue_store: Arc::clone(&queue_store),
            notifies: notifies.clone(),
            cancel: cancel.clone(),
            max_attempts: config.retry.max_attempts,
            persist_max_attempts: config.retry.persist_max_attempts,
            today_override: None,
        });

        Self {
            queue_store,
            dispatcher,
            cancel,
            fast_workers: config.queues.fast_workers.max(1),
            base_delay_ms: config.retry.base_delay_ms,
            notifies,
            stats,
            pools: Vec::new(),
        }
    }

    /// Pin the planning range end, for deterministic runs.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        let dispatcher = Arc::get_mut(&mut self.dispatcher)
            .expect("with_today must be called before start");
        dispatcher.today_override = Some(today);
        self
    }

    /// Recover leftover tasks and start the worker pools.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        self.queue_store.recover().await?;

        for (queue, workers) in [
            (QueueName::Fast, self.fast_workers),
            (QueueName::Slow, 1),
            (QueueName::Maint, 1),
        ] {
            self.pools.push(WorkerPool::spawn(
                queue,
                workers,
                Arc::clone(&self.queue_store),
                Arc::clone(&self.dispatcher) as Arc<dyn TaskHandler>,
                self.base_delay_ms,
                self.cancel.clone(),
                Arc::clone(&self.notifies[&queue]),
                Arc::clone(&self.stats[&queue]),
            ));
        }
        Ok(())
    }

    /// Submit a plan for a task group. Returns the plan's correlation id.
    pub async fn submit_plan(&self, group: &str) -> anyhow::Result<Uuid> {
        let task = Task::plan(group);
        let correlation_id = task.correlation_id;
        self.queue_store.enqueue(&task).await?;
        self.notifies[&QueueName::Slow].notify_waiters();
        info!(group, correlation_id = %correlation_id, "Plan submitted");
        Ok(correlation_id)
    }

    /// Submit a maintenance operation.
    pub async fn submit_maintenance(&self, kind: MaintKind) -> anyhow::Result<Uuid> {
        let task = Task::maintenance(kind);
        let correlation_id = task.correlation_id;
        self.queue_store.enqueue(&task).await?;
        self.notifies[&QueueName::Maint].notify_waiters();
        info!(kind = kind.as_str(), correlation_id = %correlation_id, "Maintenance submitted");
        Ok(correlation_id)
    }

    /// Flip the process-wide cancel signal.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait until every queue is empty, or cancellation is observed.
    pub async fn run_until_drained(&self) -> anyhow::Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            if self.queue_store.pending_total().await? == 0 {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Stop the pools and collect the exit summary. Pending tasks stay in
    /// the durable store for the next run.
    pub async fn shutdown(mut self) -> anyhow::Result<ExitSummary> {
        let cancelled = self.cancel.is_cancelled();
        self.cancel.cancel();
        for pool in self.pools.drain(..) {
            pool.join().await;
        }

        let summary = ExitSummary {
            per_queue: QueueName::ALL
                .iter()
                .map(|&q| {
                    let stats = &self.stats[&q];
                    (q, stats.succeeded(), stats.failed())
                })
                .collect(),
            dead_letters: self.queue_store.dead_letters().await?.len() as u64,
            cancelled,
        };
        info!(summary = %summary, "Orchestrator stopped");
        Ok(summary)
    }

    /// The durable store, for inspection.
    pub fn queue_store(&self) -> &Arc<TaskStore> {
        &self.queue_store
    }
}
