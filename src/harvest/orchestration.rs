//! Orchestration layer for the image harvester
//!
//! This module provides a task orchestrator that:
//! 1. Turns the category catalog into `(category, class)` tasks
//! 2. Runs up to `W` tasks at once, each on a session borrowed from the pool
//! 3. Chains scrape and download per task and reports one outcome per task
//! 4. Stops dispatching on shutdown and aborts in-flight work when shutdown is forced

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{error, info, instrument, warn, Instrument};

use crate::harvest::browser::BrowserSession;
use crate::harvest::config_loader::CategoryCatalog;
use crate::harvest::download_engine::DownloadEngine;
use crate::harvest::fetcher::ImageSource;
use crate::harvest::logger::log_task_report;
use crate::harvest::scraper::{ClassScraper, ScrapeContext, ScrapeStatus, StopReason};
use crate::harvest::session_pool::SessionPool;

/// Error types for the orchestration layer
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Config error: {0}")]
    Config(String),
}

/// Result type for orchestration operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// One class of one category
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassTask {
    pub category: String,
    pub class_name: String,
}

impl ClassTask {
    pub fn new(category: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            class_name: class_name.into(),
        }
    }
}

impl fmt::Display for ClassTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.class_name)
    }
}

/// Flattens the catalog into tasks, keeping only `categories` when it is non-empty
pub fn build_tasks(catalog: &CategoryCatalog, categories: &[String]) -> Vec<ClassTask> {
    for wanted in categories {
        if !catalog.contains_key(wanted) {
            warn!("Category '{}' not found in catalog", wanted);
        }
    }

    catalog
        .iter()
        .filter(|(category, _)| categories.is_empty() || categories.contains(category))
        .flat_map(|(category, classes)| {
            classes
                .iter()
                .map(move |class_name| ClassTask::new(category.as_str(), class_name.as_str()))
        })
        .collect()
}

/// Cooperative cancellation shared by every task.
/// `request` asks work to wind down, `force` asks the orchestrator to abort it.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    requested: Arc<AtomicBool>,
    forced: Arc<AtomicBool>,
    force_notify: Arc<Notify>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn force(&self) {
        self.request();
        self.forced.store(true, Ordering::SeqCst);
        self.force_notify.notify_waiters();
    }

    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }

    /// Resolves once `force` has been called
    pub async fn forced(&self) {
        loop {
            let notified = self.force_notify.notified();
            if self.is_forced() {
                return;
            }
            notified.await;
        }
    }
}

/// First Ctrl-C requests shutdown. A second one, or the grace period running out, forces it.
pub fn spawn_signal_listener(shutdown: ShutdownSignal, grace: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        warn!("Shutdown requested, finishing current steps (press Ctrl-C again to force)");
        shutdown.request();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => warn!("Second interrupt received, forcing shutdown"),
            _ = sleep(grace) => warn!("Shutdown grace period of {:?} elapsed, forcing shutdown", grace),
        }
        shutdown.force();
    })
}

/// Terminal state of one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded { found: usize, saved: usize },
    Partial { reason: StopReason, found: usize, saved: usize },
    Failed(String),
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct TaskReport {
    /// Session the task ran on, `None` if it never got one
    pub worker_id: Option<usize>,
    pub task: ClassTask,
    pub outcome: TaskOutcome,
}

/// Every task report of a run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub reports: Vec<TaskReport>,
    pub shutdown_requested: bool,
    pub forced: bool,
}

impl RunSummary {
    fn count(&self, matches: impl Fn(&TaskOutcome) -> bool) -> usize {
        self.reports.iter().filter(|report| matches(&report.outcome)).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|outcome| matches!(outcome, TaskOutcome::Succeeded { .. }))
    }

    pub fn partial(&self) -> usize {
        self.count(|outcome| matches!(outcome, TaskOutcome::Partial { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, TaskOutcome::Failed(_)))
    }

    pub fn interrupted(&self) -> usize {
        self.count(|outcome| matches!(outcome, TaskOutcome::Interrupted))
    }

    pub fn images_saved(&self) -> usize {
        self.reports
            .iter()
            .map(|report| match report.outcome {
                TaskOutcome::Succeeded { saved, .. } | TaskOutcome::Partial { saved, .. } => saved,
                _ => 0,
            })
            .sum()
    }

    /// 1 when interrupted or any task failed, 0 otherwise. Partial results are not failures.
    pub fn exit_code(&self) -> u8 {
        if self.shutdown_requested || self.failed() > 0 || self.interrupted() > 0 {
            1
        } else {
            0
        }
    }
}

/// Knobs the orchestrator applies to every task
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub worker_count: usize,
    pub acquire_timeout: Duration,
    pub keep_original_filenames: bool,
    pub scrape_only: bool,
}

struct Shared<S: BrowserSession, F: ImageSource> {
    pool: SessionPool<S>,
    context: ScrapeContext,
    sources: Vec<Arc<F>>,
    settings: OrchestratorSettings,
}

impl<S: BrowserSession, F: ImageSource> Shared<S, F> {
    fn source_for(&self, worker_id: usize) -> Arc<F> {
        Arc::clone(&self.sources[worker_id % self.sources.len()])
    }
}

/// Fans tasks out over the session pool
pub struct Orchestrator<S: BrowserSession, F: ImageSource> {
    shared: Arc<Shared<S, F>>,
}

impl<S: BrowserSession, F: ImageSource> Orchestrator<S, F> {
    /// `make_source` builds the fetcher of each worker, so every worker keeps its own rate limit
    pub fn new(
        pool: SessionPool<S>,
        context: ScrapeContext,
        make_source: impl Fn(usize) -> F,
        settings: OrchestratorSettings,
    ) -> OrchestratorResult<Self> {
        if settings.worker_count == 0 {
            return Err(OrchestratorError::Config("worker count must be at least 1".to_string()));
        }

        let source_count = settings.worker_count.max(pool.size());
        let sources = (0..source_count).map(|id| Arc::new(make_source(id))).collect();

        Ok(Self {
            shared: Arc::new(Shared {
                pool,
                context,
                sources,
                settings,
            }),
        })
    }

    /// Runs every task and collects their reports. Returns early only when shutdown is forced.
    pub async fn run(&self, tasks: Vec<ClassTask>) -> RunSummary {
        let shutdown = self.shared.context.shutdown.clone();
        let requested = self.shared.settings.worker_count;
        let workers = requested.min(self.shared.pool.size()).max(1);
        if workers < requested {
            warn!("Only {} of {} requested browser sessions started, limiting workers", workers, requested);
        }
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut join_set = JoinSet::new();
        let mut pending = HashMap::new();

        info!("Dispatching {} tasks across {} workers", tasks.len(), workers);

        for task in tasks {
            let shared = Arc::clone(&self.shared);
            let semaphore = Arc::clone(&semaphore);
            let span = tracing::info_span!("task", category = %task.category, class = %task.class_name);
            let spawned = task.clone();

            let handle = join_set.spawn(
                async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return TaskReport {
                            worker_id: None,
                            task: spawned,
                            outcome: TaskOutcome::Interrupted,
                        };
                    };
                    run_task(shared, spawned).await
                }
                .instrument(span),
            );
            pending.insert(handle.id(), task);
        }

        let mut summary = RunSummary::default();
        loop {
            tokio::select! {
                joined = join_set.join_next_with_id() => match joined {
                    None => break,
                    Some(Ok((id, report))) => {
                        pending.remove(&id);
                        log_task_report(&report);
                        summary.reports.push(report);
                    }
                    Some(Err(e)) => {
                        let task = pending.remove(&e.id());
                        let outcome = if e.is_panic() {
                            error!("Task panicked: {}", e);
                            TaskOutcome::Failed(format!("task panicked: {}", e))
                        } else {
                            TaskOutcome::Interrupted
                        };
                        if let Some(task) = task {
                            let report = TaskReport { worker_id: None, task, outcome };
                            log_task_report(&report);
                            summary.reports.push(report);
                        }
                    }
                },
                _ = shutdown.forced(), if !summary.forced => {
                    warn!("Forced shutdown, aborting {} running tasks", join_set.len());
                    summary.forced = true;
                    join_set.abort_all();
                }
            }
        }

        summary.shutdown_requested = shutdown.is_requested();
        info!(
            "Run finished: {} succeeded, {} partial, {} failed, {} interrupted, {} images saved",
            summary.succeeded(),
            summary.partial(),
            summary.failed(),
            summary.interrupted(),
            summary.images_saved()
        );
        summary
    }
}

/// Acquire, scrape, download, release. Checks for shutdown between each step.
#[instrument(skip(shared), fields(task = %task))]
async fn run_task<S: BrowserSession, F: ImageSource>(shared: Arc<Shared<S, F>>, task: ClassTask) -> TaskReport {
    let shutdown = &shared.context.shutdown;
    let interrupted = |worker_id, task| TaskReport {
        worker_id,
        task,
        outcome: TaskOutcome::Interrupted,
    };

    if shutdown.is_requested() {
        return interrupted(None, task);
    }

    let Some(lease) = shared.pool.acquire(shared.settings.acquire_timeout).await else {
        warn!("No browser session available for '{}' within {:?}", task.class_name, shared.settings.acquire_timeout);
        return TaskReport {
            worker_id: None,
            outcome: TaskOutcome::Failed(format!(
                "no browser session available within {:?}",
                shared.settings.acquire_timeout
            )),
            task,
        };
    };
    let worker_id = lease.id();

    if shutdown.is_requested() {
        lease.release();
        return interrupted(Some(worker_id), task);
    }

    let scraper = ClassScraper::new(lease.handle(), task.clone(), worker_id, &shared.context);
    let scrape = match scraper.run().await {
        Ok(report) => report,
        Err(e) => {
            lease.release();
            return TaskReport {
                worker_id: Some(worker_id),
                task,
                outcome: TaskOutcome::Failed(e.to_string()),
            };
        }
    };

    if scrape.status == ScrapeStatus::PartiallyCompleted(StopReason::Cancelled) || shutdown.is_requested() {
        lease.release();
        return interrupted(Some(worker_id), task);
    }

    info!(
        "Scanned positions {}..{} for '{}': {} new urls, {} on record",
        scrape.start_position,
        scrape.end_position,
        task.class_name,
        scrape.new_urls,
        scrape.urls.len()
    );

    let found = scrape.urls.len();
    let mut saved = 0;
    if found > 0 && !shared.settings.scrape_only {
        let engine = DownloadEngine::new(
            shared.source_for(worker_id),
            shared.context.layout.clone(),
            task.class_name.as_str(),
            worker_id,
            Arc::clone(&shared.context.progress),
            shutdown.clone(),
        );
        match engine
            .save_images(&scrape.urls, shared.settings.keep_original_filenames)
            .await
        {
            Ok(count) => saved = count,
            Err(e) => {
                lease.release();
                return TaskReport {
                    worker_id: Some(worker_id),
                    task,
                    outcome: TaskOutcome::Failed(format!("download failed: {}", e)),
                };
            }
        }
    }
    lease.release();

    let outcome = match scrape.status {
        ScrapeStatus::Completed => TaskOutcome::Succeeded { found, saved },
        ScrapeStatus::PartiallyCompleted(reason) if reason.is_failure() => {
            TaskOutcome::Failed(format!("{} after {} urls, {} saved", reason, found, saved))
        }
        ScrapeStatus::PartiallyCompleted(reason) => TaskOutcome::Partial { reason, found, saved },
    };

    TaskReport {
        worker_id: Some(worker_id),
        task,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(outcome: TaskOutcome) -> TaskReport {
        TaskReport {
            worker_id: Some(0),
            task: ClassTask::new("Soups", "Adobo"),
            outcome,
        }
    }

    #[test]
    fn test_build_tasks_orders_and_filters() {
        let mut catalog = CategoryCatalog::new();
        catalog.insert("Soups".to_string(), vec!["Sinigang".to_string(), "Arroz Caldo".to_string()]);
        catalog.insert("Desserts".to_string(), vec!["Halo Halo".to_string()]);

        let all = build_tasks(&catalog, &[]);
        assert_eq!(
            all,
            vec![
                ClassTask::new("Desserts", "Halo Halo"),
                ClassTask::new("Soups", "Sinigang"),
                ClassTask::new("Soups", "Arroz Caldo"),
            ]
        );

        let soups = build_tasks(&catalog, &["Soups".to_string(), "Missing".to_string()]);
        assert_eq!(soups.len(), 2);
    }

    #[test]
    fn test_partial_results_exit_zero() {
        let summary = RunSummary {
            reports: vec![
                report(TaskOutcome::Succeeded { found: 10, saved: 10 }),
                report(TaskOutcome::Partial {
                    reason: StopReason::MissThreshold,
                    found: 4,
                    saved: 4,
                }),
            ],
            ..RunSummary::default()
        };
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(summary.images_saved(), 14);
    }

    #[test]
    fn test_failures_and_interrupts_exit_one() {
        let failed = RunSummary {
            reports: vec![report(TaskOutcome::Failed("boom".to_string()))],
            ..RunSummary::default()
        };
        assert_eq!(failed.exit_code(), 1);

        let interrupted = RunSummary {
            shutdown_requested: true,
            ..RunSummary::default()
        };
        assert_eq!(interrupted.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_forced_resolves_after_force() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.forced().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        signal.force();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("forced() should resolve")
            .expect("join");
        assert!(signal.is_requested());
    }
}
