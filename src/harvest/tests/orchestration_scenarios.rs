use std::path::Path;
use std::time::Duration;

use super::mock_browser::{per_query_surface, MockBrowser, MockFactory, StubSource};
use super::{catalog, context, fast_settings};
use crate::harvest::config_loader::CategoryCatalog;
use crate::harvest::metadata_store::OutputLayout;
use crate::harvest::orchestration::{
    build_tasks, Orchestrator, OrchestratorError, OrchestratorSettings, RunSummary, TaskOutcome,
};
use crate::harvest::scraper::{ScrapeContext, StopReason};
use crate::harvest::session_pool::SessionPool;

fn settings(worker_count: usize) -> OrchestratorSettings {
    OrchestratorSettings {
        worker_count,
        acquire_timeout: Duration::from_secs(5),
        keep_original_filenames: false,
        scrape_only: false,
    }
}

fn food_catalog() -> CategoryCatalog {
    catalog(&[
        ("Soups", &["Arroz Caldo", "Sinigang"]),
        ("Desserts", &["Halo Halo"]),
    ])
}

async fn mock_pool(size: usize) -> SessionPool<MockBrowser> {
    SessionPool::new(&MockFactory::new(per_query_surface(6)), size)
        .await
        .expect("pool")
}

async fn run(
    pool: SessionPool<MockBrowser>,
    ctx: ScrapeContext,
    catalog: &CategoryCatalog,
    settings: OrchestratorSettings,
) -> RunSummary {
    let orchestrator = Orchestrator::new(pool, ctx, |_| StubSource::default(), settings).expect("orchestrator");
    orchestrator.run(build_tasks(catalog, &[])).await
}

fn image_count(root: &Path, class_name: &str) -> usize {
    std::fs::read_dir(OutputLayout::new(root).images_dir(class_name))
        .map(|entries| entries.count())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_every_class_is_scraped_and_downloaded() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cat = food_catalog();
    let pool = mock_pool(2).await;

    let summary = run(pool.clone(), context(dir.path(), &cat, fast_settings(3)), &cat, settings(2)).await;

    assert_eq!(summary.reports.len(), 3);
    assert_eq!(summary.succeeded(), 3);
    assert_eq!(summary.images_saved(), 9);
    assert_eq!(summary.exit_code(), 0);
    for report in &summary.reports {
        assert!(report.worker_id.is_some_and(|id| id < 2));
        assert_eq!(report.outcome, TaskOutcome::Succeeded { found: 3, saved: 3 });
        assert_eq!(image_count(dir.path(), &report.task.class_name), 3);
    }
    assert_eq!(pool.status().busy, 0);

    let again = run(pool, context(dir.path(), &cat, fast_settings(3)), &cat, settings(2)).await;
    assert_eq!(again.succeeded(), 3);
    assert_eq!(again.images_saved(), 0);
}

#[tokio::test]
async fn test_smaller_pool_queues_surplus_tasks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cat = food_catalog();
    let mut factory = MockFactory::new(per_query_surface(6));
    factory.failing_ids.insert(1);
    let pool = SessionPool::new(&factory, 2).await.expect("pool");
    assert_eq!(pool.size(), 1);

    // each scrape outlasts the acquire timeout, so surplus tasks must wait for a permit
    let mut scrape_settings = fast_settings(3);
    scrape_settings.scroll_pause = Duration::from_millis(40);
    let orchestrator_settings = OrchestratorSettings {
        acquire_timeout: Duration::from_millis(60),
        ..settings(2)
    };

    let summary = run(pool, context(dir.path(), &cat, scrape_settings), &cat, orchestrator_settings).await;

    assert_eq!(summary.failed(), 0);
    assert_eq!(summary.succeeded(), 3);
    assert_eq!(summary.exit_code(), 0);
    assert!(summary.reports.iter().all(|report| report.worker_id == Some(0)));
}

#[tokio::test]
async fn test_scrape_only_leaves_images_alone() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cat = catalog(&[("Soups", &["Tinola"])]);
    let orchestrator_settings = OrchestratorSettings {
        scrape_only: true,
        ..settings(1)
    };

    let summary = run(mock_pool(1).await, context(dir.path(), &cat, fast_settings(2)), &cat, orchestrator_settings).await;

    assert_eq!(summary.reports[0].outcome, TaskOutcome::Succeeded { found: 2, saved: 0 });
    assert_eq!(image_count(dir.path(), "Tinola"), 0);
    assert!(OutputLayout::new(dir.path()).metadata_file("Tinola").exists());
}

#[tokio::test]
async fn test_requested_shutdown_interrupts_everything() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cat = food_catalog();
    let ctx = context(dir.path(), &cat, fast_settings(3));
    ctx.shutdown.request();

    let summary = run(mock_pool(2).await, ctx, &cat, settings(2)).await;

    assert_eq!(summary.interrupted(), 3);
    assert!(summary.shutdown_requested);
    assert_eq!(summary.exit_code(), 1);
    assert!(!OutputLayout::new(dir.path()).metadata_file("Sinigang").exists());
}

#[tokio::test]
async fn test_acquire_timeout_fails_the_task() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cat = catalog(&[("Soups", &["Sinigang"])]);
    let pool = mock_pool(1).await;
    let _held = pool.acquire(Duration::from_millis(10)).await.expect("lease");

    let orchestrator_settings = OrchestratorSettings {
        acquire_timeout: Duration::from_millis(50),
        ..settings(1)
    };
    let summary = run(pool.clone(), context(dir.path(), &cat, fast_settings(3)), &cat, orchestrator_settings).await;

    assert_eq!(summary.failed(), 1);
    assert_eq!(summary.reports[0].worker_id, None);
    assert_eq!(summary.exit_code(), 1);
}

#[tokio::test]
async fn test_lost_session_fails_the_task() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cat = catalog(&[("Soups", &["Sinigang"])]);
    let pool = mock_pool(1).await;
    pool.acquire(Duration::from_millis(10))
        .await
        .expect("lease")
        .session()
        .lose_session();

    let summary = run(pool, context(dir.path(), &cat, fast_settings(3)), &cat, settings(1)).await;

    assert!(StopReason::SessionLost.is_failure());
    assert!(matches!(summary.reports[0].outcome, TaskOutcome::Failed(_)));
    assert_eq!(summary.exit_code(), 1);
}

#[tokio::test]
async fn test_zero_workers_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cat = food_catalog();

    let result = Orchestrator::new(
        mock_pool(1).await,
        context(dir.path(), &cat, fast_settings(3)),
        |_| StubSource::default(),
        settings(0),
    );
    assert!(matches!(result, Err(OrchestratorError::Config(_))));
}
