use std::sync::Arc;
use std::sync::atomic::Ordering;

use super::mock_browser::{MockBrowser, MockItem};
use super::{catalog, context, fast_settings};
use crate::harvest::browser::DriverHandle;
use crate::harvest::metadata_store::{ClassMetadataRecord, FetchData, MetadataStore, OutputLayout, SENTINEL_INDEX};
use crate::harvest::orchestration::ClassTask;
use crate::harvest::scraper::{ClassScraper, ScrapeContext, ScrapeReport, ScrapeStatus, StopReason};
use crate::harvest::search_query::{build_search_request, QueryRefinements};

fn images(prefix: &str, count: usize) -> Vec<MockItem> {
    (1..=count)
        .map(|i| MockItem::image(&format!("https://img.example.com/{}/{}.jpg", prefix, i)))
        .collect()
}

fn fetch(link: &str, position: u32) -> FetchData {
    FetchData {
        link: link.to_string(),
        domain: "img.example.com".to_string(),
        original_filename: "x.jpg".to_string(),
        xpath_index: position,
    }
}

async fn scrape(browser: &Arc<MockBrowser>, ctx: &ScrapeContext, category: &str, class_name: &str) -> ScrapeReport {
    ClassScraper::new(
        DriverHandle::Borrowed(Arc::clone(browser)),
        ClassTask::new(category, class_name),
        0,
        ctx,
    )
    .run()
    .await
    .expect("scrape should not error")
}

fn load(ctx: &ScrapeContext, class_name: &str) -> ClassMetadataRecord {
    MetadataStore::load_record(&ctx.layout.metadata_file(class_name))
        .expect("load")
        .expect("record exists")
}

#[tokio::test]
async fn test_target_met_records_every_url() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cat = catalog(&[("Soups", &["Arroz Caldo"])]);
    let ctx = context(dir.path(), &cat, fast_settings(10));
    let browser = Arc::new(MockBrowser::with_items(images("arroz", 15)));

    let report = scrape(&browser, &ctx, "Soups", "Arroz Caldo").await;

    assert_eq!(report.status, ScrapeStatus::Completed);
    assert_eq!(report.urls.len(), 10);
    assert_eq!(report.new_urls, 10);
    assert_eq!(browser.looked_up(), (1..=10).collect::<Vec<_>>());

    let record = load(&ctx, "Arroz Caldo");
    assert_eq!(record.number_of_urls_found, 10);
    assert_eq!(record.last_xpath_index, SENTINEL_INDEX);
    assert_eq!(record.search_urls_used.len(), 1);
    assert!(ctx.index.contains_cached("https://img.example.com/arroz/10.jpg"));
}

#[tokio::test]
async fn test_interrupted_scan_resumes_after_last_position() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cat = catalog(&[("Soups", &["Sinigang"])]);
    let ctx = context(dir.path(), &cat, fast_settings(3));

    let request = build_search_request("Sinigang", "", &QueryRefinements::default());
    let mut record = ClassMetadataRecord::new(request.search_key.as_str(), 3);
    record.search_urls_used.push(request.url.clone());
    record.last_xpath_index = 7;
    MetadataStore::save_record(&ctx.layout.metadata_file("Sinigang"), &record).expect("save");

    let browser = Arc::new(MockBrowser::with_items(images("sinigang", 20)));
    let report = scrape(&browser, &ctx, "Soups", "Sinigang").await;

    assert_eq!(report.start_position, 8);
    assert_eq!(browser.looked_up().first(), Some(&8));

    let record = load(&ctx, "Sinigang");
    let positions: Vec<u32> = record.images.values().map(|image| image.fetch_data.xpath_index).collect();
    assert_eq!(positions, vec![8, 9, 10]);
    assert_eq!(record.last_xpath_index, SENTINEL_INDEX);
    assert_eq!(record.search_urls_used, vec![request.url]);
}

#[tokio::test]
async fn test_changed_search_starts_fresh() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cat = catalog(&[("Soups", &["Sinigang"])]);
    let ctx = context(dir.path(), &cat, fast_settings(2));

    let mut record = ClassMetadataRecord::new("Sinigang", 2);
    record.search_urls_used.push("https://www.google.com/search?q=old&tbm=isch".to_string());
    record.last_xpath_index = 7;
    MetadataStore::save_record(&ctx.layout.metadata_file("Sinigang"), &record).expect("save");

    let browser = Arc::new(MockBrowser::with_items(images("sinigang", 5)));
    let report = scrape(&browser, &ctx, "Soups", "Sinigang").await;

    assert_eq!(report.start_position, 1);
    assert_eq!(load(&ctx, "Sinigang").search_urls_used.len(), 2);
}

#[tokio::test]
async fn test_enough_urls_skips_browser() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cat = catalog(&[("Soups", &["Tinola"])]);
    let ctx = context(dir.path(), &cat, fast_settings(2));

    let mut record = ClassMetadataRecord::new("Tinola", 2);
    record.insert_image(fetch("https://a/1.jpg", 1));
    record.insert_image(fetch("https://a/2.jpg", 2));
    MetadataStore::save_record(&ctx.layout.metadata_file("Tinola"), &record).expect("save");

    let browser = Arc::new(MockBrowser::with_items(images("tinola", 5)));
    let report = scrape(&browser, &ctx, "Soups", "Tinola").await;

    assert_eq!(report.status, ScrapeStatus::Completed);
    assert_eq!(report.urls.len(), 2);
    assert!(browser.navigations().is_empty());
}

#[tokio::test]
async fn test_missing_items_hit_miss_threshold() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cat = catalog(&[("Soups", &["Bulalo"])]);
    let mut settings = fast_settings(5);
    settings.max_missed = 4;
    let ctx = context(dir.path(), &cat, settings);

    let browser = Arc::new(MockBrowser::with_items(Vec::new()));
    let report = scrape(&browser, &ctx, "Soups", "Bulalo").await;

    assert_eq!(report.status, ScrapeStatus::PartiallyCompleted(StopReason::MissThreshold));
    assert_eq!(report.end_position, 5);
    assert!(report.urls.is_empty());
}

#[tokio::test]
async fn test_deep_failures_with_no_results_cost_extra() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cat = catalog(&[("Soups", &["Bulalo"])]);
    let mut settings = fast_settings(5);
    settings.max_missed = 6;
    settings.recovery_depth = 1;
    let ctx = context(dir.path(), &cat, settings);

    let browser = Arc::new(MockBrowser::with_items(Vec::new()));
    let report = scrape(&browser, &ctx, "Soups", "Bulalo").await;

    // each failure costs 1 plus a penalty of 2 for an empty results page
    assert_eq!(report.status, ScrapeStatus::PartiallyCompleted(StopReason::MissThreshold));
    assert_eq!(report.end_position, 3);
}

#[tokio::test]
async fn test_blank_details_exhaust_high_res_budget() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cat = catalog(&[("Desserts", &["Leche Flan"])]);
    let mut settings = fast_settings(5);
    settings.high_res_failure_threshold = 3;
    let ctx = context(dir.path(), &cat, settings);

    let browser = Arc::new(MockBrowser::with_items(vec![MockItem::Blank; 20]));
    let report = scrape(&browser, &ctx, "Desserts", "Leche Flan").await;

    assert_eq!(report.status, ScrapeStatus::PartiallyCompleted(StopReason::HighResExhausted));
    assert_eq!(browser.looked_up(), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_related_blocks_run_into_ceiling_without_misses() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cat = catalog(&[("Desserts", &["Leche Flan"])]);
    let mut settings = fast_settings(5);
    settings.hard_ceiling = 10;
    settings.max_missed = 2;
    let ctx = context(dir.path(), &cat, settings);

    let browser = Arc::new(MockBrowser::with_items(vec![MockItem::Related; 30]));
    let report = scrape(&browser, &ctx, "Desserts", "Leche Flan").await;

    assert_eq!(report.status, ScrapeStatus::PartiallyCompleted(StopReason::PositionCeiling));
    assert_eq!(browser.looked_up(), (1..=9).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_duplicates_are_not_misses() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cat = catalog(&[("Soups", &["Pancit"])]);
    let mut settings = fast_settings(2);
    settings.max_missed = 3;
    let ctx = context(dir.path(), &cat, settings);

    let known = "https://img.example.com/pancit/known.jpg";
    let mut record = ClassMetadataRecord::new("Pancit", 2);
    record.insert_image(fetch(known, 1));
    MetadataStore::save_record(&ctx.layout.metadata_file("Pancit"), &record).expect("save");

    let mut items = vec![MockItem::image(known); 8];
    items.push(MockItem::image("https://img.example.com/pancit/new.jpg"));
    let browser = Arc::new(MockBrowser::with_items(items));

    let report = scrape(&browser, &ctx, "Soups", "Pancit").await;

    assert_eq!(report.status, ScrapeStatus::Completed);
    assert_eq!(report.new_urls, 1);
    assert_eq!(load(&ctx, "Pancit").images.values().last().map(|i| i.fetch_data.xpath_index), Some(9));
}

#[tokio::test]
async fn test_sibling_class_url_is_not_recorded() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cat = catalog(&[("Soups", &["Batchoy", "Molo"])]);
    let ctx = context(dir.path(), &cat, fast_settings(1));
    let shared = "https://img.example.com/shared.jpg";

    let mut sibling = ClassMetadataRecord::new("Batchoy", 1);
    sibling.insert_image(fetch(shared, 1));
    MetadataStore::save_record(&OutputLayout::new(dir.path()).metadata_file("Batchoy"), &sibling).expect("save");

    let browser = Arc::new(MockBrowser::with_items(vec![
        MockItem::image(shared),
        MockItem::image("https://img.example.com/molo.jpg"),
    ]));
    let report = scrape(&browser, &ctx, "Soups", "Molo").await;

    assert_eq!(report.urls, vec!["https://img.example.com/molo.jpg".to_string()]);
}

#[tokio::test]
async fn test_lost_session_stops_scan() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cat = catalog(&[("Soups", &["Lomi"])]);
    let ctx = context(dir.path(), &cat, fast_settings(3));

    let browser = Arc::new(MockBrowser::with_items(images("lomi", 5)));
    browser.lose_session();
    let report = scrape(&browser, &ctx, "Soups", "Lomi").await;

    assert_eq!(report.status, ScrapeStatus::PartiallyCompleted(StopReason::SessionLost));
    assert_eq!(load(&ctx, "Lomi").last_xpath_index, SENTINEL_INDEX);
}

#[tokio::test]
async fn test_shutdown_cancels_before_first_position() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cat = catalog(&[("Soups", &["Lomi"])]);
    let ctx = context(dir.path(), &cat, fast_settings(3));
    ctx.shutdown.request();

    let browser = Arc::new(MockBrowser::with_items(images("lomi", 5)));
    let report = scrape(&browser, &ctx, "Soups", "Lomi").await;

    assert_eq!(report.status, ScrapeStatus::PartiallyCompleted(StopReason::Cancelled));
    assert!(browser.looked_up().is_empty());
}

#[tokio::test]
async fn test_only_owned_driver_quits_on_close() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cat = catalog(&[("Soups", &["Lomi"])]);
    let ctx = context(dir.path(), &cat, fast_settings(1));

    let borrowed = Arc::new(MockBrowser::with_items(images("lomi", 2)));
    scrape(&borrowed, &ctx, "Soups", "Lomi").await;
    assert!(!borrowed.quit_flag().load(Ordering::SeqCst));

    let owned = MockBrowser::with_items(images("lomi", 2));
    let quit = owned.quit_flag();
    ClassScraper::new(DriverHandle::Owned(owned), ClassTask::new("Soups", "Lomi"), 0, &ctx)
        .run()
        .await
        .expect("scrape");
    assert!(quit.load(Ordering::SeqCst));
}
