//! Per-class scrape state machine
//!
//! This module drives one browser session through the search results for a class:
//! 1. Loads the class record and decides between resuming and a fresh scan
//! 2. Walks result positions, opening each item and collecting full-size image URLs
//! 3. Classifies every candidate against the shared URL index before recording it
//! 4. Stops on target met, miss threshold, high-res exhaustion, position ceiling or shutdown
//! 5. Persists after every accepted URL and resets the resume marker on exit

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::harvest::browser::{BrowserError, BrowserResult, BrowserSession, DriverHandle};
use crate::harvest::config_loader::Scrape;
use crate::harvest::dedup::{CrossCategoryPolicy, DuplicationChecker};
use crate::harvest::integrity::{domain_of, original_filename_hint};
use crate::harvest::metadata_store::{
    ClassMetadataRecord, FetchData, MetadataError, MetadataStore, OutputLayout, SENTINEL_INDEX,
};
use crate::harvest::orchestration::{ClassTask, ShutdownSignal};
use crate::harvest::progress::ProgressReporter;
use crate::harvest::retry::{retry, Backoff, RetryFailure, RetryPolicy};
use crate::harvest::search_query::{build_search_request, QueryRefinements, SearchLocators, SearchRequest};
use crate::harvest::url_index::SharedUrlIndex;

/// Item lookups start at this timeout and grow by a second per hundred positions
const ITEM_TIMEOUT_BASE_SECS: u64 = 5;
const ITEM_TIMEOUT_MAX_SECS: u64 = 10;

/// Consecutive failed saves before the scan gives up
const MAX_PERSIST_FAILURES: u32 = 3;

const CLICK_ATTEMPTS: u32 = 3;

const SCROLL_TO_BOTTOM: &str = "window.scrollTo(0, document.body.scrollHeight);";
const SCROLL_STEP: &str = "window.scrollBy(0, 400);";
const SCRIPTED_CLICK: &str = "function() { this.click(); }";

#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),
}

pub type ScrapeResult<T> = Result<T, ScrapeError>;

/// Why a scan ended before meeting its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MissThreshold,
    HighResExhausted,
    PositionCeiling,
    Cancelled,
    SessionLost,
    PageLoadFailed,
    PersistenceFailed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::MissThreshold => "miss threshold reached",
            StopReason::HighResExhausted => "high-res failures exhausted",
            StopReason::PositionCeiling => "position ceiling reached",
            StopReason::Cancelled => "shutdown requested",
            StopReason::SessionLost => "browser session lost",
            StopReason::PageLoadFailed => "search page failed to load",
            StopReason::PersistenceFailed => "metadata could not be saved",
        };
        f.write_str(text)
    }
}

impl StopReason {
    /// The scan broke down rather than running out of results
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            StopReason::SessionLost | StopReason::PageLoadFailed | StopReason::PersistenceFailed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeStatus {
    Completed,
    PartiallyCompleted(StopReason),
}

#[derive(Debug, Clone)]
pub struct ScrapeReport {
    pub status: ScrapeStatus,
    /// Every harvested link for the class, in key order
    pub urls: Vec<String>,
    pub new_urls: usize,
    pub start_position: u32,
    pub end_position: u32,
}

/// Tunables for one scan
#[derive(Debug, Clone)]
pub struct ScrapeSettings {
    pub requested: u32,
    pub max_missed: u32,
    pub high_res_failure_threshold: u32,
    pub recovery_depth: u32,
    pub hard_ceiling: u32,
    pub periodic_scroll_interval: u32,
    pub refresh_interval: u32,
    pub scroll_pause: Duration,
    pub page_load_timeout: Duration,
    pub load_more_wait: Duration,
    pub advanced_suffix: String,
    pub cross_category_policy: CrossCategoryPolicy,
}

impl ScrapeSettings {
    pub fn from_config(scrape: &Scrape, requested: u32) -> Self {
        Self {
            requested,
            max_missed: scrape.max_missed,
            high_res_failure_threshold: scrape.high_res_failure_threshold,
            recovery_depth: scrape.recovery_depth,
            hard_ceiling: scrape.hard_ceiling,
            periodic_scroll_interval: scrape.periodic_scroll_interval,
            refresh_interval: scrape.refresh_interval,
            scroll_pause: Duration::from_millis(scrape.scroll_pause_ms),
            page_load_timeout: Duration::from_secs(scrape.page_load_timeout_secs),
            load_more_wait: Duration::from_millis(scrape.load_more_wait_ms),
            advanced_suffix: scrape.advanced_suffix.clone(),
            cross_category_policy: scrape.cross_category_policy,
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::Exponential {
            base: self.scroll_pause,
            max: self.scroll_pause * 8,
            jitter: self.scroll_pause / 2,
        }
    }
}

/// Everything a scraper shares with the other workers
#[derive(Clone)]
pub struct ScrapeContext {
    pub layout: OutputLayout,
    pub index: Arc<SharedUrlIndex>,
    pub locators: SearchLocators,
    pub refinements: QueryRefinements,
    pub settings: ScrapeSettings,
    pub shutdown: ShutdownSignal,
    pub progress: Arc<dyn ProgressReporter>,
}

/// Outcome of scanning one position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Accepted,
    DuplicateOnly,
    Skipped,
    Empty,
}

/// Mutable counters of a running scan
#[derive(Debug)]
struct ScanState {
    position: u32,
    misses: u32,
    high_res_failures: u32,
    persist_failures: u32,
    new_urls: usize,
}

pub struct ClassScraper<S: BrowserSession> {
    driver: DriverHandle<S>,
    task: ClassTask,
    worker_id: usize,
    layout: OutputLayout,
    index: Arc<SharedUrlIndex>,
    checker: DuplicationChecker,
    locators: SearchLocators,
    settings: ScrapeSettings,
    request: SearchRequest,
    shutdown: ShutdownSignal,
    progress: Arc<dyn ProgressReporter>,
}

impl<S: BrowserSession> ClassScraper<S> {
    pub fn new(driver: DriverHandle<S>, task: ClassTask, worker_id: usize, context: &ScrapeContext) -> Self {
        let request = build_search_request(
            &task.class_name,
            &context.settings.advanced_suffix,
            &context.refinements,
        );
        let checker = DuplicationChecker::new(
            Arc::clone(&context.index),
            task.category.as_str(),
            task.class_name.as_str(),
            context.settings.cross_category_policy,
        );

        Self {
            driver,
            task,
            worker_id,
            layout: context.layout.clone(),
            index: Arc::clone(&context.index),
            checker,
            locators: context.locators.clone(),
            settings: context.settings.clone(),
            request,
            shutdown: context.shutdown.clone(),
            progress: Arc::clone(&context.progress),
        }
    }

    /// Runs the scan to a terminal state. Closing the driver afterwards only
    /// quits the browser when the scraper owns it.
    #[instrument(skip(self), fields(worker = self.worker_id, class = %self.task.class_name))]
    pub async fn run(self) -> ScrapeResult<ScrapeReport> {
        let result = self.scrape().await;
        let class_name = self.task.class_name.clone();
        if let Err(e) = self.driver.close().await {
            warn!("Failed to close browser for '{}': {}", class_name, e);
        }
        result
    }

    async fn scrape(&self) -> ScrapeResult<ScrapeReport> {
        let path = self.layout.metadata_file(&self.task.class_name);
        let mut record = MetadataStore::load_record(&path)?.unwrap_or_else(|| {
            ClassMetadataRecord::new(self.request.search_key.as_str(), self.settings.requested)
        });
        record.number_of_images_requested = self.settings.requested;

        if record.harvested_count() >= self.settings.requested as usize {
            info!(
                "[Worker {}] '{}' already has {} urls, skipping scrape",
                self.worker_id,
                self.task.class_name,
                record.harvested_count()
            );
            return Ok(ScrapeReport {
                status: ScrapeStatus::Completed,
                urls: record.links(),
                new_urls: 0,
                start_position: SENTINEL_INDEX,
                end_position: SENTINEL_INDEX,
            });
        }

        let start = self.resolve_start(&mut record);
        let mut scan = ScanState {
            position: start,
            misses: 0,
            high_res_failures: 0,
            persist_failures: 0,
            new_urls: 0,
        };
        self.persist(&record, &mut scan);

        self.progress
            .start(self.worker_id, self.settings.requested as u64, &self.task.class_name);
        self.progress
            .advance(self.worker_id, record.harvested_count() as u64);

        let stop = match self.open_search().await {
            Ok(()) => self.scan(&mut record, &mut scan).await,
            Err(reason) => Some(reason),
        };

        record.last_xpath_index = SENTINEL_INDEX;
        if let Err(e) = MetadataStore::save_record(&path, &record) {
            warn!("Failed to save final metadata for '{}': {}", self.task.class_name, e);
        }
        self.progress.complete(self.worker_id);

        let status = match stop {
            None => ScrapeStatus::Completed,
            Some(reason) => ScrapeStatus::PartiallyCompleted(reason),
        };
        info!(
            "[Worker {}] Scrape of '{}' finished at position {} with {} urls ({} new): {:?}",
            self.worker_id,
            self.task.class_name,
            scan.position,
            record.harvested_count(),
            scan.new_urls,
            status
        );

        Ok(ScrapeReport {
            status,
            urls: record.links(),
            new_urls: scan.new_urls,
            start_position: start,
            end_position: scan.position,
        })
    }

    /// Resumes after the recorded position when this exact search was interrupted,
    /// otherwise starts at the first position and records the search.
    fn resolve_start(&self, record: &mut ClassMetadataRecord) -> u32 {
        let already_used = record.search_urls_used.contains(&self.request.url);
        record.search_key = self.request.search_key.clone();

        if already_used && record.is_resumable() {
            let start = record.last_xpath_index + 1;
            info!(
                "[Worker {}] Resuming '{}' at position {}",
                self.worker_id, self.task.class_name, start
            );
            return start;
        }

        if !already_used {
            record.search_urls_used.push(self.request.url.clone());
        }
        record.last_xpath_index = SENTINEL_INDEX;
        SENTINEL_INDEX
    }

    async fn open_search(&self) -> Result<(), StopReason> {
        let session = self.driver.session();
        if let Err(e) = session.navigate(&self.request.url).await {
            warn!("Failed to open search for '{}': {}", self.task.class_name, e);
            return Err(match e {
                BrowserError::SessionLost(_) => StopReason::SessionLost,
                _ => StopReason::PageLoadFailed,
            });
        }
        self.wait_for_content().await;
        Ok(())
    }

    async fn wait_for_content(&self) {
        let session = self.driver.session();
        if let Err(e) = session
            .wait_for_element(&self.locators.content_ready(), self.settings.page_load_timeout)
            .await
        {
            warn!("Search results for '{}' not ready: {}", self.task.class_name, e);
        }
        self.pause(self.settings.scroll_pause).await;
    }

    /// Main loop. Returns `None` when the target was met.
    async fn scan(&self, record: &mut ClassMetadataRecord, scan: &mut ScanState) -> Option<StopReason> {
        loop {
            if record.harvested_count() >= self.settings.requested as usize {
                return None;
            }
            if scan.misses >= self.settings.max_missed {
                return Some(StopReason::MissThreshold);
            }
            if scan.position >= self.settings.hard_ceiling {
                return Some(StopReason::PositionCeiling);
            }
            if self.shutdown.is_requested() {
                return Some(StopReason::Cancelled);
            }

            match self.scan_position(record, scan.position).await {
                Ok(Step::Accepted) => {
                    scan.misses = 0;
                    scan.high_res_failures = 0;
                    scan.new_urls += 1;
                    self.progress.advance(self.worker_id, 1);
                    if !self.persist(record, scan) {
                        return Some(StopReason::PersistenceFailed);
                    }
                }
                Ok(Step::DuplicateOnly) | Ok(Step::Skipped) => {}
                Ok(Step::Empty) => {
                    scan.high_res_failures += 1;
                    if scan.high_res_failures > self.settings.high_res_failure_threshold {
                        return Some(StopReason::HighResExhausted);
                    }
                    self.scroll_with_backoff(scan.high_res_failures).await;
                }
                Err(e) => {
                    if self.driver.session().current_url().await.is_err() {
                        warn!("Session lost while scraping '{}': {}", self.task.class_name, e);
                        return Some(StopReason::SessionLost);
                    }
                    debug!("Position {} of '{}' failed: {}", scan.position, self.task.class_name, e);

                    let penalty = if scan.position >= self.settings.recovery_depth {
                        self.recovery_penalty().await
                    } else {
                        0
                    };
                    scan.misses += 1 + penalty;
                    self.scroll_with_backoff(scan.misses).await;
                }
            }

            scan.position += 1;

            if is_boundary(scan.position, self.settings.periodic_scroll_interval) {
                self.run_script(SCROLL_STEP).await;
                self.pause(self.settings.scroll_pause).await;
            }
            if is_boundary(scan.position, self.settings.refresh_interval) {
                if let Err(reason) = self.refresh(scan).await {
                    return Some(reason);
                }
            }
        }
    }

    async fn scan_position(&self, record: &mut ClassMetadataRecord, position: u32) -> BrowserResult<Step> {
        let session = self.driver.session();
        let item = session
            .wait_for_element(&self.locators.item(position), item_timeout(position))
            .await?;

        let class_attr = session.attribute(&item, "class").await?.unwrap_or_default();
        if class_attr.contains(&self.locators.related_searches_class) {
            debug!("Position {} is a related searches block", position);
            return Ok(Step::Skipped);
        }

        self.open_detail(position).await?;
        self.pause(self.settings.scroll_pause).await;

        let candidates = self.extract_high_res().await?;
        if candidates.is_empty() {
            return Ok(Step::Empty);
        }

        for url in candidates {
            let classification = self.checker.classify(&url, record);
            if self.checker.should_record(classification) {
                let key = record.insert_image(FetchData {
                    domain: domain_of(&url),
                    original_filename: original_filename_hint(&url),
                    xpath_index: position,
                    link: url.clone(),
                });
                record.last_xpath_index = position;
                self.index
                    .add_url(&self.task.category, &self.task.class_name, &url);
                debug!("Accepted {} as {} at position {} ({})", url, key, position, classification);
                return Ok(Step::Accepted);
            }
            debug!("Skipping {} at position {}: {}", url, position, classification);
        }
        Ok(Step::DuplicateOnly)
    }

    /// Clicks the thumbnail, re-locating it on staleness, with a scripted click as last resort
    async fn open_detail(&self, position: u32) -> BrowserResult<()> {
        let session = self.driver.session();
        let locator = self.locators.thumbnail(position);
        let lookup_timeout = item_timeout(position);
        let policy = RetryPolicy::new(
            CLICK_ATTEMPTS,
            Backoff::Fixed(self.settings.scroll_pause / 2),
            is_relocatable,
        );

        let clicked = retry(&policy, |_| {
            let locator = &locator;
            async move {
                let thumbnail = session.wait_for_element(locator, lookup_timeout).await?;
                session.click(&thumbnail).await
            }
        })
        .await;

        match clicked {
            Ok(()) => Ok(()),
            Err(RetryFailure::Permanent(e)) => Err(e),
            Err(RetryFailure::Exhausted { attempts, last }) => {
                debug!("Click failed {} times ({}), trying scripted click", attempts, last);
                let thumbnail = session.wait_for_element(&locator, lookup_timeout).await?;
                session.execute_on_element(&thumbnail, SCRIPTED_CLICK).await
            }
        }
    }

    /// Full-size `http` sources from the detail view, without duplicates
    async fn extract_high_res(&self) -> BrowserResult<Vec<String>> {
        let session = self.driver.session();
        let mut candidates: Vec<String> = Vec::new();

        for locator in self.locators.high_res() {
            for element in session.find_elements(&locator).await? {
                let Some(src) = session.attribute(&element, "src").await? else {
                    continue;
                };
                if is_full_size_source(&src) && !candidates.contains(&src) {
                    candidates.push(src);
                }
            }
        }
        Ok(candidates)
    }

    /// Scrolls to the bottom and checks whether results are still there.
    /// 0 when items remain, 2 when none do, 1 when the probe itself failed.
    async fn recovery_penalty(&self) -> u32 {
        let session = self.driver.session();
        self.run_script(SCROLL_TO_BOTTOM).await;
        self.pause(self.settings.scroll_pause).await;

        match session.find_elements(&self.locators.recovery_probe()).await {
            Ok(items) if !items.is_empty() => 0,
            Ok(_) => 2,
            Err(e) => {
                debug!("Recovery probe failed: {}", e);
                1
            }
        }
    }

    /// Loads more results if offered, then reloads the page to shed stale elements
    async fn refresh(&self, scan: &mut ScanState) -> Result<(), StopReason> {
        let session = self.driver.session();

        if let Ok(buttons) = session.find_elements(&self.locators.show_more()).await {
            if let Some(button) = buttons.first() {
                match session.execute_on_element(button, SCRIPTED_CLICK).await {
                    Ok(()) => {
                        debug!("Loaded more results for '{}'", self.task.class_name);
                        self.pause(self.settings.load_more_wait).await;
                        scan.misses = 0;
                    }
                    Err(e) => debug!("Show more click failed: {}", e),
                }
            }
        }

        let url = session
            .current_url()
            .await
            .map_err(|_| StopReason::SessionLost)?;
        if let Err(e) = session.navigate(&url).await {
            warn!("Refresh of '{}' failed: {}", self.task.class_name, e);
            if !e.is_transient() {
                return Err(StopReason::SessionLost);
            }
        }
        self.wait_for_content().await;
        Ok(())
    }

    async fn scroll_with_backoff(&self, failures: u32) {
        self.run_script(SCROLL_STEP).await;
        self.pause(self.settings.backoff().delay(failures)).await;
    }

    async fn run_script(&self, script: &str) {
        if let Err(e) = self.driver.session().execute_script(script).await {
            debug!("Scroll script failed: {}", e);
        }
    }

    async fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            sleep(duration).await;
        }
    }

    /// Saves the record. Returns false once saves have failed too many times in a row.
    fn persist(&self, record: &ClassMetadataRecord, scan: &mut ScanState) -> bool {
        let path = self.layout.metadata_file(&self.task.class_name);
        match MetadataStore::save_record(&path, record) {
            Ok(()) => {
                scan.persist_failures = 0;
                true
            }
            Err(e) => {
                scan.persist_failures += 1;
                warn!(
                    "Failed to save metadata for '{}' ({} in a row): {}",
                    self.task.class_name, scan.persist_failures, e
                );
                scan.persist_failures < MAX_PERSIST_FAILURES
            }
        }
    }
}

fn item_timeout(position: u32) -> Duration {
    let secs = (ITEM_TIMEOUT_BASE_SECS + position as u64 / 100).min(ITEM_TIMEOUT_MAX_SECS);
    Duration::from_secs(secs)
}

/// An `http` source not served from the thumbnail cache hosts
fn is_full_size_source(src: &str) -> bool {
    src.starts_with("http") && !domain_of(src).starts_with("encrypted-tbn")
}

fn is_boundary(position: u32, interval: u32) -> bool {
    interval > 0 && position % interval == 0
}

fn is_relocatable(error: &BrowserError) -> bool {
    matches!(error, BrowserError::StaleElement | BrowserError::NoSuchElement(_))
}
