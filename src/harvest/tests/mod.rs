mod orchestration_scenarios;
mod pool_scenarios;
mod scrape_scenarios;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::harvest::config_loader::{CategoryCatalog, Scrape};
use crate::harvest::dedup::CrossCategoryPolicy;
use crate::harvest::metadata_store::OutputLayout;
use crate::harvest::orchestration::ShutdownSignal;
use crate::harvest::progress::NoopProgress;
use crate::harvest::scraper::{ScrapeContext, ScrapeSettings};
use crate::harvest::search_query::{QueryRefinements, SearchLocators};
use crate::harvest::url_index::SharedUrlIndex;

/// Locators understood by the mock browser
pub fn mock_locators() -> SearchLocators {
    SearchLocators {
        result_item_xpath: "//item[{index}]".to_string(),
        thumbnail_suffix: "//g-img".to_string(),
        related_searches_class: mock_browser::RELATED_CLASS.to_string(),
        high_res_classes: vec![mock_browser::HIGH_RES_CLASS.to_string()],
        show_more_xpath: "//more".to_string(),
        recovery_probe_xpath: "//probe".to_string(),
        content_ready_css: "img".to_string(),
    }
}

/// Default thresholds with every pause removed
pub fn fast_settings(requested: u32) -> ScrapeSettings {
    let mut settings = ScrapeSettings::from_config(&Scrape::default(), requested);
    settings.scroll_pause = Duration::ZERO;
    settings.page_load_timeout = Duration::ZERO;
    settings.load_more_wait = Duration::ZERO;
    settings
}

pub fn catalog(entries: &[(&str, &[&str])]) -> CategoryCatalog {
    entries
        .iter()
        .map(|(category, classes)| {
            (
                category.to_string(),
                classes.iter().map(|class| class.to_string()).collect(),
            )
        })
        .collect()
}

pub fn context(root: &Path, catalog: &CategoryCatalog, settings: ScrapeSettings) -> ScrapeContext {
    let layout = OutputLayout::new(root);
    ScrapeContext {
        index: Arc::new(SharedUrlIndex::new(layout.clone(), catalog, Duration::from_secs(30))),
        layout,
        locators: mock_locators(),
        refinements: QueryRefinements::default(),
        settings: ScrapeSettings {
            cross_category_policy: CrossCategoryPolicy::Skip,
            ..settings
        },
        shutdown: ShutdownSignal::new(),
        progress: Arc::new(NoopProgress),
    }
}
