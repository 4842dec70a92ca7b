//! Image harvesting pipeline
//! Browser-driven URL discovery, deduplication and resumable downloads per class

pub mod browser;
pub mod checkpoint;
pub mod config_loader;
pub mod dedup;
pub mod download_engine;
pub mod fetcher;
pub mod integrity;
pub mod logger;
pub mod metadata_store;
pub mod orchestration;
pub mod progress;
pub mod rate_limiter;
pub mod retry;
pub mod scraper;
pub mod search_query;
pub mod session_pool;
pub mod url_index;

#[cfg(test)]
mod tests;

// Re-export what the program entry point wires together
pub use browser::{BrowserSettings, ChromiumFactory};
pub use config_loader::{load_categories, AppConfig, ConfigManager};
pub use fetcher::{FetcherConfig, HttpFetcher};
pub use logger::{init_tracing, LogGuard};
pub use metadata_store::OutputLayout;
pub use orchestration::{
    build_tasks, spawn_signal_listener, Orchestrator, OrchestratorSettings, RunSummary, ShutdownSignal,
};
pub use progress::{ConsoleProgress, NoopProgress, ProgressReporter};
pub use scraper::{ScrapeContext, ScrapeSettings};
pub use session_pool::SessionPool;
pub use url_index::SharedUrlIndex;
