use std::env::consts::{ARCH, FAMILY, OS};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Error};
use clap::Parser;
use console::Term;
use tracing::{error, info, trace, warn};

use crate::harvest::{
    build_tasks, init_tracing, load_categories, spawn_signal_listener, AppConfig, BrowserSettings,
    ChromiumFactory, ConfigManager, ConsoleProgress, FetcherConfig, HttpFetcher, LogGuard,
    NoopProgress, Orchestrator, OrchestratorSettings, OutputLayout, ProgressReporter, RunSummary,
    ScrapeContext, ScrapeSettings, SessionPool, SharedUrlIndex, ShutdownSignal,
};

/// The name of the cargo package.
const NAME: &str = env!("CARGO_PKG_NAME");

/// The version of the cargo package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit code for a run that could not start: bad config, no tasks, no browser.
const EXIT_SETUP_FAILED: u8 = 2;

/// Command line overrides for `config.toml`
#[derive(Parser, Debug)]
#[command(author, version, about = "Harvests and downloads images per class from a browser-driven search")]
pub(crate) struct Args {
    /// Directory holding config.toml
    #[arg(long, default_value = "./config")]
    config_dir: PathBuf,

    /// Category -> class list JSON file
    #[arg(long)]
    categories: Option<PathBuf>,

    /// Output root for images and metadata
    #[arg(long)]
    output: Option<PathBuf>,

    /// Number of parallel workers and browser sessions
    #[arg(long)]
    workers: Option<usize>,

    /// Images to harvest per class
    #[arg(long)]
    images: Option<u32>,

    /// Name files after the source filename instead of the class sequence
    #[arg(long, default_value_t = false)]
    keep_filenames: bool,

    /// Show the browser windows
    #[arg(long, default_value_t = false)]
    headed: bool,

    /// Disable the progress bars
    #[arg(long, default_value_t = false)]
    no_progress: bool,

    /// Harvest URLs without downloading them
    #[arg(long, default_value_t = false)]
    scrape_only: bool,

    /// Only run these categories (can be repeated)
    #[arg(long)]
    category: Vec<String>,

    /// Overrides the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

/// Drives one harvesting run from config loading to browser shutdown.
pub(crate) struct Program {
    args: Args,
}

impl Program {
    pub(crate) fn new(args: Args) -> Self {
        Self { args }
    }

    /// Runs the harvester and returns the process exit code.
    pub(crate) async fn run(&self) -> u8 {
        let config = match self.load_config() {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load configuration: {:#}", e);
                return EXIT_SETUP_FAILED;
            }
        };

        let _log_guard: Option<LogGuard> =
            match init_tracing(&config.logging, Path::new(&config.paths.log_directory)) {
                Ok(guard) => Some(guard),
                Err(e) => {
                    eprintln!("Failed to initialize logging: {}. Continuing without logs.", e);
                    None
                }
            };

        if Term::stderr().is_term() {
            Term::stderr().set_title("image harvester");
        }
        log_system_information();

        match self.harvest(config).await {
            Ok(summary) => summary.exit_code(),
            Err(e) => {
                error!("Harvest could not start: {:#}", e);
                EXIT_SETUP_FAILED
            }
        }
    }

    fn load_config(&self) -> Result<AppConfig, Error> {
        let manager = ConfigManager::new(&self.args.config_dir)
            .with_context(|| format!("config directory {}", self.args.config_dir.display()))?;

        manager.update(|config| {
            if let Some(path) = &self.args.categories {
                config.paths.categories_file = path.display().to_string();
            }
            if let Some(path) = &self.args.output {
                config.paths.output_directory = path.display().to_string();
            }
            if let Some(workers) = self.args.workers {
                config.workers.worker_count = workers;
            }
            if let Some(images) = self.args.images {
                config.workers.images_per_class = images;
            }
            if self.args.keep_filenames {
                config.workers.keep_original_filenames = true;
            }
            if self.args.headed {
                config.browser.headless = false;
            }
            if let Some(level) = &self.args.log_level {
                config.logging.log_level = level.clone();
            }
        });

        let config = manager.get_app_config();
        eprintln!("Using configuration from {}", manager.config_file().display());
        if config.workers.worker_count == 0 {
            anyhow::bail!("worker count must be at least 1");
        }
        Ok(config)
    }

    async fn harvest(&self, config: AppConfig) -> Result<RunSummary, Error> {
        let catalog = load_categories(&config.paths.categories_file)
            .with_context(|| format!("loading {}", config.paths.categories_file))?;
        let tasks = build_tasks(&catalog, &self.args.category);
        if tasks.is_empty() {
            anyhow::bail!("no valid (category, class) tasks in {}", config.paths.categories_file);
        }
        info!(
            "Loaded {} tasks from {} categories, {} images per class",
            tasks.len(),
            catalog.len(),
            config.workers.images_per_class
        );

        let layout = OutputLayout::new(&config.paths.output_directory);
        layout
            .ensure_dirs()
            .with_context(|| format!("creating output directory {}", config.paths.output_directory))?;
        info!("Writing images and metadata under {}", layout.root().display());

        let index = Arc::new(SharedUrlIndex::new(
            layout.clone(),
            &catalog,
            Duration::from_secs(config.scrape.index_refresh_secs),
        ));
        index.warm();
        info!("URL index holds {} previously harvested urls", index.cached_url_count());

        let fetcher = HttpFetcher::new(FetcherConfig::from(&config.http)).context("building HTTP client")?;

        let factory = ChromiumFactory::new(BrowserSettings::from(&config.browser));
        let pool = SessionPool::new(&factory, config.workers.worker_count)
            .await
            .context("starting browser sessions")?;
        let status = pool.status();
        info!("{} of {} browser sessions available", status.available, status.total);

        let progress: Arc<dyn ProgressReporter> = if self.args.no_progress {
            Arc::new(NoopProgress)
        } else {
            Arc::new(ConsoleProgress::new())
        };

        let shutdown = ShutdownSignal::new();
        let listener = spawn_signal_listener(shutdown.clone(), config.shutdown_grace());

        let context = ScrapeContext {
            layout,
            index,
            locators: config.locators.clone(),
            refinements: config.query.clone(),
            settings: ScrapeSettings::from_config(&config.scrape, config.workers.images_per_class),
            shutdown,
            progress,
        };
        let settings = OrchestratorSettings {
            worker_count: config.workers.worker_count,
            acquire_timeout: config.acquire_timeout(),
            keep_original_filenames: config.workers.keep_original_filenames,
            scrape_only: self.args.scrape_only,
        };

        let orchestrator = Orchestrator::new(pool.clone(), context, |_| fetcher.fork(), settings);
        let summary = match orchestrator {
            Ok(orchestrator) => Some(orchestrator.run(tasks).await),
            Err(e) => {
                error!("Failed to start orchestrator: {}", e);
                None
            }
        };

        listener.abort();
        if !pool.wait_for_all_released(config.shutdown_grace()).await {
            warn!("Closing browser sessions that are still in use");
        }
        pool.close_all().await;

        let summary = summary.context("orchestrator was not started")?;
        info!(
            "Finished: {} succeeded, {} partial, {} failed, {} interrupted, {} images saved",
            summary.succeeded(),
            summary.partial(),
            summary.failed(),
            summary.interrupted(),
            summary.images_saved()
        );
        Ok(summary)
    }
}

/// Logs important information about the system being used.
fn log_system_information() {
    trace!("Program Name: {}", NAME);
    trace!("Program Version: {}", VERSION);
    trace!("ARCH:           \"{}\"", ARCH);
    trace!("FAMILY:         \"{}\"", FAMILY);
    trace!("OS:             \"{}\"", OS);
}
