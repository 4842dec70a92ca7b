//! Per-worker progress reporting.
//!
//! Components receive an `Arc<dyn ProgressReporter>` instead of reaching for a
//! global tracker. Each worker owns at most one active bar at a time.

use std::collections::HashMap;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use parking_lot::Mutex;
use tracing::{error, warn};

/// Sink for progress events, keyed by worker id.
pub trait ProgressReporter: Send + Sync {
    /// Opens (or replaces) the bar for `worker` with `total` steps.
    fn start(&self, worker: usize, total: u64, label: &str);

    /// Moves the worker's bar forward by `n`.
    fn advance(&self, worker: usize, n: u64);

    /// Finishes and removes the worker's bar.
    fn complete(&self, worker: usize);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn start(&self, _worker: usize, _total: u64, _label: &str) {}
    fn advance(&self, _worker: usize, _n: u64) {}
    fn complete(&self, _worker: usize) {}
}

/// A builder that helps in making a new [ProgressStyle] for use.
pub(crate) struct ProgressStyleBuilder {
    progress_style: ProgressStyle,
}

impl ProgressStyleBuilder {
    /// Sets the template of the progress style, falling back to a plain bar if it is rejected.
    pub(crate) fn template(mut self, msg_template: &str) -> Self {
        match self.progress_style.clone().template(msg_template) {
            Ok(style) => self.progress_style = style,
            Err(err) => {
                warn!("Template error with '{}': {}. Using fallback template.", msg_template, err);
                let fallback = "{spinner} [{elapsed_precise}] {bar} {pos}/{len}";
                match self.progress_style.clone().template(fallback) {
                    Ok(style) => self.progress_style = style,
                    Err(e) => {
                        error!("Fallback template also failed: {}. Using default bar.", e);
                        self.progress_style = ProgressStyle::default_bar();
                    }
                }
            }
        }
        self
    }

    pub(crate) fn progress_chars(mut self, chars: &str) -> Self {
        self.progress_style = self.progress_style.progress_chars(chars);
        self
    }

    pub(crate) fn build(self) -> ProgressStyle {
        self.progress_style
    }
}

impl Default for ProgressStyleBuilder {
    fn default() -> Self {
        Self {
            progress_style: ProgressStyle::default_bar(),
        }
    }
}

/// A builder that helps in initializing and configuring a new [ProgressBar] for use.
pub(crate) struct ProgressBarBuilder {
    progress_bar: ProgressBar,
}

impl ProgressBarBuilder {
    pub(crate) fn new(len: u64) -> Self {
        Self {
            progress_bar: ProgressBar::new(len),
        }
    }

    pub(crate) fn style(self, progress_style: ProgressStyle) -> Self {
        self.progress_bar.set_style(progress_style);
        self
    }

    pub(crate) fn draw_target(self, target: ProgressDrawTarget) -> Self {
        self.progress_bar.set_draw_target(target);
        self
    }

    pub(crate) fn message(self, message: String) -> Self {
        self.progress_bar.set_message(message);
        self
    }

    pub(crate) fn steady_tick(self, duration: Duration) -> Self {
        self.progress_bar.enable_steady_tick(duration);
        self
    }

    pub(crate) fn build(self) -> ProgressBar {
        self.progress_bar
    }
}

/// One terminal bar per worker, stacked in a [MultiProgress].
pub struct ConsoleProgress {
    multi: MultiProgress,
    style: ProgressStyle,
    bars: Mutex<HashMap<usize, ProgressBar>>,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        let style = ProgressStyleBuilder::default()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .progress_chars("=>-")
            .build();

        Self {
            multi: MultiProgress::with_draw_target(ProgressDrawTarget::stderr()),
            style,
            bars: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for ConsoleProgress {
    fn start(&self, worker: usize, total: u64, label: &str) {
        let bar = ProgressBarBuilder::new(total)
            .style(self.style.clone())
            .draw_target(ProgressDrawTarget::hidden())
            .message(format!("[Worker {}] {}", worker, label))
            .steady_tick(Duration::from_millis(200))
            .build();
        let bar = self.multi.add(bar);

        if let Some(previous) = self.bars.lock().insert(worker, bar) {
            previous.finish_and_clear();
            self.multi.remove(&previous);
        }
    }

    fn advance(&self, worker: usize, n: u64) {
        if let Some(bar) = self.bars.lock().get(&worker) {
            bar.inc(n);
        }
    }

    fn complete(&self, worker: usize) {
        if let Some(bar) = self.bars.lock().remove(&worker) {
            bar.finish_and_clear();
            self.multi.remove(&bar);
        }
    }
}
