//! Structured logging for the image harvester
//!
//! This module provides functionality for:
//! 1. Console and daily-rotated file output through `tracing`
//! 2. JSON or line format for the file layer
//! 3. One structured summary event per finished task

use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter, Layer,
};

use crate::harvest::config_loader::Logging;
use crate::harvest::orchestration::{TaskOutcome, TaskReport};

/// Error types for logging
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type for logging operations
pub type LoggerResult<T> = Result<T, LoggerError>;

/// Keeps the non-blocking file writer alive; dropping it flushes pending lines
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(logging: &Logging, log_dir: &Path) -> LoggerResult<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.log_level))
        .map_err(|e| LoggerError::Logging(e.to_string()))?;

    let console_layer = logging.log_to_terminal.then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    });

    let mut file_guard = None;
    let file_layer = if logging.log_to_file {
        if !log_dir.exists() {
            fs::create_dir_all(log_dir)?;
        }

        let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "image_harvester.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        file_guard = Some(guard);

        let layer = match logging.log_format.as_str() {
            "json" => fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_span_events(FmtSpan::CLOSE)
                .boxed(),
            _ => fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_span_events(FmtSpan::CLOSE)
                .boxed(),
        };
        Some(layer)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggerError::Logging(e.to_string()))?;

    info!(
        log_format = %logging.log_format,
        log_level = %logging.log_level,
        "Logger initialized"
    );

    Ok(LogGuard { _file_guard: file_guard })
}

/// Emits the terminal summary line for one task
pub fn log_task_report(report: &TaskReport) {
    let worker = match report.worker_id {
        Some(id) => format!("Worker {}", id),
        None => "Queue".to_string(),
    };
    let category = report.task.category.as_str();
    let class = report.task.class_name.as_str();

    match &report.outcome {
        TaskOutcome::Succeeded { found, saved } => info!(
            entry_type = "task",
            status = "succeeded",
            worker = %worker, category, class, found, saved,
            "[{}] '{}' completed: {} urls, {} new files", worker, class, found, saved
        ),
        TaskOutcome::Partial { reason, found, saved } => info!(
            entry_type = "task",
            status = "partial",
            reason = %reason,
            worker = %worker, category, class, found, saved,
            "[{}] '{}' partially completed ({}): {} urls, {} new files",
            worker, class, reason, found, saved
        ),
        TaskOutcome::Failed(message) => info!(
            entry_type = "task",
            status = "failed",
            worker = %worker, category, class,
            error = %message,
            "[{}] '{}' failed: {}", worker, class, message
        ),
        TaskOutcome::Interrupted => info!(
            entry_type = "task",
            status = "interrupted",
            worker = %worker, category, class,
            "[{}] '{}' interrupted", worker, class
        ),
    }
}
