//! Download Engine for the image harvester
//!
//! This module provides a download engine that:
//! 1. Verifies every recorded download against the file on disk and heals mismatches
//! 2. Fetches the harvested URLs of a class through an `ImageSource`
//! 3. Checks each written file against the payload hash before recording it
//! 4. Persists the record and a resumable checkpoint every few downloads

use std::io;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::harvest::checkpoint::{url_set_hash, DownloadCheckpoint};
use crate::harvest::fetcher::{FetchError, ImageSource};
use crate::harvest::integrity::{
    analyze_image, content_hash, extension_for, hash_file, original_filename_hint, sanitize_stem,
    sequence_filename,
};
use crate::harvest::metadata_store::{
    ClassMetadataRecord, DownloadData, MetadataError, MetadataStore, OutputLayout, SequenceKey,
};
use crate::harvest::orchestration::ShutdownSignal;
use crate::harvest::progress::ProgressReporter;

/// Downloads between record and checkpoint saves
pub const DEFAULT_CHECKPOINT_INTERVAL: usize = 5;

/// Error types for the download engine
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Empty payload from {0}")]
    EmptyPayload(String),

    #[error("Written file does not match payload: {0}")]
    HashMismatch(String),
}

/// Result type for download operations
pub type DownloadResult<T> = Result<T, DownloadError>;

/// State of a recorded download compared with the disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Valid,
    Missing,
    HashMismatch,
}

/// Downloads the harvested images of one class
pub struct DownloadEngine<F: ImageSource> {
    source: Arc<F>,
    layout: OutputLayout,
    class_name: String,
    worker_id: usize,
    progress: Arc<dyn ProgressReporter>,
    shutdown: ShutdownSignal,
    checkpoint_interval: usize,
}

impl<F: ImageSource> DownloadEngine<F> {
    pub fn new(
        source: Arc<F>,
        layout: OutputLayout,
        class_name: impl Into<String>,
        worker_id: usize,
        progress: Arc<dyn ProgressReporter>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            source,
            layout,
            class_name: class_name.into(),
            worker_id,
            progress,
            shutdown,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
        }
    }

    #[cfg(test)]
    pub fn with_checkpoint_interval(mut self, interval: usize) -> Self {
        self.checkpoint_interval = interval.max(1);
        self
    }

    /// Downloads every recorded entry whose link is in `urls`, in list order.
    /// Returns how many files were newly saved by this call.
    #[instrument(skip(self, urls), fields(class = %self.class_name, urls = urls.len()))]
    pub async fn save_images(&self, urls: &[String], keep_original_filenames: bool) -> DownloadResult<usize> {
        let metadata_path = self.layout.metadata_file(&self.class_name);
        let checkpoint_path = self.layout.checkpoint_file(&self.class_name);

        let Some(mut record) = MetadataStore::load_record(&metadata_path)? else {
            warn!("No metadata for '{}', nothing to download", self.class_name);
            return Ok(0);
        };

        let healed = self.verify_downloads(&mut record);
        if healed > 0 {
            MetadataStore::save_record(&metadata_path, &record)?;
        }

        let mut unique: Vec<String> = Vec::with_capacity(urls.len());
        for url in urls {
            if !unique.contains(url) {
                unique.push(url.clone());
            }
        }

        let set_hash = url_set_hash(&unique);
        let mut checkpoint = DownloadCheckpoint::load_matching(&checkpoint_path, &self.class_name, &set_hash)?;
        if healed > 0 && checkpoint.is_some() {
            // healed entries may sit before the checkpoint, so do a full pass
            info!(
                "[Worker {}] Ignoring download checkpoint for '{}' after healing {} entries",
                self.worker_id, self.class_name, healed
            );
            checkpoint = None;
        }
        let (start, prior_saved) = match &checkpoint {
            Some(cp) => {
                info!(
                    "[Worker {}] Resuming downloads for '{}' after index {}",
                    self.worker_id, self.class_name, cp.last_index
                );
                (cp.last_index + 1, cp.saved_count)
            }
            None => (0, 0),
        };

        self.progress.start(
            self.worker_id,
            unique.len() as u64,
            &format!("{} (download)", self.class_name),
        );
        self.progress.advance(self.worker_id, start.min(unique.len()) as u64);

        let mut saved = 0;
        let mut attempted = 0;
        let mut last_index = start.checked_sub(1);
        let mut interrupted = false;

        for (i, url) in unique.iter().enumerate().skip(start) {
            if self.shutdown.is_requested() {
                interrupted = true;
                break;
            }

            let Some(key) = record.key_for_link(url) else {
                debug!("{} is not recorded for '{}', skipping", url, self.class_name);
                last_index = Some(i);
                self.progress.advance(self.worker_id, 1);
                continue;
            };
            if record
                .images
                .get(&key)
                .is_some_and(|image| image.download_data.is_some())
            {
                last_index = Some(i);
                self.progress.advance(self.worker_id, 1);
                continue;
            }

            attempted += 1;
            match self.download_one(&record, key, url, keep_original_filenames).await {
                Ok(data) => {
                    debug!("Saved {} as {}", url, data.relative_path);
                    if let Some(image) = record.images.get_mut(&key) {
                        image.download_data = Some(data);
                    }
                    saved += 1;
                }
                Err(e) => warn!("[Worker {}] Failed to download {}: {}", self.worker_id, url, e),
            }
            last_index = Some(i);
            self.progress.advance(self.worker_id, 1);

            if attempted % self.checkpoint_interval == 0 {
                self.save_progress(&metadata_path, &checkpoint_path, &record, &set_hash, i, prior_saved + saved);
            }
        }

        MetadataStore::save_record(&metadata_path, &record)?;
        match (interrupted, last_index) {
            (true, Some(index)) => {
                DownloadCheckpoint::new(&self.class_name, &set_hash, index, prior_saved + saved)
                    .save(&checkpoint_path)?;
            }
            (true, None) => {}
            (false, _) => DownloadCheckpoint::clear(&checkpoint_path)?,
        }
        self.progress.complete(self.worker_id);

        info!(
            "[Worker {}] Downloaded {} new images for '{}' ({} attempted)",
            self.worker_id, saved, self.class_name, attempted
        );
        Ok(saved)
    }

    /// Drops every `download_data` whose file is missing or altered. Returns how many were dropped.
    pub fn verify_downloads(&self, record: &mut ClassMetadataRecord) -> usize {
        let mut healed = 0;
        for (key, image) in record.images.iter_mut() {
            let Some(data) = &image.download_data else {
                continue;
            };

            let path = self.layout.resolve(&data.relative_path);
            let outcome = verify_file(&path, &data.hash);
            if outcome == VerifyOutcome::Valid {
                continue;
            }

            warn!(
                "Download {} of '{}' is {:?}, scheduling re-download",
                key, self.class_name, outcome
            );
            if outcome == VerifyOutcome::HashMismatch {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("Failed to remove stale file {}: {}", path.display(), e);
                }
            }
            image.download_data = None;
            healed += 1;
        }
        healed
    }

    async fn download_one(
        &self,
        record: &ClassMetadataRecord,
        key: SequenceKey,
        url: &str,
        keep_original_filenames: bool,
    ) -> DownloadResult<DownloadData> {
        let bytes = self.source.fetch(url).await?;
        if bytes.is_empty() {
            return Err(DownloadError::EmptyPayload(url.to_string()));
        }

        let hash = content_hash(&bytes);
        let info = analyze_image(&bytes, url);
        let filename = self.filename_for(record, key, url, &info.format, keep_original_filenames);

        let dir = self.layout.images_dir(&self.class_name);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(&filename);
        tokio::fs::write(&path, &bytes).await?;

        let written = tokio::fs::read(&path).await?;
        if content_hash(&written) != hash {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(DownloadError::HashMismatch(path.display().to_string()));
        }

        Ok(DownloadData {
            filename,
            relative_path: self.layout.relative_path(&path),
            hash,
            bytes: bytes.len() as u64,
            width: info.width,
            height: info.height,
            mode: info.mode,
            format: info.format,
            downloaded_at: chrono::Local::now().to_rfc3339(),
        })
    }

    /// Original stem when asked for and usable, else the class sequence name.
    /// A stem already taken by another entry gets the key appended.
    fn filename_for(
        &self,
        record: &ClassMetadataRecord,
        key: SequenceKey,
        url: &str,
        format: &str,
        keep_original_filenames: bool,
    ) -> String {
        let key_text = key.to_string();
        if !keep_original_filenames {
            return sequence_filename(&self.class_name, &key_text, format);
        }

        let hint = record
            .images
            .get(&key)
            .map(|image| image.fetch_data.original_filename.clone())
            .filter(|name| !name.is_empty() && name != "unknown")
            .unwrap_or_else(|| original_filename_hint(url));
        let stem = sanitize_stem(&hint);
        if stem.is_empty() || stem == "unknown" {
            return sequence_filename(&self.class_name, &key_text, format);
        }

        let extension = extension_for(format);
        let candidate = format!("{}.{}", stem, extension);
        let taken = record.images.iter().any(|(other_key, image)| {
            *other_key != key
                && image
                    .download_data
                    .as_ref()
                    .is_some_and(|data| data.filename == candidate)
        });
        if taken {
            format!("{}_{}.{}", stem, key_text, extension)
        } else {
            candidate
        }
    }

    fn save_progress(
        &self,
        metadata_path: &Path,
        checkpoint_path: &Path,
        record: &ClassMetadataRecord,
        set_hash: &str,
        index: usize,
        saved_count: usize,
    ) {
        if let Err(e) = MetadataStore::save_record(metadata_path, record) {
            warn!("Checkpoint save of '{}' metadata failed: {}", self.class_name, e);
            return;
        }
        if let Err(e) = DownloadCheckpoint::new(&self.class_name, set_hash, index, saved_count).save(checkpoint_path) {
            warn!("Failed to save download checkpoint for '{}': {}", self.class_name, e);
        }
    }
}

/// Compares the file at `path` with the recorded hash
pub fn verify_file(path: &Path, expected_hash: &str) -> VerifyOutcome {
    if !path.exists() {
        return VerifyOutcome::Missing;
    }
    match hash_file(path) {
        Ok(actual) if actual == expected_hash => VerifyOutcome::Valid,
        Ok(_) => VerifyOutcome::HashMismatch,
        Err(e) => {
            debug!("Could not hash {}: {}", path.display(), e);
            VerifyOutcome::Missing
        }
    }
}
