//! Per-class JSON metadata persistence
//!
//! This module provides functionality for:
//! 1. The on-disk record of a class's harvest and download progress
//! 2. Zero-padded sequence keys with first-gap key assignment
//! 3. Output directory layout for images, metadata and checkpoints
//! 4. Whole-record atomic writes (temp file then rename)

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::harvest::integrity::class_slug;

/// `last_xpath_index` value written when a scan finishes cleanly
pub const SENTINEL_INDEX: u32 = 1;

/// Error types for metadata persistence
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid sequence key: {0}")]
    InvalidKey(String),
}

/// Result type for metadata operations
pub type MetadataResult<T> = Result<T, MetadataError>;

/// Zero-padded slot identifier within a class ("001", "002", ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceKey(u32);

impl SequenceKey {
    #[cfg(test)]
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

impl FromStr for SequenceKey {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit()) {
            return Err(MetadataError::InvalidKey(s.to_string()));
        }
        s.parse::<u32>()
            .ok()
            .filter(|v| *v > 0)
            .map(SequenceKey)
            .ok_or_else(|| MetadataError::InvalidKey(s.to_string()))
    }
}

impl Serialize for SequenceKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SequenceKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Where and at which scan position a URL was harvested
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchData {
    pub link: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub original_filename: String,
    #[serde(default)]
    pub xpath_index: u32,
}

/// Present only once the bytes were fetched, written and verified
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadData {
    pub filename: String,
    pub relative_path: String,
    pub hash: String,
    pub bytes: u64,
    pub width: u32,
    pub height: u32,
    pub mode: String,
    pub format: String,
    pub downloaded_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub fetch_data: FetchData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_data: Option<DownloadData>,
}

/// Single source of truth for one class's progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassMetadataRecord {
    #[serde(default)]
    pub search_urls_used: Vec<String>,
    #[serde(default)]
    pub search_key: String,
    #[serde(default = "sentinel_index")]
    pub last_xpath_index: u32,
    #[serde(default)]
    pub number_of_images_requested: u32,
    #[serde(default)]
    pub number_of_urls_found: u32,
    #[serde(default)]
    pub images: BTreeMap<SequenceKey, ImageRecord>,
}

fn sentinel_index() -> u32 {
    SENTINEL_INDEX
}

impl ClassMetadataRecord {
    pub fn new(search_key: impl Into<String>, requested: u32) -> Self {
        Self {
            search_urls_used: Vec::new(),
            search_key: search_key.into(),
            last_xpath_index: SENTINEL_INDEX,
            number_of_images_requested: requested,
            number_of_urls_found: 0,
            images: BTreeMap::new(),
        }
    }

    /// First unused key starting at 1, else one past the highest
    pub fn next_available_key(&self) -> SequenceKey {
        let mut expected = 1;
        for key in self.images.keys() {
            if key.value() != expected {
                break;
            }
            expected += 1;
        }
        SequenceKey(expected)
    }

    /// Stores a newly harvested URL under the next available key
    pub fn insert_image(&mut self, fetch_data: FetchData) -> SequenceKey {
        let key = self.next_available_key();
        self.images.insert(
            key,
            ImageRecord {
                fetch_data,
                download_data: None,
            },
        );
        self.sync_found_count();
        key
    }

    pub fn sync_found_count(&mut self) {
        self.number_of_urls_found = self.images.len() as u32;
    }

    pub fn harvested_count(&self) -> usize {
        self.images.len()
    }

    pub fn contains_link(&self, link: &str) -> bool {
        self.images.values().any(|image| image.fetch_data.link == link)
    }

    pub fn key_for_link(&self, link: &str) -> Option<SequenceKey> {
        self.images
            .iter()
            .find(|(_, image)| image.fetch_data.link == link)
            .map(|(key, _)| *key)
    }

    /// Harvested links in key order
    pub fn links(&self) -> Vec<String> {
        self.images
            .values()
            .map(|image| image.fetch_data.link.clone())
            .collect()
    }

    pub fn is_resumable(&self) -> bool {
        self.last_xpath_index != SENTINEL_INDEX
    }
}

/// Paths of everything the harvester writes under the output root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/images/<class>`
    pub fn images_dir(&self, class_name: &str) -> PathBuf {
        self.root.join("images").join(class_slug(class_name))
    }

    /// `<root>/metadata/<class>`
    pub fn metadata_dir(&self, class_name: &str) -> PathBuf {
        self.root.join("metadata").join(class_slug(class_name))
    }

    /// `<root>/metadata/<class>/<class>_metadata.json`
    pub fn metadata_file(&self, class_name: &str) -> PathBuf {
        let slug = class_slug(class_name);
        self.metadata_dir(class_name).join(format!("{}_metadata.json", slug))
    }

    pub fn checkpoint_file(&self, class_name: &str) -> PathBuf {
        let slug = class_slug(class_name);
        self.metadata_dir(class_name)
            .join(format!("{}_download_checkpoint.json", slug))
    }

    /// `/`-separated path relative to the root, as stored in `download_data`
    pub fn relative_path(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn resolve(&self, relative_path: &str) -> PathBuf {
        relative_path
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    pub fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(self.root.join("images"))?;
        fs::create_dir_all(self.root.join("metadata"))
    }
}

/// Loads and saves class records
pub struct MetadataStore;

impl MetadataStore {
    /// Returns `None` when the file is missing. An unreadable record is moved aside
    /// to `.json.corrupt` and also reported as `None` so the class starts over.
    pub fn load_record(path: &Path) -> MetadataResult<Option<ClassMetadataRecord>> {
        let Some(mut record) = read_json::<ClassMetadataRecord>(path)? else {
            return Ok(None);
        };
        record.sync_found_count();
        Ok(Some(record))
    }

    pub fn save_record(path: &Path, record: &ClassMetadataRecord) -> MetadataResult<()> {
        write_json_atomic(path, record)
    }
}

/// Reads a JSON document, moving unparsable files aside
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> MetadataResult<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_str(&content) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            error!("Failed to parse {}: {}", path.display(), e);
            let backup = path.with_extension("json.corrupt");
            if let Err(rename_err) = fs::rename(path, &backup) {
                warn!("Failed to move corrupt file aside: {}", rename_err);
            } else {
                warn!("Moved corrupt file to {}", backup.display());
            }
            Ok(None)
        }
    }
}

/// Writes the full document to a sibling temp file and renames it into place
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> MetadataResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(value)?;
    let tmp_path = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp_path, json)?;
    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    debug!("Saved {}", path.display());
    Ok(())
}
