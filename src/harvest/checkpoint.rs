use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::harvest::metadata_store::{read_json, write_json_atomic, MetadataResult};

/// Where an interrupted download run left off, valid only for the same URL set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadCheckpoint {
    pub class_name: String,
    pub url_set_hash: String,
    /// Index into the URL list of the last processed entry
    pub last_index: usize,
    pub saved_count: usize,
    pub updated_at: String,
}

/// Hex sha256 over the sorted URLs, so list order does not matter
pub fn url_set_hash(urls: &[String]) -> String {
    let mut sorted: Vec<&str> = urls.iter().map(String::as_str).collect();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    for url in sorted {
        hasher.update(url.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

impl DownloadCheckpoint {
    pub fn new(class_name: &str, url_set_hash: &str, last_index: usize, saved_count: usize) -> Self {
        Self {
            class_name: class_name.to_string(),
            url_set_hash: url_set_hash.to_string(),
            last_index,
            saved_count,
            updated_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// Loads the checkpoint only if it belongs to this class and URL set
    pub fn load_matching(path: &Path, class_name: &str, url_set_hash: &str) -> MetadataResult<Option<Self>> {
        let Some(checkpoint) = read_json::<DownloadCheckpoint>(path)? else {
            return Ok(None);
        };

        if checkpoint.class_name != class_name || checkpoint.url_set_hash != url_set_hash {
            info!(
                "Ignoring download checkpoint for '{}': URL set changed",
                class_name
            );
            return Ok(None);
        }
        Ok(Some(checkpoint))
    }

    pub fn save(&self, path: &Path) -> MetadataResult<()> {
        write_json_atomic(path, self)
    }

    pub fn clear(path: &Path) -> MetadataResult<()> {
        match fs::remove_file(path) {
            Ok(()) => {
                debug!("Removed download checkpoint {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
