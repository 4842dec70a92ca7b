//! Process-wide cache of harvested URLs, keyed by category then class.
//!
//! The per-class metadata files stay authoritative. Each class's URL set is
//! reloaded from its file when the file changed on disk since it was cached, or
//! when the refresh interval elapsed, so the index can be dropped and rebuilt
//! at any time.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::harvest::config_loader::CategoryCatalog;
use crate::harvest::metadata_store::{MetadataStore, OutputLayout};

struct ClassEntry {
    urls: HashSet<String>,
    /// Wall-clock time of the last load, compared against the file's mtime
    cached_at: SystemTime,
    loaded_at: Option<Instant>,
}

impl ClassEntry {
    fn empty() -> Self {
        Self {
            urls: HashSet::new(),
            cached_at: SystemTime::UNIX_EPOCH,
            loaded_at: None,
        }
    }
}

#[derive(Default)]
struct IndexState {
    categories: HashMap<String, HashMap<String, ClassEntry>>,
    global: HashSet<String>,
}

pub struct SharedUrlIndex {
    layout: OutputLayout,
    refresh_interval: Duration,
    state: Mutex<IndexState>,
}

impl SharedUrlIndex {
    pub fn new(layout: OutputLayout, catalog: &CategoryCatalog, refresh_interval: Duration) -> Self {
        let mut state = IndexState::default();
        for (category, classes) in catalog {
            let entries = state.categories.entry(category.clone()).or_default();
            for class_name in classes {
                entries.entry(class_name.clone()).or_insert_with(ClassEntry::empty);
            }
        }

        Self {
            layout,
            refresh_interval,
            state: Mutex::new(state),
        }
    }

    /// URLs of every class in `category` except `exclude_class`
    pub fn get_category_urls(&self, category: &str, exclude_class: Option<&str>) -> HashSet<String> {
        let mut state = self.state.lock();
        let changed = self.refresh_category(&mut state, category);
        if changed {
            rebuild_global(&mut state);
        }

        let mut urls = HashSet::new();
        if let Some(classes) = state.categories.get(category) {
            for (class_name, entry) in classes {
                if Some(class_name.as_str()) != exclude_class {
                    urls.extend(entry.urls.iter().cloned());
                }
            }
        }
        urls
    }

    /// URLs of every class outside `exclude_category`, also skipping `exclude_class`
    pub fn get_all_urls(&self, exclude_category: Option<&str>, exclude_class: Option<&str>) -> HashSet<String> {
        let mut state = self.state.lock();
        let categories: Vec<String> = state.categories.keys().cloned().collect();
        let mut changed = false;
        for category in &categories {
            if Some(category.as_str()) != exclude_category {
                changed |= self.refresh_category(&mut state, category);
            }
        }
        if changed {
            rebuild_global(&mut state);
        }

        let mut urls = HashSet::new();
        for (category, classes) in &state.categories {
            if Some(category.as_str()) == exclude_category {
                continue;
            }
            for (class_name, entry) in classes {
                if Some(class_name.as_str()) != exclude_class {
                    urls.extend(entry.urls.iter().cloned());
                }
            }
        }
        urls
    }

    /// Records a newly accepted URL without touching the disk
    pub fn add_url(&self, category: &str, class_name: &str, url: &str) {
        let mut state = self.state.lock();
        state
            .categories
            .entry(category.to_string())
            .or_default()
            .entry(class_name.to_string())
            .or_insert_with(ClassEntry::empty)
            .urls
            .insert(url.to_string());
        state.global.insert(url.to_string());
    }

    /// Whether any cached class holds `url`. Answers from the flattened cache without refreshing.
    #[cfg(test)]
    pub fn contains_cached(&self, url: &str) -> bool {
        self.state.lock().global.contains(url)
    }

    pub fn cached_url_count(&self) -> usize {
        self.state.lock().global.len()
    }

    /// Loads every known class; used once at start-up
    pub fn warm(&self) {
        let mut state = self.state.lock();
        let categories: Vec<String> = state.categories.keys().cloned().collect();
        for category in &categories {
            self.refresh_category(&mut state, category);
        }
        rebuild_global(&mut state);
        debug!("URL index warmed with {} urls", state.global.len());
    }

    fn refresh_category(&self, state: &mut IndexState, category: &str) -> bool {
        let Some(classes) = state.categories.get_mut(category) else {
            return false;
        };

        let mut changed = false;
        for (class_name, entry) in classes.iter_mut() {
            if self.is_stale(class_name, entry) {
                self.reload(class_name, entry);
                changed = true;
            }
        }
        changed
    }

    fn is_stale(&self, class_name: &str, entry: &ClassEntry) -> bool {
        let Some(loaded_at) = entry.loaded_at else {
            return true;
        };
        if loaded_at.elapsed() >= self.refresh_interval {
            return true;
        }
        match fs::metadata(self.layout.metadata_file(class_name)).and_then(|m| m.modified()) {
            Ok(modified) => modified > entry.cached_at,
            Err(_) => false,
        }
    }

    fn reload(&self, class_name: &str, entry: &mut ClassEntry) {
        let path = self.layout.metadata_file(class_name);
        let cached_at = SystemTime::now();
        let first_load = entry.loaded_at.is_none();
        match MetadataStore::load_record(&path) {
            // on first load, keep anything added before the class was ever read
            Ok(Some(record)) if first_load => entry.urls.extend(record.links()),
            Ok(Some(record)) => entry.urls = record.links().into_iter().collect(),
            Ok(None) if first_load => {}
            Ok(None) => entry.urls.clear(),
            Err(e) => warn!("Failed to refresh index for '{}': {}", class_name, e),
        }
        entry.cached_at = cached_at;
        entry.loaded_at = Some(Instant::now());
    }
}

fn rebuild_global(state: &mut IndexState) {
    let global: HashSet<String> = state
        .categories
        .values()
        .flat_map(|classes| classes.values())
        .flat_map(|entry| entry.urls.iter().cloned())
        .collect();
    state.global = global;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::metadata_store::{ClassMetadataRecord, FetchData};

    fn write_class(layout: &OutputLayout, class_name: &str, links: &[&str]) {
        let mut record = ClassMetadataRecord::new(class_name, 10);
        for link in links {
            record.insert_image(FetchData {
                link: link.to_string(),
                domain: String::new(),
                original_filename: String::new(),
                xpath_index: 1,
            });
        }
        MetadataStore::save_record(&layout.metadata_file(class_name), &record).expect("save");
    }

    fn catalog() -> CategoryCatalog {
        let mut catalog = CategoryCatalog::new();
        catalog.insert("Soups".to_string(), vec!["Arroz Caldo".to_string(), "Sinigang".to_string()]);
        catalog.insert("Desserts".to_string(), vec!["Halo Halo".to_string()]);
        catalog
    }

    #[test]
    fn test_category_urls_exclude_class() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = OutputLayout::new(dir.path());
        write_class(&layout, "Arroz Caldo", &["https://a/1"]);
        write_class(&layout, "Sinigang", &["https://s/1", "https://s/2"]);
        write_class(&layout, "Halo Halo", &["https://h/1"]);

        let index = SharedUrlIndex::new(layout, &catalog(), Duration::from_secs(30));

        let soups = index.get_category_urls("Soups", Some("Arroz Caldo"));
        assert_eq!(soups.len(), 2);
        assert!(soups.contains("https://s/1"));
        assert!(!soups.contains("https://a/1"));

        let outside = index.get_all_urls(Some("Soups"), None);
        assert_eq!(outside, HashSet::from(["https://h/1".to_string()]));
    }

    #[test]
    fn test_newer_file_forces_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = OutputLayout::new(dir.path());
        write_class(&layout, "Sinigang", &["https://s/1"]);

        let index = SharedUrlIndex::new(layout.clone(), &catalog(), Duration::from_secs(3600));
        assert_eq!(index.get_category_urls("Soups", None).len(), 1);

        std::thread::sleep(Duration::from_millis(20));
        write_class(&layout, "Sinigang", &["https://s/1", "https://s/2"]);

        let urls = index.get_category_urls("Soups", None);
        assert!(urls.contains("https://s/2"));
        assert!(index.contains_cached("https://s/2"));
    }

    #[test]
    fn test_add_url_is_visible_to_other_classes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = SharedUrlIndex::new(OutputLayout::new(dir.path()), &catalog(), Duration::from_secs(30));

        index.add_url("Soups", "Arroz Caldo", "https://a/new");

        assert!(index.get_category_urls("Soups", Some("Sinigang")).contains("https://a/new"));
        assert!(index.get_all_urls(Some("Desserts"), None).contains("https://a/new"));
        assert!(!index.get_all_urls(Some("Soups"), None).contains("https://a/new"));
        assert_eq!(index.cached_url_count(), 1);
    }
}
