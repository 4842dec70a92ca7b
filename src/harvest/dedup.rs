//! Three-tier duplicate classification for harvested URLs.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::harvest::metadata_store::ClassMetadataRecord;
use crate::harvest::url_index::SharedUrlIndex;

/// Result of checking a candidate URL, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Unique,
    IntraClassDuplicate,
    InterClassDuplicate,
    CrossCategoryDuplicate,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Unique => write!(f, "unique"),
            Classification::IntraClassDuplicate => write!(f, "intra_class_duplicate"),
            Classification::InterClassDuplicate => write!(f, "inter_class_duplicate"),
            Classification::CrossCategoryDuplicate => write!(f, "cross_category_duplicate"),
        }
    }
}

/// Whether a URL already harvested in another category is still added to this class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossCategoryPolicy {
    #[default]
    Skip,
    Record,
}

/// Classifies candidates for one `(category, class)`
pub struct DuplicationChecker {
    index: Arc<SharedUrlIndex>,
    category: String,
    class_name: String,
    cross_category_policy: CrossCategoryPolicy,
}

impl DuplicationChecker {
    pub fn new(
        index: Arc<SharedUrlIndex>,
        category: impl Into<String>,
        class_name: impl Into<String>,
        cross_category_policy: CrossCategoryPolicy,
    ) -> Self {
        Self {
            index,
            category: category.into(),
            class_name: class_name.into(),
            cross_category_policy,
        }
    }

    /// First match wins: this class, then siblings in the category, then every other category.
    pub fn classify(&self, url: &str, record: &ClassMetadataRecord) -> Classification {
        if record.contains_link(url) {
            return Classification::IntraClassDuplicate;
        }

        if self
            .index
            .get_category_urls(&self.category, Some(&self.class_name))
            .contains(url)
        {
            return Classification::InterClassDuplicate;
        }

        if self
            .index
            .get_all_urls(Some(&self.category), None)
            .contains(url)
        {
            return Classification::CrossCategoryDuplicate;
        }

        Classification::Unique
    }

    /// Whether a classified candidate gets its own entry in this class's record
    pub fn should_record(&self, classification: Classification) -> bool {
        match classification {
            Classification::Unique => true,
            Classification::CrossCategoryDuplicate => {
                self.cross_category_policy == CrossCategoryPolicy::Record
            }
            _ => false,
        }
    }
}
