//! Search request construction and result-surface locators
//!
//! This module provides:
//! 1. `QueryRefinements`, the optional filters appended to every search
//! 2. `SearchLocators`, the page-structure selectors the scraper relies on
//! 3. `build_search_request`, which turns a class name into the canonical search URL

use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use crate::harvest::browser::Locator;

const SEARCH_ENDPOINT: &str = "https://www.google.com/search";

/// Optional search filters. Empty values are left out of the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryRefinements {
    pub exact_phrase: String,
    pub any_of_words: String,
    pub exclude_words: String,
    pub image_size: String,
    pub aspect_ratio: String,
    pub color_type: String,
    pub specific_color: String,
    pub image_type: String,
    pub country: String,
    pub site_search: String,
    pub file_type: String,
}

impl QueryRefinements {
    /// Request parameters in the order the search surface expects them
    pub fn parameters(&self) -> [(&'static str, &str); 11] {
        [
            ("as_epq", self.exact_phrase.as_str()),
            ("as_oq", self.any_of_words.as_str()),
            ("as_eq", self.exclude_words.as_str()),
            ("imgsz", self.image_size.as_str()),
            ("imgar", self.aspect_ratio.as_str()),
            ("imgc", self.color_type.as_str()),
            ("imgcolor", self.specific_color.as_str()),
            ("imgtype", self.image_type.as_str()),
            ("cr", self.country.as_str()),
            ("as_sitesearch", self.site_search.as_str()),
            ("as_filetype", self.file_type.as_str()),
        ]
    }
}

/// Selectors for the search results surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchLocators {
    /// XPath of the result item at a scan position, `{index}` is replaced by the position
    pub result_item_xpath: String,
    /// Appended to the item XPath to reach the clickable thumbnail
    pub thumbnail_suffix: String,
    /// Class carried by "related searches" blocks mixed into the results
    pub related_searches_class: String,
    /// Classes that mark the full-size image in the detail view
    pub high_res_classes: Vec<String>,
    pub show_more_xpath: String,
    /// Probed after a deep-scan failure to tell whether results remain
    pub recovery_probe_xpath: String,
    /// CSS selector that must match before the page counts as loaded
    pub content_ready_css: String,
}

impl Default for SearchLocators {
    fn default() -> Self {
        Self {
            result_item_xpath: "//*[@id=\"rso\"]/div/div/div[1]/div/div/div[{index}]".to_string(),
            thumbnail_suffix: "//g-img".to_string(),
            related_searches_class: "BA0zte".to_string(),
            high_res_classes: ["n3VNCb", "iPVvYb", "r48jcc", "pT0Scc", "H8Rx8c"]
                .iter()
                .map(|class| class.to_string())
                .collect(),
            show_more_xpath: "//input[@type='button'][@value='Show more results']".to_string(),
            recovery_probe_xpath: "//*[@id=\"rso\"]//g-img".to_string(),
            content_ready_css: "img".to_string(),
        }
    }
}

impl SearchLocators {
    pub fn item(&self, position: u32) -> Locator {
        Locator::XPath(self.item_xpath(position))
    }

    pub fn thumbnail(&self, position: u32) -> Locator {
        Locator::XPath(format!("{}{}", self.item_xpath(position), self.thumbnail_suffix))
    }

    pub fn show_more(&self) -> Locator {
        Locator::XPath(self.show_more_xpath.clone())
    }

    pub fn recovery_probe(&self) -> Locator {
        Locator::XPath(self.recovery_probe_xpath.clone())
    }

    pub fn content_ready(&self) -> Locator {
        Locator::Css(self.content_ready_css.clone())
    }

    pub fn high_res(&self) -> impl Iterator<Item = Locator> + '_ {
        self.high_res_classes
            .iter()
            .map(|class| Locator::ClassName(class.clone()))
    }

    fn item_xpath(&self, position: u32) -> String {
        self.result_item_xpath.replace("{index}", &position.to_string())
    }
}

/// The canonical search for one class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub search_key: String,
    pub url: String,
}

/// Builds `?q=<class suffix>&tbm=isch` plus every non-empty refinement
pub fn build_search_request(class_name: &str, suffix: &str, refinements: &QueryRefinements) -> SearchRequest {
    let search_key = format!("{} {}", class_name.trim(), suffix.trim()).trim().to_string();

    let mut query = form_urlencoded::Serializer::new(String::new());
    query.append_pair("q", &search_key);
    query.append_pair("tbm", "isch");
    for (name, value) in refinements.parameters() {
        let value = value.trim();
        if !value.is_empty() {
            query.append_pair(name, value);
        }
    }

    SearchRequest {
        url: format!("{}?{}", SEARCH_ENDPOINT, query.finish()),
        search_key,
    }
}
