//! Browser automation capability
//!
//! This module provides:
//! 1. The `BrowserSession` trait the scraper drives (navigate, wait, find, click, script)
//! 2. `DriverHandle`, which decides at the type level whether closing quits the browser
//! 3. A Chromium implementation over the DevTools protocol

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::error::CdpError;
use chromiumoxide::{Browser, BrowserConfig, Element, Page};
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::harvest::config_loader;

/// Interval between element lookups while waiting
const ELEMENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Error types for browser operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrowserError {
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("No element matches {0}")]
    NoSuchElement(String),

    #[error("Stale element reference")]
    StaleElement,

    #[error("Script error: {0}")]
    Script(String),

    #[error("Session lost: {0}")]
    SessionLost(String),

    #[error("Failed to launch browser: {0}")]
    Launch(String),

    #[error("Browser protocol error: {0}")]
    Protocol(String),
}

impl BrowserError {
    /// Whether the session can keep being used after this error
    pub fn is_transient(&self) -> bool {
        !matches!(self, BrowserError::SessionLost(_) | BrowserError::Launch(_))
    }
}

/// Result type for browser operations
pub type BrowserResult<T> = Result<T, BrowserError>;

/// How to find elements on the page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Css(String),
    XPath(String),
    ClassName(String),
}

impl Locator {
    pub fn describe(&self) -> String {
        match self {
            Locator::Css(s) => format!("css '{}'", s),
            Locator::XPath(s) => format!("xpath '{}'", s),
            Locator::ClassName(s) => format!("class '{}'", s),
        }
    }
}

/// One automated browser tab
pub trait BrowserSession: Send + Sync + 'static {
    type Element: Send + Sync;

    fn navigate(&self, url: &str) -> impl Future<Output = BrowserResult<()>> + Send;

    /// Polls until `locator` matches or `timeout` elapses
    fn wait_for_element(
        &self,
        locator: &Locator,
        timeout: Duration,
    ) -> impl Future<Output = BrowserResult<Self::Element>> + Send;

    fn find_elements(&self, locator: &Locator) -> impl Future<Output = BrowserResult<Vec<Self::Element>>> + Send;

    fn click(&self, element: &Self::Element) -> impl Future<Output = BrowserResult<()>> + Send;

    fn attribute(
        &self,
        element: &Self::Element,
        name: &str,
    ) -> impl Future<Output = BrowserResult<Option<String>>> + Send;

    /// Evaluates `script` in the page
    fn execute_script(&self, script: &str) -> impl Future<Output = BrowserResult<serde_json::Value>> + Send;

    /// Calls a JS `function() { ... }` with `this` bound to `element`
    fn execute_on_element(
        &self,
        element: &Self::Element,
        function: &str,
    ) -> impl Future<Output = BrowserResult<()>> + Send;

    /// Fails with `SessionLost` once the browser is gone
    fn current_url(&self) -> impl Future<Output = BrowserResult<String>> + Send;

    fn quit(&self) -> impl Future<Output = BrowserResult<()>> + Send;
}

/// Creates sessions for the pool
pub trait SessionFactory: Send + Sync {
    type Session: BrowserSession;

    fn create(&self, id: usize) -> impl Future<Output = BrowserResult<Self::Session>> + Send;
}

/// A session the holder either owns (closing quits it) or borrows from a pool
/// (closing leaves it running).
pub enum DriverHandle<S> {
    Owned(S),
    Borrowed(Arc<S>),
}

impl<S: BrowserSession> DriverHandle<S> {
    pub fn session(&self) -> &S {
        match self {
            DriverHandle::Owned(session) => session,
            DriverHandle::Borrowed(session) => session,
        }
    }

    pub async fn close(self) -> BrowserResult<()> {
        match self {
            DriverHandle::Owned(session) => session.quit().await,
            DriverHandle::Borrowed(_) => Ok(()),
        }
    }
}

/// Launch options for [ChromiumFactory]
#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub executable_path: Option<PathBuf>,
    pub headless: bool,
    pub window_width: u32,
    pub window_height: u32,
    pub extra_args: Vec<String>,
    pub request_timeout: Duration,
}

impl From<&config_loader::Browser> for BrowserSettings {
    fn from(browser: &config_loader::Browser) -> Self {
        Self {
            executable_path: browser
                .executable_path
                .as_ref()
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
            headless: browser.headless,
            window_width: browser.window_width,
            window_height: browser.window_height,
            extra_args: browser.extra_args.clone(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Launches one Chromium process per session
pub struct ChromiumFactory {
    settings: BrowserSettings,
}

impl ChromiumFactory {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }

    fn browser_config(&self) -> BrowserResult<BrowserConfig> {
        let mut builder = BrowserConfig::builder()
            .window_size(self.settings.window_width, self.settings.window_height)
            .request_timeout(self.settings.request_timeout)
            .no_sandbox()
            .args(self.settings.extra_args.iter().cloned());

        if !self.settings.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &self.settings.executable_path {
            builder = builder.chrome_executable(path);
        }

        builder.build().map_err(BrowserError::Launch)
    }
}

impl SessionFactory for ChromiumFactory {
    type Session = ChromiumSession;

    async fn create(&self, id: usize) -> BrowserResult<ChromiumSession> {
        let config = self.browser_config()?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler stopped: {}", e);
                    break;
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                handler_task.abort();
                return Err(BrowserError::Launch(e.to_string()));
            }
        };

        info!("Browser session {} started", id);
        Ok(ChromiumSession {
            id,
            browser: Mutex::new(Some(browser)),
            page,
            handler_task,
        })
    }
}

/// A Chromium process with a single page
pub struct ChromiumSession {
    id: usize,
    browser: Mutex<Option<Browser>>,
    page: Page,
    handler_task: JoinHandle<()>,
}

impl ChromiumSession {
    async fn find_all(&self, locator: &Locator) -> BrowserResult<Vec<Element>> {
        let result = match locator {
            Locator::Css(selector) => self.page.find_elements(selector.as_str()).await,
            Locator::XPath(xpath) => self.page.find_xpaths(xpath.as_str()).await,
            Locator::ClassName(class) => self.page.find_elements(format!(".{}", class)).await,
        };

        match result {
            Ok(elements) => Ok(elements),
            Err(CdpError::NotFound) => Ok(Vec::new()),
            Err(e) => match map_cdp_error(e) {
                // an empty match surfaces as a protocol error on some pages
                BrowserError::NoSuchElement(_) => Ok(Vec::new()),
                other => Err(other),
            },
        }
    }
}

impl BrowserSession for ChromiumSession {
    type Element = Element;

    async fn navigate(&self, url: &str) -> BrowserResult<()> {
        self.page.goto(url).await.map_err(map_cdp_error)?;
        Ok(())
    }

    async fn wait_for_element(&self, locator: &Locator, timeout: Duration) -> BrowserResult<Element> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(element) = self.find_all(locator).await?.into_iter().next() {
                return Ok(element);
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::Timeout(locator.describe()));
            }
            sleep(ELEMENT_POLL_INTERVAL).await;
        }
    }

    async fn find_elements(&self, locator: &Locator) -> BrowserResult<Vec<Element>> {
        self.find_all(locator).await
    }

    async fn click(&self, element: &Element) -> BrowserResult<()> {
        element.click().await.map_err(map_cdp_error)?;
        Ok(())
    }

    async fn attribute(&self, element: &Element, name: &str) -> BrowserResult<Option<String>> {
        element.attribute(name).await.map_err(map_cdp_error)
    }

    async fn execute_script(&self, script: &str) -> BrowserResult<serde_json::Value> {
        let result = self.page.evaluate(script).await.map_err(map_cdp_error)?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn execute_on_element(&self, element: &Element, function: &str) -> BrowserResult<()> {
        element
            .call_js_fn(function, false)
            .await
            .map_err(map_cdp_error)?;
        Ok(())
    }

    async fn current_url(&self) -> BrowserResult<String> {
        if self.browser.lock().await.is_none() {
            return Err(BrowserError::SessionLost(format!("session {} was closed", self.id)));
        }
        match self.page.url().await {
            Ok(url) => Ok(url.unwrap_or_else(|| "about:blank".to_string())),
            Err(e) => Err(BrowserError::SessionLost(e.to_string())),
        }
    }

    async fn quit(&self) -> BrowserResult<()> {
        let Some(mut browser) = self.browser.lock().await.take() else {
            return Ok(());
        };

        if let Err(e) = browser.close().await {
            warn!("Browser session {} did not close cleanly: {}", self.id, e);
            let _ = browser.kill().await;
        }
        if let Err(e) = browser.wait().await {
            debug!("Waiting for browser {} to exit failed: {}", self.id, e);
        }
        self.handler_task.abort();
        info!("Browser session {} closed", self.id);
        Ok(())
    }
}

fn map_cdp_error(error: CdpError) -> BrowserError {
    match error {
        CdpError::Timeout => BrowserError::Timeout("browser request".to_string()),
        CdpError::NotFound => BrowserError::NoSuchElement("requested node".to_string()),
        CdpError::JavascriptException(details) => BrowserError::Script(format!("{:?}", details)),
        CdpError::Ws(e) => BrowserError::SessionLost(e.to_string()),
        CdpError::ChannelSendError(e) => BrowserError::SessionLost(e.to_string()),
        CdpError::NoResponse => BrowserError::SessionLost("no response from browser".to_string()),
        CdpError::ScrollingFailed(msg) => {
            debug!("Element interaction failed: {}", msg);
            BrowserError::StaleElement
        }
        other => {
            let message = other.to_string();
            let lowered = message.to_ascii_lowercase();
            if lowered.contains("could not find node") || lowered.contains("not attached") {
                BrowserError::StaleElement
            } else if lowered.contains("not found") {
                BrowserError::NoSuchElement(message)
            } else {
                BrowserError::Protocol(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_describe() {
        assert_eq!(Locator::ClassName("n3VNCb".to_string()).describe(), "class 'n3VNCb'");
    }

    #[test]
    fn test_session_lost_is_not_transient() {
        assert!(!BrowserError::SessionLost("gone".to_string()).is_transient());
        assert!(BrowserError::StaleElement.is_transient());
        assert!(BrowserError::Timeout("x".to_string()).is_transient());
    }

    #[test]
    fn test_settings_ignore_blank_executable() {
        let mut browser = config_loader::Browser::default();
        browser.executable_path = Some("   ".to_string());
        assert!(BrowserSettings::from(&browser).executable_path.is_none());

        browser.executable_path = Some("/usr/bin/chromium".to_string());
        assert_eq!(
            BrowserSettings::from(&browser).executable_path,
            Some(PathBuf::from("/usr/bin/chromium"))
        );
    }
}
