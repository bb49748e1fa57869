use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thirtyfour::prelude::*;
use tracing::{debug, error, info, warn};

use crate::browser::site::SiteBrowser;
use crate::browser::{BrowserLauncher, ListingBrowser};
use crate::cli::config::{BrowserSettings, SiteSettings};

/// Well-known Chrome install locations, checked in order
const CHROME_PATHS: &[&str] = &[
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium-browser",
];

/// Pick the Chrome binary: the configured one when it exists, otherwise the
/// first known location present on this machine.
pub fn find_chrome_binary(configured: Option<&str>) -> Option<PathBuf> {
    configured
        .into_iter()
        .chain(CHROME_PATHS.iter().copied())
        .map(Path::new)
        .find(|path| path.exists())
        .map(Path::to_path_buf)
}

/// WebDriver connection for one cycle
pub struct BrowserSession {
    config: BrowserSettings,
    driver: Option<WebDriver>,
}

impl BrowserSession {
    pub fn new(config: BrowserSettings) -> Self {
        Self {
            config,
            driver: None,
        }
    }

    pub fn settings(&self) -> &BrowserSettings {
        &self.config
    }

    /// Initialize the browser session
    pub async fn initialize(&mut self) -> Result<()> {
        // Close any existing session
        self.close().await;

        let mut caps = DesiredCapabilities::chrome();

        if self.config.headless {
            caps.add_chrome_arg("--headless=new")?;
            info!("Running in headless mode");
        } else {
            info!("Running with a visible browser window");
        }

        let (width, height) = self.config.window_size;
        caps.add_chrome_arg(&format!("--window-size={},{}", width, height))?;
        caps.add_chrome_arg("--disable-gpu")?;
        caps.add_chrome_arg("--no-sandbox")?;
        caps.add_chrome_arg("--disable-dev-shm-usage")?;
        caps.add_chrome_arg("--disable-extensions")?;
        caps.add_chrome_arg("--disable-plugins")?;

        match find_chrome_binary(self.config.chrome_binary.as_deref()) {
            Some(binary) => {
                debug!("Found Chrome binary at: {}", binary.display());
                caps.set_binary(&binary.to_string_lossy())?;
            }
            None => warn!("Chrome binary not found, using the driver default"),
        }

        let driver = WebDriver::new(&self.config.webdriver_url, caps)
            .await
            .with_context(|| format!("Failed to connect to WebDriver at {}", self.config.webdriver_url))?;

        driver
            .set_page_load_timeout(Duration::from_secs(self.config.page_load_timeout_secs))
            .await?;

        debug!("Browser session initialized");
        self.driver = Some(driver);

        Ok(())
    }

    pub fn driver(&self) -> Result<&WebDriver> {
        self.driver.as_ref().context("Browser session not initialized")
    }

    /// Navigate to a URL
    pub async fn navigate(&self, url: &str) -> Result<()> {
        let driver = self.driver()?;

        debug!("Navigating to: {}", url);
        driver
            .goto(url)
            .await
            .with_context(|| format!("Failed to navigate to URL: {}", url))?;

        Ok(())
    }

    pub async fn current_url(&self) -> Result<String> {
        let url = self.driver()?.current_url().await?;
        Ok(url.to_string())
    }

    pub async fn delete_cookies(&self) -> Result<()> {
        self.driver()?.delete_all_cookies().await?;
        Ok(())
    }

    /// Close the browser session
    pub async fn close(&mut self) {
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.quit().await {
                error!("Error closing browser session: {}", e);
            }
            debug!("Browser session closed");
        }
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = driver.quit().await {
                        error!("Error closing browser session during drop: {}", e);
                    }
                });
            }
        }
    }
}

/// Launches a Chrome session through a WebDriver server
pub struct WebDriverLauncher {
    browser: BrowserSettings,
    site: SiteSettings,
    dry_run: bool,
}

impl WebDriverLauncher {
    pub fn new(browser: BrowserSettings, site: SiteSettings, dry_run: bool) -> Self {
        Self {
            browser,
            site,
            dry_run,
        }
    }
}

#[async_trait]
impl BrowserLauncher for WebDriverLauncher {
    async fn launch(&self) -> Result<Box<dyn ListingBrowser>> {
        let mut session = BrowserSession::new(self.browser.clone());
        session.initialize().await?;
        let browser = SiteBrowser::new(session, self.site.clone(), self.dry_run)?;
        Ok(Box::new(browser))
    }
}
