pub mod behavior;
pub mod matcher;
pub mod roles;
pub mod session;
pub mod site;

use anyhow::Result;
use async_trait::async_trait;

use crate::cli::config::Credentials;
use crate::crawler::listing::ListingRecord;

// Re-export common types
pub use session::WebDriverLauncher;

/// Remote browsing session driven by the job. One instance lives for one
/// cycle.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ListingBrowser: Send {
    /// Drop cookies and any other state tied to the current login
    async fn clear_session(&mut self) -> Result<()>;

    /// Log in with the given account
    async fn login(&mut self, credentials: &Credentials) -> Result<()>;

    /// Scrape the search results page, in page order
    async fn fetch_listings(&mut self, search_url: &str) -> Result<Vec<ListingRecord>>;

    /// Apply to one listing. Any failure is reported as `false`.
    async fn submit_application(&mut self, url: &str, message: &str) -> bool;

    /// End the remote session
    async fn close(&mut self);
}

/// Opens a fresh browser session
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn ListingBrowser>>;
}
