//! Scripted in-memory site used by the runner and controller tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

use crate::browser::{BrowserLauncher, ListingBrowser};
use crate::cli::config::{AccountSettings, Credentials};
use crate::crawler::listing::ListingRecord;
use crate::crawler::runner::{CycleRunner, RunOptions};
use crate::storage::DedupStore;

pub fn listing(n: u32) -> ListingRecord {
    let mut listing = ListingRecord::new(
        format!("Zoutmanstraat {n}"),
        format!("https://www.huurwoningen.nl/huren/den-haag/{n:04}/zoutmanstraat/"),
    );
    listing.address = Some("2518 Den Haag (Zeeheldenkwartier)".into());
    listing.price = Some("€ 850 per maand".into());
    listing.details = vec!["35 m²".into(), "1 kamer".into()];
    listing
}

pub fn page(numbers: RangeInclusive<u32>) -> Vec<ListingRecord> {
    numbers.map(listing).collect()
}

#[derive(Debug, Default)]
pub struct FakeState {
    /// Result of each successive fetch; empty once exhausted
    pub pages: VecDeque<Vec<ListingRecord>>,
    pub fetch_delay: Duration,
    pub fetch_error: bool,
    /// Listing urls whose submission fails
    pub rejected: HashSet<String>,
    /// Usernames whose login fails
    pub failing_logins: HashSet<String>,
    pub launches: u32,
    pub closes: u32,
    pub logins: Vec<String>,
    pub submissions: Vec<String>,
}

#[derive(Clone, Default)]
pub struct FakeSite {
    state: Arc<Mutex<FakeState>>,
    /// Notified whenever a fetch begins
    pub fetch_started: Arc<Notify>,
    /// When set, every fetch waits for a permit
    gate: Option<Arc<Semaphore>>,
}

impl FakeSite {
    pub fn with_pages(pages: Vec<Vec<ListingRecord>>) -> Self {
        let site = Self::default();
        site.state().pages = pages.into();
        site
    }

    /// Make fetches block until [`FakeSite::release`] is called.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn release(&self, fetches: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(fetches);
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl BrowserLauncher for FakeSite {
    async fn launch(&self) -> Result<Box<dyn ListingBrowser>> {
        self.state().launches += 1;
        Ok(Box::new(FakeBrowser { site: self.clone() }))
    }
}

struct FakeBrowser {
    site: FakeSite,
}

#[async_trait]
impl ListingBrowser for FakeBrowser {
    async fn clear_session(&mut self) -> Result<()> {
        Ok(())
    }

    async fn login(&mut self, credentials: &Credentials) -> Result<()> {
        let mut state = self.site.state();
        state.logins.push(credentials.username.clone());
        if state.failing_logins.contains(&credentials.username) {
            return Err(anyhow!("invalid credentials"));
        }
        Ok(())
    }

    async fn fetch_listings(&mut self, _search_url: &str) -> Result<Vec<ListingRecord>> {
        self.site.fetch_started.notify_one();
        if let Some(gate) = &self.site.gate {
            gate.acquire().await?.forget();
        }
        let delay = self.site.state().fetch_delay;
        tokio::time::sleep(delay).await;

        let mut state = self.site.state();
        if state.fetch_error {
            return Err(anyhow!("search page timed out"));
        }
        Ok(state.pages.pop_front().unwrap_or_default())
    }

    async fn submit_application(&mut self, url: &str, _message: &str) -> bool {
        let mut state = self.site.state();
        state.submissions.push(url.to_string());
        !state.rejected.contains(url)
    }

    async fn close(&mut self) {
        self.site.state().closes += 1;
    }
}

pub fn accounts() -> AccountSettings {
    AccountSettings {
        browse: Credentials::new("browse@example.nl", "browse-pass"),
        apply: Credentials::new("apply@example.nl", "apply-pass"),
    }
}

pub fn runner(site: &FakeSite, dir: &Path, dry_run: bool) -> CycleRunner {
    CycleRunner::new(
        Arc::new(site.clone()),
        DedupStore::new(dir.join("seen_urls.json"), dir),
        accounts(),
        RunOptions {
            search_url: "https://www.huurwoningen.nl/in/den-haag/".into(),
            message_template: "Beste verhuurder, ik heb interesse in {street_name}.".into(),
            dry_run,
            cycle_pause: Duration::ZERO,
            candidate_delay: (0, 0),
        },
    )
}
