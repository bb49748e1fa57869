//! Page flows for the listing site: login, search scraping and the contact
//! form used to apply.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use thirtyfour::prelude::*;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::behavior::BehaviorSimulator;
use crate::browser::matcher::{CandidateMatcher, Locator, Resolution};
use crate::browser::session::BrowserSession;
use crate::browser::ListingBrowser;
use crate::cli::config::{Credentials, SiteSettings};
use crate::crawler::listing::{canonical_url, ListingRecord};

const LISTING_CONTAINER: &str = "//div[contains(@class, 'listing-search-item')]";
const LISTING_TITLE: &str = ".//a[contains(@class, 'listing-search-item__link--title')]";
const LISTING_SUBTITLE: &str = ".//div[contains(@class, 'listing-search-item__sub-title')]";
const LISTING_PRICE: &str = ".//div[contains(@class, 'listing-search-item__price')]";
const LISTING_FEATURES: &str = ".//ul[contains(@class, 'illustrated-features')]//li";

const LOGIN_SUBMIT: &[&str] = &["//button[contains(., 'Inloggen')]"];

const COOKIE_BUTTONS: &[&str] = &[
    "//button[contains(text(), 'Accept')]",
    "//button[contains(text(), 'Accepteren')]",
    "//button[contains(text(), 'Alle cookies accepteren')]",
    "//button[contains(text(), 'Akkoord')]",
    "//button[@id='onetrust-accept-btn-handler']",
    "//button[contains(@class, 'accept')]",
    "//button[contains(@class, 'cookie')]",
];

const CONTACT_BUTTONS: &[&str] = &[
    "//a[contains(text(), 'Reageer op deze woning')]",
    "//a[contains(@class, 'listing-contact-info__button--contact-request')]",
    "//a[contains(@href, '/reageer/')]",
    "//button[contains(text(), 'Reageer op deze woning')]",
    "//button[contains(text(), 'Bekijk opnieuw')]",
    "//button[contains(@class, 'listing-contact-info__button--viewed')]",
    "//a[contains(@class, 'listing-contact-info__button--viewed') and contains(text(), 'Bekijk je reactie')]",
];

const CONTINUE_BUTTONS: &[&str] = &[
    "//button[contains(text(), 'Ga verder')]",
    "//button[contains(@class, 'dialog__external-button')]",
    "//button[@type='submit'][contains(text(), 'Ga verder')]",
];

const FORM_COOKIE_BUTTONS: &[&str] = &[
    "//button[contains(text(), 'Alle cookies toestaan')]",
    "//button[contains(@class, 'ch2-allow-all-btn')]",
    "//button[contains(@class, 'ch2-btn-primary')]",
];

const MOTIVATION_FIELDS: &[&str] = &[
    "//textarea[@name='contact_form[motivation]']",
    "//textarea[contains(@class, 'text-control__control')]",
    "//textarea[contains(@id, 'text-control')]",
];

const SUBMIT_BUTTONS: &[&str] = &[
    "//button[contains(text(), 'Verstuur')]",
    "//button[contains(text(), 'Verzenden')]",
    "//button[contains(text(), 'Reageer')]",
    "//button[@type='submit']",
    "//form//button[@type='submit']",
];

const COOKIE_WAIT: Duration = Duration::from_secs(1);
const FORM_COOKIE_WAIT: Duration = Duration::from_secs(2);
const RESULTS_WAIT: Duration = Duration::from_secs(5);
const REDIRECT_POLL: Duration = Duration::from_millis(250);

/// What the contact button on a listing page says about earlier contact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactState {
    /// "Bekijk je reactie": an application was already sent
    AlreadyApplied,
    /// "Bekijk opnieuw": a confirmation dialog follows the click
    Reopen,
    Fresh,
}

impl ContactState {
    pub fn from_label(label: &str) -> Self {
        let label = label.trim().to_lowercase();
        if label.contains("bekijk je reactie") {
            ContactState::AlreadyApplied
        } else if label.contains("bekijk opnieuw") {
            ContactState::Reopen
        } else {
            ContactState::Fresh
        }
    }
}

/// Listing browser backed by a live WebDriver session
pub struct SiteBrowser {
    session: BrowserSession,
    site: SiteSettings,
    base_url: Url,
    behavior: BehaviorSimulator,
    match_wait: Duration,
    dry_run: bool,
}

impl SiteBrowser {
    pub fn new(session: BrowserSession, site: SiteSettings, dry_run: bool) -> Result<Self> {
        let base_url = Url::parse(&site.base_url)
            .with_context(|| format!("Invalid base url: {}", site.base_url))?;
        let settings = session.settings();
        let behavior = BehaviorSimulator::new(settings.behavior.clone());
        let match_wait = Duration::from_millis(settings.match_wait_ms);

        Ok(Self {
            session,
            site,
            base_url,
            behavior,
            match_wait,
            dry_run,
        })
    }

    fn clickable(&self, exprs: &[&str]) -> CandidateMatcher {
        CandidateMatcher::clickable(Locator::xpaths(exprs), self.match_wait)
    }

    async fn resolve(&self, matcher: &CandidateMatcher) -> Result<Resolution<WebElement>> {
        Ok(matcher.resolve(self.session.driver()?).await)
    }

    async fn dismiss_cookies(&self, exprs: &[&str], wait: Duration) -> Result<()> {
        let matcher = CandidateMatcher::clickable(Locator::xpaths(exprs), wait);
        if let Some(button) = self.resolve(&matcher).await?.found() {
            if let Err(e) = button.click().await {
                debug!("Cookie banner click failed: {}", e);
            }
        }
        Ok(())
    }

    async fn wait_for_redirect(&self, from: &str) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(self.session.settings().page_load_timeout_secs);
        loop {
            if self.session.current_url().await? != from {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("still on the login page after submitting");
            }
            sleep(REDIRECT_POLL).await;
        }
    }

    async fn read_listing(&self, container: &WebElement) -> Option<ListingRecord> {
        let link = container.find(By::XPath(LISTING_TITLE)).await.ok()?;
        let name = link.text().await.ok()?.trim().to_string();
        let href = link.attr("href").await.ok()??;
        let Some(url) = canonical_url(&self.base_url, &href) else {
            debug!("Skipping listing with unusable link: {}", href);
            return None;
        };

        let mut listing = ListingRecord::new(name, url);
        listing.address = child_text(container, LISTING_SUBTITLE).await;
        listing.price = child_text(container, LISTING_PRICE).await;
        if let Ok(features) = container.find_all(By::XPath(LISTING_FEATURES)).await {
            for feature in features {
                if let Ok(text) = feature.text().await {
                    let text = text.trim();
                    if !text.is_empty() {
                        listing.details.push(text.to_string());
                    }
                }
            }
        }
        Some(listing)
    }

    async fn apply(&self, url: &str, message: &str) -> Result<bool> {
        self.session.navigate(url).await?;
        self.behavior.settle().await;

        let Some(contact) = self.resolve(&self.clickable(CONTACT_BUTTONS)).await?.found() else {
            info!("No contact button found on {}", url);
            return Ok(false);
        };

        let label = contact.text().await.unwrap_or_default();
        let state = ContactState::from_label(&label);
        if state == ContactState::AlreadyApplied {
            info!("Already applied to {}", url);
            return Ok(true);
        }

        self.behavior.click(&contact).await?;
        self.behavior.settle().await;

        if state == ContactState::Reopen {
            if let Some(button) = self.resolve(&self.clickable(CONTINUE_BUTTONS)).await?.found() {
                self.behavior.click(&button).await?;
                self.behavior.settle().await;
            }
        }

        self.dismiss_cookies(FORM_COOKIE_BUTTONS, FORM_COOKIE_WAIT).await?;

        let fields = CandidateMatcher::present(Locator::xpaths(MOTIVATION_FIELDS), self.match_wait);
        let Some(textarea) = self.resolve(&fields).await?.found() else {
            info!("No motivation field found on {}", url);
            return Ok(false);
        };
        textarea.clear().await?;
        textarea.send_keys(message).await?;

        let Some(submit) = self.resolve(&self.clickable(SUBMIT_BUTTONS)).await?.found() else {
            info!("No submit button found on {}", url);
            return Ok(false);
        };

        if self.dry_run {
            info!("[dry-run] Filled motivation for {}, not submitting", url);
            return Ok(false);
        }

        self.behavior.click(&submit).await?;
        self.behavior.settle().await;
        Ok(true)
    }
}

async fn child_text(container: &WebElement, xpath: &str) -> Option<String> {
    let element = container.find(By::XPath(xpath)).await.ok()?;
    let text = element.text().await.ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

#[async_trait]
impl ListingBrowser for SiteBrowser {
    async fn clear_session(&mut self) -> Result<()> {
        self.session.delete_cookies().await
    }

    async fn login(&mut self, credentials: &Credentials) -> Result<()> {
        let login_url = self.site.login_url.clone();
        self.session.navigate(&login_url).await?;

        let email = CandidateMatcher::present(vec![Locator::name("email")], self.match_wait);
        let email = self.resolve(&email).await?.found().context("email field not found")?;
        self.behavior.type_text(&email, &credentials.username).await?;

        self.dismiss_cookies(COOKIE_BUTTONS, COOKIE_WAIT).await?;

        let password = CandidateMatcher::present(vec![Locator::name("password")], self.match_wait);
        let password = self.resolve(&password).await?.found().context("password field not found")?;
        self.behavior.type_text(&password, &credentials.password).await?;

        let submit = self
            .resolve(&self.clickable(LOGIN_SUBMIT))
            .await?
            .found()
            .context("login button not found")?;
        self.behavior.click(&submit).await?;

        let current = self.session.current_url().await?;
        self.wait_for_redirect(&current).await?;
        debug!("Logged in as {}", credentials.username);
        Ok(())
    }

    async fn fetch_listings(&mut self, search_url: &str) -> Result<Vec<ListingRecord>> {
        self.session.navigate(search_url).await?;

        let driver = self.session.driver()?;
        let first = driver
            .query(By::XPath(LISTING_CONTAINER))
            .wait(RESULTS_WAIT, REDIRECT_POLL)
            .first_opt()
            .await?;
        if first.is_none() {
            info!("No listings found on page");
            return Ok(Vec::new());
        }

        let containers = driver
            .find_all(By::XPath(LISTING_CONTAINER))
            .await
            .context("Failed to find listing containers")?;

        let mut listings = Vec::with_capacity(containers.len());
        for container in &containers {
            if let Some(listing) = self.read_listing(container).await {
                listings.push(listing);
            }
        }

        info!("Scraped {} listings from {} containers", listings.len(), containers.len());
        Ok(listings)
    }

    async fn submit_application(&mut self, url: &str, message: &str) -> bool {
        match self.apply(url, message).await {
            Ok(submitted) => submitted,
            Err(e) => {
                warn!("Application to {} failed: {:#}", url, e);
                false
            }
        }
    }

    async fn close(&mut self) {
        self.session.close().await;
    }
}
