//! Ordered candidate matching for page elements.
//!
//! Markup on the target site varies between listings and over time, so each
//! element is described by several alternative locators tried in priority
//! order. Every attempt gets a bounded wait; a resolution therefore takes at
//! most `candidates × wait` and ends in [`Resolution::NotFound`] instead of
//! blocking or erroring.

use std::future::Future;
use std::time::Duration;
use thirtyfour::prelude::*;
use tracing::{debug, trace};

/// Poll interval used while waiting on a single locator
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One way of finding an element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    XPath(String),
    Name(String),
}

impl Locator {
    pub fn xpath(expr: impl Into<String>) -> Self {
        Locator::XPath(expr.into())
    }

    pub fn xpaths(exprs: &[&str]) -> Vec<Self> {
        exprs.iter().map(|expr| Locator::xpath(*expr)).collect()
    }

    pub fn name(name: impl Into<String>) -> Self {
        Locator::Name(name.into())
    }

    pub fn to_by(&self) -> By {
        match self {
            Locator::XPath(expr) => By::XPath(expr.as_str()),
            Locator::Name(name) => By::Name(name.as_str()),
        }
    }
}

/// What "resolved" means for an element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Present in the DOM
    Present,
    /// Displayed and enabled
    Clickable,
}

/// Outcome of a resolution attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<T> {
    Found { element: T, index: usize },
    NotFound,
}

impl<T> Resolution<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Resolution::Found { element, .. } => Some(element),
            Resolution::NotFound => None,
        }
    }
}

/// Alternative locators for one element, tried in order
#[derive(Debug, Clone)]
pub struct CandidateMatcher {
    candidates: Vec<Locator>,
    wait: Duration,
    readiness: Readiness,
}

impl CandidateMatcher {
    /// Matcher requiring the element to be clickable.
    pub fn clickable(candidates: Vec<Locator>, wait: Duration) -> Self {
        Self {
            candidates,
            wait,
            readiness: Readiness::Clickable,
        }
    }

    /// Matcher that is satisfied by presence alone.
    pub fn present(candidates: Vec<Locator>, wait: Duration) -> Self {
        Self {
            candidates,
            wait,
            readiness: Readiness::Present,
        }
    }

    pub fn worst_case(&self) -> Duration {
        self.wait * self.candidates.len() as u32
    }

    /// Try each candidate with `probe`, stopping at the first hit. A probe
    /// that outlives the per-candidate wait counts as a miss.
    pub async fn resolve_with<T, F, Fut>(&self, mut probe: F) -> Resolution<T>
    where
        F: FnMut(&Locator, Readiness, Duration) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        for (index, locator) in self.candidates.iter().enumerate() {
            match tokio::time::timeout(self.wait, probe(locator, self.readiness, self.wait)).await {
                Ok(Some(element)) => {
                    debug!("Resolved {:?} with candidate {}", locator, index);
                    return Resolution::Found { element, index };
                }
                Ok(None) => trace!("Candidate {:?} not found", locator),
                Err(_) => trace!("Candidate {:?} timed out", locator),
            }
        }
        debug!("No candidate matched within {:?}", self.worst_case());
        Resolution::NotFound
    }

    /// Resolve against a live WebDriver session.
    pub async fn resolve(&self, driver: &WebDriver) -> Resolution<WebElement> {
        self.resolve_with(|locator, readiness, wait| {
            let query = driver.query(locator.to_by()).wait(wait, POLL_INTERVAL);
            let query = match readiness {
                Readiness::Present => query,
                Readiness::Clickable => query.and_clickable(),
            };
            async move { query.first_opt().await.ok().flatten() }
        })
        .await
    }
}
