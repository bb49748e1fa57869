use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

use crate::storage::timefmt;

/// One rental listing as scraped, optionally enriched with the outcome of an
/// application attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    /// Listing title, usually the street name
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,

    /// Canonical listing URL, the identity used for deduplication
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub address: Option<String>,

    #[serde(default)]
    pub price: Option<String>,

    /// Feature bullets (area, rooms, furnishing)
    #[serde(default, deserialize_with = "null_as_default")]
    pub details: Vec<String>,

    /// When the application was attempted; absent for scraped-only entries
    #[serde(default, with = "timefmt::option", skip_serializing_if = "Option::is_none")]
    pub processed_date: Option<NaiveDateTime>,

    /// Outcome of the application attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

impl ListingRecord {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: Some(url.into()),
            address: None,
            price: None,
            details: Vec::new(),
            processed_date: None,
            success: None,
        }
    }

    /// The URL this listing is identified by, if it has a usable one.
    ///
    /// Listings without a URL have no identity: the name is not unique
    /// enough (re-listed units share street names), so they are never
    /// deduplicated or recorded.
    pub fn identity(&self) -> Option<&str> {
        self.url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    pub fn is_processed(&self) -> bool {
        self.processed_date.is_some()
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Resolve a scraped href against the site's base URL and normalize it so
/// that the same listing always maps to the same string.
pub fn canonical_url(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }

    let mut url = base.join(href).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    // Url already lowercases the host and strips default ports on parse
    url.set_fragment(None);
    if url.query() == Some("") {
        url.set_query(None);
    }

    Some(url.to_string())
}

/// Fill the `{street_name}` placeholder of an application message.
pub fn render_message(template: &str, listing: &ListingRecord) -> String {
    template.replace("{street_name}", &listing.name)
}
