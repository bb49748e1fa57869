use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::crawler::listing::ListingRecord;
use crate::storage::atomic::{self, PersistError};
use crate::storage::snapshot::{self, SnapshotDir};
use crate::storage::timefmt;

/// Listing URLs observed in any previous cycle
pub type SeenUrls = BTreeSet<String>;

/// Attempted applications keyed by listing URL
pub type ProcessedMap = BTreeMap<String, ListingRecord>;

/// Tracks which listings have been seen and which have been applied to
#[derive(Debug, Clone)]
pub struct DedupStore {
    seen_path: PathBuf,
    snapshots: SnapshotDir,
}

impl DedupStore {
    pub fn new(seen_path: impl Into<PathBuf>, snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            seen_path: seen_path.into(),
            snapshots: SnapshotDir::new(snapshot_dir),
        }
    }

    #[cfg(test)]
    pub fn snapshots(&self) -> &SnapshotDir {
        &self.snapshots
    }

    #[cfg(test)]
    pub fn seen_path(&self) -> &std::path::Path {
        &self.seen_path
    }

    /// Load the seen set. A missing or unreadable file is an empty set.
    pub fn load_seen(&self) -> SeenUrls {
        match atomic::read_json::<Vec<String>>(&self.seen_path) {
            Ok(Some(urls)) => urls.into_iter().collect(),
            Ok(None) => SeenUrls::new(),
            Err(e) => {
                warn!("Starting with an empty seen list: {}", e);
                SeenUrls::new()
            }
        }
    }

    /// Load attempted applications from the most recent snapshot.
    pub fn load_processed(&self) -> ProcessedMap {
        match self.snapshots.read_latest_raw() {
            Some((file, raw)) => {
                let processed = snapshot::migrate(raw);
                debug!(
                    "Loaded {} processed listings from {}",
                    processed.len(),
                    file.path.display()
                );
                processed
            }
            None => ProcessedMap::new(),
        }
    }

    /// Candidates worth applying to: resolvable identity, not seen, not
    /// processed. Scrape order is preserved.
    pub fn filter(
        scraped: &[ListingRecord],
        processed: &ProcessedMap,
        seen: &SeenUrls,
    ) -> Vec<ListingRecord> {
        scraped
            .iter()
            .filter(|listing| match listing.identity() {
                Some(url) => !seen.contains(url) && !processed.contains_key(url),
                None => {
                    debug!("Skipping listing without url: {}", listing.name);
                    false
                }
            })
            .cloned()
            .collect()
    }

    /// Record an application attempt, replacing any earlier attempt for the
    /// same URL.
    pub fn mark_processed(processed: &mut ProcessedMap, listing: &ListingRecord, success: bool) {
        let Some(url) = listing.identity().map(str::to_owned) else {
            warn!("Not recording listing without url: {}", listing.name);
            return;
        };

        let mut record = listing.clone();
        record.url = Some(url.clone());
        record.processed_date = Some(timefmt::now());
        record.success = Some(success);
        processed.insert(url, record);
    }

    /// Processed records oldest first, the order used for positional keys.
    pub fn ordered(processed: &ProcessedMap) -> Vec<&ListingRecord> {
        let mut records: Vec<&ListingRecord> = processed.values().collect();
        records.sort_by(|a, b| {
            a.processed_date
                .cmp(&b.processed_date)
                .then_with(|| a.url.cmp(&b.url))
        });
        records
    }

    /// Snapshot written right after a scrape: processed history first, then
    /// the fresh listings as pending entries.
    pub fn save_scrape(
        &self,
        scraped: &[ListingRecord],
        processed: &ProcessedMap,
    ) -> Result<(), PersistError> {
        let pending = scraped.iter().filter(|listing| match listing.identity() {
            Some(url) => !processed.contains_key(url),
            None => true,
        });
        let records: Vec<&ListingRecord> = Self::ordered(processed).into_iter().chain(pending).collect();

        let file = self.snapshots.next();
        self.snapshots.write(&file, records)?;
        debug!("Saved scraped data to {}", file.path.display());
        Ok(())
    }

    /// Persist the seen set (sorted) and a new snapshot of processed records.
    pub fn save_all(&self, seen: &SeenUrls, processed: &ProcessedMap) -> Result<(), PersistError> {
        let sorted: Vec<&String> = seen.iter().collect();
        atomic::write_json(&self.seen_path, &sorted)?;

        let file = self.snapshots.next();
        self.snapshots.write(&file, Self::ordered(processed))?;

        info!(
            "Saved {} seen urls and {} processed listings to {}",
            seen.len(),
            processed.len(),
            file.file_name()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn listing(n: u32) -> ListingRecord {
        let mut listing = ListingRecord::new(
            format!("Straat {n}"),
            format!("https://www.huurwoningen.nl/huren/den-haag/{n}/"),
        );
        listing.price = Some(format!("€ {} per maand", 700 + n));
        listing.details = vec!["40 m²".into(), "2 kamers".into()];
        listing
    }

    fn store(temp: &TempDir) -> DedupStore {
        DedupStore::new(temp.path().join("seen_urls.json"), temp.path())
    }

    #[test]
    fn filter_excludes_seen_and_processed() {
        let scraped: Vec<ListingRecord> = (1..=5).map(listing).collect();
        let seen: SeenUrls = [scraped[1].url.clone().unwrap()].into();
        let mut processed = ProcessedMap::new();
        DedupStore::mark_processed(&mut processed, &scraped[3], true);

        let candidates = DedupStore::filter(&scraped, &processed, &seen);
        let names: Vec<&str> = candidates.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["Straat 1", "Straat 3", "Straat 5"]);
    }

    #[test]
    fn filter_drops_listings_without_identity() {
        let mut nameless = listing(1);
        nameless.url = None;
        let blank = ListingRecord::new("Straat 2", "");

        let candidates = DedupStore::filter(&[nameless, blank, listing(3)], &ProcessedMap::new(), &SeenUrls::new());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "Straat 3");
    }

    #[test]
    fn mark_processed_overwrites_previous_attempt() {
        let mut processed = ProcessedMap::new();
        DedupStore::mark_processed(&mut processed, &listing(1), false);
        DedupStore::mark_processed(&mut processed, &listing(1), true);

        assert_eq!(processed.len(), 1);
        let record = processed.values().next().unwrap();
        assert_eq!(record.success, Some(true));
        assert!(record.processed_date.is_some());
    }

    #[test]
    fn missing_files_load_empty() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        assert!(store.load_seen().is_empty());
        assert!(store.load_processed().is_empty());
    }

    #[test]
    fn corrupt_files_load_empty() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("seen_urls.json"), "[\"https://x.nl/a\",").unwrap();
        fs::write(temp.path().join("properties_data_10.json"), "{\"house1\":").unwrap();
        let store = store(&temp);

        assert!(store.load_seen().is_empty());
        assert!(store.load_processed().is_empty());
    }

    #[test]
    fn save_all_round_trips() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        let seen: SeenUrls = (1..=4).filter_map(|n| listing(n).url).collect();
        let mut processed = ProcessedMap::new();
        DedupStore::mark_processed(&mut processed, &listing(1), true);
        DedupStore::mark_processed(&mut processed, &listing(2), false);

        store.save_all(&seen, &processed).unwrap();

        assert_eq!(store.load_seen(), seen);
        let loaded = store.load_processed();
        assert_eq!(loaded.len(), 2);
        for (url, record) in &processed {
            assert_eq!(loaded[url].success, record.success);
            assert_eq!(loaded[url].processed_date, record.processed_date);
            assert_eq!(loaded[url].details, record.details);
        }
    }

    #[test]
    fn seen_file_is_sorted() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let seen: SeenUrls = ["https://x.nl/c", "https://x.nl/a", "https://x.nl/b"]
            .into_iter()
            .map(String::from)
            .collect();

        store.save_all(&seen, &ProcessedMap::new()).unwrap();

        let raw: Vec<String> =
            serde_json::from_str(&fs::read_to_string(store.seen_path()).unwrap()).unwrap();
        assert_eq!(raw, vec!["https://x.nl/a", "https://x.nl/b", "https://x.nl/c"]);
    }

    #[test]
    fn snapshot_keys_follow_processed_date() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        let mut processed = ProcessedMap::new();
        let mut late = listing(1);
        late.processed_date = timefmt::parse("2024-02-01 09:00:00");
        late.success = Some(true);
        let mut early = listing(2);
        early.processed_date = timefmt::parse("2024-01-01 09:00:00");
        early.success = Some(false);
        processed.insert(late.url.clone().unwrap(), late);
        processed.insert(early.url.clone().unwrap(), early);

        store.save_all(&SeenUrls::new(), &processed).unwrap();

        let (_, raw) = store.snapshots().read_latest_raw().unwrap();
        assert_eq!(raw["house1"]["name"], "Straat 2");
        assert_eq!(raw["house2"]["name"], "Straat 1");
    }

    #[test]
    fn scrape_snapshot_keeps_history_loadable() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        let mut processed = ProcessedMap::new();
        DedupStore::mark_processed(&mut processed, &listing(1), true);
        store.save_all(&SeenUrls::new(), &processed).unwrap();

        // A crash right after the scrape snapshot must not lose history
        store.save_scrape(&[listing(1), listing(2), listing(3)], &processed).unwrap();

        let loaded = store.load_processed();
        assert_eq!(loaded.keys().collect::<Vec<_>>(), processed.keys().collect::<Vec<_>>());

        let (_, raw) = store.snapshots().read_latest_raw().unwrap();
        assert_eq!(raw.len(), 3);
    }
}
