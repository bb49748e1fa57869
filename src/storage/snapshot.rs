use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::crawler::listing::ListingRecord;
use crate::storage::atomic::{self, PersistError};

pub const SNAPSHOT_PREFIX: &str = "properties_data_";
const SNAPSHOT_EXT: &str = ".json";
const SLOT_PREFIX: &str = "house";

/// A snapshot file on disk, ordered by its capture token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub token: u64,
    pub path: PathBuf,
}

impl SnapshotFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Directory of `properties_data_<token>.json` files
#[derive(Debug, Clone)]
pub struct SnapshotDir {
    dir: PathBuf,
}

impl SnapshotDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn parse_token(file_name: &str) -> Option<u64> {
        file_name
            .strip_prefix(SNAPSHOT_PREFIX)?
            .strip_suffix(SNAPSHOT_EXT)?
            .parse()
            .ok()
    }

    /// The snapshot with the highest capture token, if any.
    pub fn latest(&self) -> Option<SnapshotFile> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("No snapshot directory {}: {}", self.dir.display(), e);
                return None;
            }
        };

        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let token = Self::parse_token(name.to_str()?)?;
                Some(SnapshotFile {
                    token,
                    path: entry.path(),
                })
            })
            .max_by_key(|file| file.token)
    }

    /// Allocate a path for a new snapshot. The token is wall-clock millis,
    /// bumped past the newest existing token so ordering never goes backwards.
    pub fn next(&self) -> SnapshotFile {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let token = match self.latest() {
            Some(latest) if latest.token >= now => latest.token + 1,
            _ => now,
        };

        SnapshotFile {
            token,
            path: self.dir.join(format!("{SNAPSHOT_PREFIX}{token}{SNAPSHOT_EXT}")),
        }
    }

    /// Raw JSON object of the latest snapshot. Unreadable or non-object files
    /// are reported as absent.
    pub fn read_latest_raw(&self) -> Option<(SnapshotFile, Map<String, Value>)> {
        let file = self.latest()?;
        match atomic::read_json::<Value>(&file.path) {
            Ok(Some(Value::Object(map))) => Some((file, map)),
            Ok(Some(_)) => {
                warn!("Snapshot {} is not a JSON object, ignoring", file.path.display());
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Ignoring unreadable snapshot: {}", e);
                None
            }
        }
    }

    /// Write records under positional keys `house1..houseN` in the given order.
    pub fn write<'a>(
        &self,
        file: &SnapshotFile,
        records: impl IntoIterator<Item = &'a ListingRecord>,
    ) -> Result<(), PersistError> {
        let slots: Map<String, Value> = records
            .into_iter()
            .enumerate()
            .map(|(idx, record)| {
                let value = serde_json::to_value(record).unwrap_or(Value::Null);
                (format!("{SLOT_PREFIX}{}", idx + 1), value)
            })
            .collect();

        atomic::write_json(&file.path, &slots)
    }
}

/// Layout of a snapshot file's top-level keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotShape {
    /// `house1`, `house2`, ... (current layout)
    Positional,
    /// Keyed by listing URL (older layout)
    UrlKeyed,
}

impl SnapshotShape {
    pub fn detect(map: &Map<String, Value>) -> Self {
        let url_keys = map
            .keys()
            .filter(|key| key.starts_with("http://") || key.starts_with("https://"))
            .count();
        if url_keys > 0 && url_keys * 2 >= map.len() {
            SnapshotShape::UrlKeyed
        } else {
            SnapshotShape::Positional
        }
    }
}

/// Normalize either snapshot layout into the canonical url-keyed map of
/// attempted applications. Entries that were never attempted or that have no
/// URL are dropped.
pub fn migrate(map: Map<String, Value>) -> BTreeMap<String, ListingRecord> {
    let shape = SnapshotShape::detect(&map);
    debug!("Migrating snapshot with {:?} layout ({} entries)", shape, map.len());

    let mut processed = BTreeMap::new();
    for (key, value) in map {
        let mut record: ListingRecord = match serde_json::from_value(value) {
            Ok(record) => record,
            Err(e) => {
                warn!("Skipping malformed snapshot entry {}: {}", key, e);
                continue;
            }
        };

        if shape == SnapshotShape::UrlKeyed && record.identity().is_none() {
            record.url = Some(key.clone());
        }

        if !record.is_processed() {
            continue;
        }
        let Some(url) = record.identity().map(str::to_owned) else {
            debug!("Dropping processed entry {} without a url", key);
            continue;
        };
        processed.insert(url, record);
    }
    processed
}

/// Response body for the processed-houses view
#[derive(Debug, Clone, Serialize)]
pub struct HousesView {
    pub count: usize,
    pub houses: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Response body for the processed-houses list view
#[derive(Debug, Clone, Serialize)]
pub struct StreetsView {
    pub count: usize,
    pub streets: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

const NO_SNAPSHOT: &str = "No properties data files found";

pub fn houses_view(dir: &SnapshotDir) -> HousesView {
    match dir.read_latest_raw() {
        Some((file, houses)) => HousesView {
            count: houses.len(),
            houses,
            source_file: Some(file.file_name()),
            message: None,
        },
        None => HousesView {
            count: 0,
            houses: Map::new(),
            source_file: None,
            message: Some(NO_SNAPSHOT.to_string()),
        },
    }
}

/// One line per snapshot entry, tagged by application outcome.
pub fn street_line(entry: &Value) -> String {
    let name = entry
        .get("name")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .unwrap_or("Unknown address");

    let tag = match entry.get("success").and_then(Value::as_bool) {
        Some(true) => "✅",
        Some(false) => "❌",
        None => "⏳",
    };
    format!("{tag} {name}")
}

pub fn streets_view(dir: &SnapshotDir) -> StreetsView {
    match dir.read_latest_raw() {
        Some((file, houses)) => {
            let streets: Vec<String> = houses.values().map(street_line).collect();
            StreetsView {
                count: streets.len(),
                streets,
                source_file: Some(file.file_name()),
                message: None,
            }
        }
        None => StreetsView {
            count: 0,
            streets: Vec::new(),
            source_file: None,
            message: Some(NO_SNAPSHOT.to_string()),
        },
    }
}
