//! Persisted track log and the archive protocol.
//!
//! Live logs are lists keyed `category:hostname:YYYYMMDD`, newest entry first.
//! Archiving copies a list into `<category>_<hostname>_<YYYYMMDD>.json` once and
//! only then removes the live list.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::DateTime;
use log::{info, warn};
use serde::Serialize;
use serde_json::Value;

use crate::error::ArchiveError;
use crate::geo;
use crate::store::{glob_match, LogStore};
use crate::types::TrackPoint;

pub const TRACKING_CATEGORY: &str = "tracking";
/// Gap that starts a new track segment [s]
pub const DEFAULT_SEGMENT_GAP: f64 = 600.0;

const STRIPPED_FIELDS: &[&str] = &[
    "map_height",
    "map_type",
    "mode",
    "utm",
    "ref_pressure",
    "time",
    "pos_error",
    "tag",
    "device",
    "class",
    "mgrs",
    "p_utc",
    "i_utc",
    "leapseconds",
    "eph",
    "sep",
];
const STRIPPED_PREFIXES: &[&str] = &["ep", "raw_", "ecef", "vel", "imu_baro_"];
const STRIPPED_SUFFIXES: &[&str] = &["_sensor", "_hostname"];

/// Transient or noisy fields that are broadcast but never stored.
pub fn is_transient_field(key: &str) -> bool {
    STRIPPED_FIELDS.contains(&key)
        || STRIPPED_PREFIXES.iter().any(|p| key.starts_with(p))
        || STRIPPED_SUFFIXES.iter().any(|s| key.ends_with(s))
}

pub fn persisted_projection(point: &TrackPoint) -> TrackPoint {
    point.without(is_transient_field)
}

/// Archive file contents for entries in chronological order.
pub fn snapshot_text(chronological: &[String]) -> String {
    format!("[{}]\n", chronological.join(",\n"))
}

/// `category_hostname_YYYYMMDD`, the external name of one live list.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatasetId {
    category: String,
    hostname: String,
    date: String,
}

impl DatasetId {
    pub fn new(category: &str, hostname: &str, date: &str) -> Result<Self, ArchiveError> {
        let valid = !category.is_empty()
            && category.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
            && !hostname.is_empty()
            && !hostname.contains([':', '/', '\\'])
            && date.len() == 8
            && date.bytes().all(|b| b.is_ascii_digit());
        if !valid {
            return Err(ArchiveError::InvalidId(format!("{category}_{hostname}_{date}")));
        }
        Ok(Self {
            category: category.to_string(),
            hostname: hostname.to_string(),
            date: date.to_string(),
        })
    }

    /// Tracking dataset for the UTC day of `utc` [unix seconds].
    pub fn for_track(hostname: &str, utc: f64) -> Result<Self, ArchiveError> {
        let day = DateTime::from_timestamp(utc.floor() as i64, 0)
            .filter(|_| utc.is_finite())
            .ok_or(ArchiveError::MissingField("utc"))?;
        Self::new(TRACKING_CATEGORY, hostname, &day.format("%Y%m%d").to_string())
    }

    pub fn from_key(key: &str) -> Result<Self, ArchiveError> {
        Self::split(key, ':')
    }

    fn split(text: &str, separator: char) -> Result<Self, ArchiveError> {
        let invalid = || ArchiveError::InvalidId(text.to_string());
        let (category, rest) = text.split_once(separator).ok_or_else(invalid)?;
        let (hostname, date) = rest.rsplit_once(separator).ok_or_else(invalid)?;
        Self::new(category, hostname, date)
    }

    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.category, self.hostname, self.date)
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// `YYYYMMDD`
    pub fn date(&self) -> &str {
        &self.date
    }
}

impl FromStr for DatasetId {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::split(s, '_')
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.category, self.hostname, self.date)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ArchiveOutcome {
    pub dataset: String,
    pub path: PathBuf,
    /// Entries in the archive file
    pub entries: usize,
    /// Whether this call removed the live list
    pub deleted: bool,
}

fn check_filter(category: &str, date: &str) -> Result<(), ArchiveError> {
    let category_ok = category.bytes().all(|b| b == b'*' || b.is_ascii_lowercase() || b.is_ascii_digit());
    let date_ok = date.len() <= 8 && date.bytes().all(|b| b == b'*' || b.is_ascii_digit());
    if category_ok && date_ok {
        Ok(())
    } else {
        Err(ArchiveError::InvalidFilter(format!("category={category} date={date}")))
    }
}

/// Appends accepted points to the live log and moves finished days to archive files.
pub struct Archiver<S> {
    store: S,
    directory: PathBuf,
}

impl<S: LogStore> Archiver<S> {
    pub fn new(store: S, directory: impl Into<PathBuf>) -> Self {
        Self {
            store,
            directory: directory.into(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn archive_path(&self, id: &DatasetId) -> PathBuf {
        self.directory.join(format!("{id}.json"))
    }

    /// Push the stored projection of `point` to the head of its day's list.
    pub fn append(&self, point: &TrackPoint) -> Result<DatasetId, ArchiveError> {
        let hostname = point.hostname().ok_or(ArchiveError::MissingField("hostname"))?;
        let utc = point.get_f64("utc").ok_or(ArchiveError::MissingField("utc"))?;
        let id = DatasetId::for_track(hostname, utc)?;
        self.store.push_front(&id.key(), &persisted_projection(point).to_json())?;
        Ok(id)
    }

    /// Copy the live list to its archive file, then delete the live list.
    ///
    /// The live list is deleted only when the file on disk is byte-identical
    /// to the snapshot and the list has not changed since it was read;
    /// otherwise [`ArchiveError::Conflict`] is returned and the list is kept.
    /// Calling it again after a successful run is a no-op.
    pub fn move_to_archive(&self, id: &DatasetId) -> Result<ArchiveOutcome, ArchiveError> {
        let key = id.key();
        let path = self.archive_path(id);
        let newest_first = self.store.range(&key)?;

        if newest_first.is_empty() {
            return match fs::read_to_string(&path) {
                Ok(text) => {
                    let entries = serde_json::from_str::<Vec<Value>>(&text)?.len();
                    info!("{} already archived ({} entries)", id, entries);
                    Ok(ArchiveOutcome {
                        dataset: id.to_string(),
                        path,
                        entries,
                        deleted: false,
                    })
                }
                Err(e) if e.kind() == ErrorKind::NotFound => Err(ArchiveError::UnknownDataset(id.to_string())),
                Err(e) => Err(e.into()),
            };
        }

        let chronological: Vec<String> = newest_first.iter().rev().cloned().collect();
        let snapshot = snapshot_text(&chronological);
        let created = self.write_once(&path, &snapshot)?;

        if fs::read_to_string(&path)? != snapshot {
            warn!("{}: archive file differs from live data", id);
            return Err(ArchiveError::Conflict(id.to_string()));
        }

        if !self.store.delete_if_unchanged(&key, &newest_first)? {
            warn!("{}: live data changed while archiving", id);
            if created {
                // the file no longer covers the live list; drop it so a retry starts clean
                fs::remove_file(&path)?;
            }
            return Err(ArchiveError::Conflict(id.to_string()));
        }

        info!("archived {} ({} entries) to {}", id, chronological.len(), path.display());
        Ok(ArchiveOutcome {
            dataset: id.to_string(),
            path,
            entries: chronological.len(),
            deleted: true,
        })
    }

    /// Returns whether this call created the file.
    fn write_once(&self, path: &Path, contents: &str) -> Result<bool, ArchiveError> {
        fs::create_dir_all(&self.directory)?;
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(contents.as_bytes())?;
                file.sync_all()?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Archive every live dataset whose date is outside `current_month` (`YYYYMM`).
    pub fn archive_stale(
        &self,
        current_month: &str,
    ) -> Result<Vec<(DatasetId, Result<ArchiveOutcome, ArchiveError>)>, ArchiveError> {
        let stale: Vec<DatasetId> = self
            .available_datasets("*", "*")?
            .into_iter()
            .filter(|id| !id.date().starts_with(current_month))
            .collect();
        Ok(stale
            .into_iter()
            .map(|id| {
                let result = self.move_to_archive(&id);
                if let Err(e) = &result {
                    warn!("archiving {} failed: {}", id, e);
                }
                (id, result)
            })
            .collect())
    }

    /// Load an archive file back into an empty live list.
    pub fn restore_from_archive(&self, id: &DatasetId) -> Result<usize, ArchiveError> {
        let key = id.key();
        if !self.store.range(&key)?.is_empty() {
            return Err(ArchiveError::AlreadyLive(id.to_string()));
        }
        let rows = self.read_archive(id)?;
        for row in &rows {
            self.store.push_front(&key, &row.to_string())?;
        }
        info!("restored {} entries of {}", rows.len(), id);
        Ok(rows.len())
    }

    /// Live datasets matching `category` and `date` (`*` wildcards).
    pub fn available_datasets(&self, category: &str, date: &str) -> Result<Vec<DatasetId>, ArchiveError> {
        check_filter(category, date)?;
        let keys = self.store.keys(&format!("{category}:*:{date}"))?;
        Ok(keys.iter().filter_map(|key| DatasetId::from_key(key).ok()).collect())
    }

    /// Archived datasets matching `category` and `date` (`*` wildcards).
    pub fn archived_datasets(&self, category: &str, date: &str) -> Result<Vec<DatasetId>, ArchiveError> {
        check_filter(category, date)?;
        let pattern = format!("{category}_*_{date}");
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut datasets = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if glob_match(&pattern, stem) {
                if let Ok(id) = stem.parse::<DatasetId>() {
                    datasets.push(id);
                }
            }
        }
        datasets.sort();
        Ok(datasets)
    }

    /// Rows of a dataset in chronological order, optionally limited to `[utc_min, utc_max]`.
    pub fn read_dataset(
        &self,
        id: &DatasetId,
        utc_min: Option<f64>,
        utc_max: Option<f64>,
        from_archive: bool,
    ) -> Result<Vec<Value>, ArchiveError> {
        let rows = if from_archive {
            self.read_archive(id)?
        } else {
            self.store
                .range(&id.key())?
                .iter()
                .rev()
                .map(|entry| serde_json::from_str(entry))
                .collect::<Result<Vec<Value>, _>>()?
        };
        if utc_min.is_none() && utc_max.is_none() {
            return Ok(rows);
        }
        Ok(rows
            .into_iter()
            .filter(|row| match row.get("utc").and_then(Value::as_f64) {
                Some(utc) => utc_min.map_or(true, |min| utc >= min) && utc_max.map_or(true, |max| utc <= max),
                None => false,
            })
            .collect())
    }

    fn read_archive(&self, id: &DatasetId) -> Result<Vec<Value>, ArchiveError> {
        match fs::read_to_string(self.archive_path(id)) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ArchiveError::UnknownDataset(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

/// Split chronological rows wherever consecutive `utc` values are more than `gap` apart.
pub fn split_track_segments(rows: &[Value], gap: f64) -> Vec<&[Value]> {
    let utc = |row: &Value| row.get("utc").and_then(Value::as_f64);
    let mut segments = Vec::new();
    let mut start = 0;
    for i in 1..rows.len() {
        if let (Some(before), Some(now)) = (utc(&rows[i - 1]), utc(&rows[i])) {
            if now - before > gap {
                segments.push(&rows[start..i]);
                start = i;
            }
        }
    }
    if start < rows.len() {
        segments.push(&rows[start..]);
    }
    segments
}

/// Length of a track [m]: distances between consecutive positions, summed within
/// each segment. Rows without a position and indeterminate distances are skipped.
pub fn track_length(rows: &[Value], gap: f64) -> f64 {
    let position = |row: &Value| Some((row.get("lat")?.as_f64()?, row.get("lon")?.as_f64()?));
    split_track_segments(rows, gap)
        .into_iter()
        .map(|segment| {
            let positions: Vec<(f64, f64)> = segment.iter().filter_map(position).collect();
            positions
                .windows(2)
                .map(|pair| geo::distance(pair[0], pair[1]))
                .filter(|d| !d.is_nan())
                .sum::<f64>()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn point(utc: f64) -> TrackPoint {
        let value = json!({
            "utc": utc,
            "lat": 52.0,
            "lon": 13.0,
            "hostname": "pi",
            "mode": 3,
            "epx": 2.5,
            "raw_acceleration": [0.0, 0.0, 9.8],
            "p_sensor": "bme280",
            "velN": 0.1,
            "my_status": 3,
        });
        match value {
            Value::Object(map) => TrackPoint::from_fields(map),
            _ => unreachable!(),
        }
    }

    fn dataset() -> DatasetId {
        // 1704067200 = 2024-01-01T00:00:00Z
        DatasetId::for_track("pi", 1_704_067_200.0).unwrap()
    }

    #[test]
    fn test_dataset_id_round_trip() {
        let id: DatasetId = "tracking_rpi-zero_20240101".parse().unwrap();
        assert_eq!(id.key(), "tracking:rpi-zero:20240101");
        assert_eq!(DatasetId::from_key(&id.key()).unwrap(), id);
        assert_eq!(id.to_string(), "tracking_rpi-zero_20240101");
        assert!("tracking_pi_2024".parse::<DatasetId>().is_err());
        assert!("Tracking_pi_20240101".parse::<DatasetId>().is_err());
        assert!("tracking__20240101".parse::<DatasetId>().is_err());
        assert_eq!(dataset().date(), "20240101");
    }

    #[test]
    fn test_append_strips_transient_fields() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = Archiver::new(MemoryStore::new(), dir.path());
        let id = archiver.append(&point(1_704_067_200.0)).unwrap();

        assert_eq!(id, dataset());
        let stored = archiver.store().range(&id.key()).unwrap();
        let row: Value = serde_json::from_str(&stored[0]).unwrap();
        for dropped in ["mode", "epx", "raw_acceleration", "p_sensor", "velN"] {
            assert!(row.get(dropped).is_none(), "{} should be stripped", dropped);
        }
        for kept in ["utc", "lat", "lon", "hostname", "my_status"] {
            assert!(row.get(kept).is_some(), "{} should be kept", kept);
        }
    }

    #[test]
    fn test_append_requires_hostname() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = Archiver::new(MemoryStore::new(), dir.path());
        let anonymous = point(1.0).without(|k| k == "hostname");
        assert!(matches!(
            archiver.append(&anonymous),
            Err(ArchiveError::MissingField("hostname"))
        ));
    }

    #[test]
    fn test_archive_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = Archiver::new(MemoryStore::new(), dir.path());
        for i in 0..3 {
            archiver.append(&point(1_704_067_200.0 + i as f64)).unwrap();
        }
        let id = dataset();

        let first = archiver.move_to_archive(&id).unwrap();
        assert!(first.deleted);
        assert_eq!(first.entries, 3);
        let written = fs::read_to_string(archiver.archive_path(&id)).unwrap();
        assert!(written.starts_with('[') && written.ends_with("]\n"));
        assert!(archiver.store().range(&id.key()).unwrap().is_empty());

        let second = archiver.move_to_archive(&id).unwrap();
        assert!(!second.deleted);
        assert_eq!(second.entries, 3);
        assert_eq!(fs::read_to_string(archiver.archive_path(&id)).unwrap(), written);

        let rows = archiver.read_dataset(&id, None, None, true).unwrap();
        let times: Vec<f64> = rows.iter().map(|r| r["utc"].as_f64().unwrap()).collect();
        assert_eq!(times, vec![1_704_067_200.0, 1_704_067_201.0, 1_704_067_202.0]);
    }

    #[test]
    fn test_unknown_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = Archiver::new(MemoryStore::new(), dir.path());
        assert!(matches!(
            archiver.move_to_archive(&dataset()),
            Err(ArchiveError::UnknownDataset(_))
        ));
    }

    #[test]
    fn test_mismatching_existing_file_keeps_live_data() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = Archiver::new(MemoryStore::new(), dir.path());
        archiver.append(&point(1_704_067_200.0)).unwrap();
        let id = dataset();
        fs::write(archiver.archive_path(&id), "[]\n").unwrap();

        assert!(matches!(archiver.move_to_archive(&id), Err(ArchiveError::Conflict(_))));
        assert_eq!(archiver.store().range(&id.key()).unwrap().len(), 1);
        assert_eq!(fs::read_to_string(archiver.archive_path(&id)).unwrap(), "[]\n");
    }

    /// Appends one more entry right after the first full read, like a merger racing the archiver.
    struct RacingStore {
        inner: MemoryStore,
        raced: AtomicBool,
    }

    impl LogStore for RacingStore {
        fn push_front(&self, key: &str, entry: &str) -> Result<(), StoreError> {
            self.inner.push_front(key, entry)
        }

        fn range(&self, key: &str) -> Result<Vec<String>, StoreError> {
            let list = self.inner.range(key)?;
            if !self.raced.swap(true, Ordering::SeqCst) {
                self.inner.push_front(key, "{\"utc\":1704067300.0,\"hostname\":\"pi\"}")?;
            }
            Ok(list)
        }

        fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
            self.inner.keys(pattern)
        }

        fn delete_if_unchanged(&self, key: &str, expected: &[String]) -> Result<bool, StoreError> {
            self.inner.delete_if_unchanged(key, expected)
        }
    }

    #[test]
    fn test_concurrent_append_is_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RacingStore {
            inner: MemoryStore::new(),
            raced: AtomicBool::new(true),
        });
        let archiver = Archiver::new(store.clone(), dir.path());
        archiver.append(&point(1_704_067_200.0)).unwrap();
        archiver.append(&point(1_704_067_201.0)).unwrap();
        let id = dataset();
        store.raced.store(false, Ordering::SeqCst);

        assert!(matches!(archiver.move_to_archive(&id), Err(ArchiveError::Conflict(_))));
        assert_eq!(store.range(&id.key()).unwrap().len(), 3);
        assert!(!archiver.archive_path(&id).exists());

        // retry sees everything and succeeds
        let outcome = archiver.move_to_archive(&id).unwrap();
        assert!(outcome.deleted);
        assert_eq!(outcome.entries, 3);
    }

    #[test]
    fn test_listing_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = Archiver::new(MemoryStore::new(), dir.path());
        archiver.append(&point(1_704_067_200.0)).unwrap(); // 2024-01-01
        archiver.append(&point(1_706_745_600.0)).unwrap(); // 2024-02-01

        let live = archiver.available_datasets("tracking", "*").unwrap();
        assert_eq!(live.len(), 2);
        assert!(archiver.available_datasets("tracking", "202401*").unwrap().len() == 1);
        assert!(archiver.available_datasets("Tracking!", "*").is_err());

        let results = archiver.archive_stale("202402").unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_ok());
        assert_eq!(archiver.archived_datasets("*", "*").unwrap(), vec![dataset()]);
        assert_eq!(archiver.available_datasets("*", "*").unwrap().len(), 1);

        assert_eq!(archiver.restore_from_archive(&dataset()).unwrap(), 1);
        assert!(matches!(
            archiver.restore_from_archive(&dataset()),
            Err(ArchiveError::AlreadyLive(_))
        ));
        let rows = archiver.read_dataset(&dataset(), None, None, false).unwrap();
        assert_eq!(rows[0]["utc"], json!(1_704_067_200.0));
    }

    #[test]
    fn test_read_dataset_time_window() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = Archiver::new(MemoryStore::new(), dir.path());
        for i in 0..5 {
            archiver.append(&point(1_704_067_200.0 + 10.0 * i as f64)).unwrap();
        }
        let rows = archiver
            .read_dataset(&dataset(), Some(1_704_067_210.0), Some(1_704_067_230.0), false)
            .unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn test_track_length_over_one_degree() {
        let mut rows: Vec<Value> = (0..=10)
            .map(|i| json!({ "utc": i as f64, "lat": i as f64 * 0.1, "lon": 0.0 }))
            .collect();
        let one_degree = geo::EARTH_RADIUS_M * 1f64.to_radians();
        assert!((track_length(&rows, DEFAULT_SEGMENT_GAP) - one_degree).abs() < 1e-3);

        // positionless rows are skipped, the jump across a time gap is not counted
        rows.insert(5, json!({ "utc": 4.5 }));
        rows.push(json!({ "utc": 5000.0, "lat": 5.0, "lon": 0.0 }));
        rows.push(json!({ "utc": 5001.0, "lat": 5.0, "lon": 0.0 }));
        assert!((track_length(&rows, DEFAULT_SEGMENT_GAP) - one_degree).abs() < 1e-3);
        assert_eq!(track_length(&[], DEFAULT_SEGMENT_GAP), 0.0);
    }

    #[test]
    fn test_split_track_segments() {
        let rows: Vec<Value> = [0.0, 10.0, 700.0, 710.0, 2000.0]
            .iter()
            .map(|t| json!({ "utc": t }))
            .collect();
        let segments = split_track_segments(&rows, DEFAULT_SEGMENT_GAP);
        let lengths: Vec<usize> = segments.iter().map(|s| s.len()).collect();
        assert_eq!(lengths, vec![2, 2, 1]);
        assert!(split_track_segments(&[], DEFAULT_SEGMENT_GAP).is_empty());
    }
}
