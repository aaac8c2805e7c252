//! Live list store holding the per-device, per-day track logs.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fs2::FileExt;

use crate::error::StoreError;

/// Keyed lists with head insertion.
pub trait LogStore: Send + Sync {
    /// Insert `entry` at the head of the list under `key`.
    fn push_front(&self, key: &str, entry: &str) -> Result<(), StoreError>;

    /// Whole list, head (newest) first; empty when the key does not exist.
    fn range(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Existing keys matching a `*` glob, sorted.
    fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Atomically delete `key` if its list still equals `expected` (head first).
    ///
    /// Returns `false` and leaves the list alone when it changed.
    fn delete_if_unchanged(&self, key: &str, expected: &[String]) -> Result<bool, StoreError>;
}

impl<T: LogStore + ?Sized> LogStore for Arc<T> {
    fn push_front(&self, key: &str, entry: &str) -> Result<(), StoreError> {
        (**self).push_front(key, entry)
    }

    fn range(&self, key: &str) -> Result<Vec<String>, StoreError> {
        (**self).range(key)
    }

    fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        (**self).keys(pattern)
    }

    fn delete_if_unchanged(&self, key: &str, expected: &[String]) -> Result<bool, StoreError> {
        (**self).delete_if_unchanged(key, expected)
    }
}

/// `*` matches any run of characters, everything else matches itself.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

#[derive(Default)]
pub struct MemoryStore {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lists(&self) -> MutexGuard<'_, HashMap<String, VecDeque<String>>> {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LogStore for MemoryStore {
    fn push_front(&self, key: &str, entry: &str) -> Result<(), StoreError> {
        self.lists()
            .entry(key.to_string())
            .or_default()
            .push_front(entry.to_string());
        Ok(())
    }

    fn range(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lists()
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .lists()
            .iter()
            .filter(|(key, list)| !list.is_empty() && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn delete_if_unchanged(&self, key: &str, expected: &[String]) -> Result<bool, StoreError> {
        let mut lists = self.lists();
        let unchanged = match lists.get(key) {
            Some(list) => list.iter().eq(expected.iter()),
            None => expected.is_empty(),
        };
        if unchanged {
            lists.remove(key);
        }
        Ok(unchanged)
    }
}

/// File-backed store: one `<key>.jsonl` file per list, oldest line first.
///
/// Every operation holds an exclusive advisory lock on the directory, so
/// handles in other processes (a running merger, an archive command) see
/// each push, read and compare-and-delete as one step.
pub struct JsonLinesStore {
    directory: PathBuf,
}

const LIST_EXTENSION: &str = ".jsonl";
const LOCK_FILE: &str = ".lock";

/// Held for the duration of one store operation; closing the file releases the lock.
struct DirectoryLock {
    _file: File,
}

impl JsonLinesStore {
    pub fn open(directory: impl AsRef<Path>) -> Result<Self, StoreError> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn lock(&self) -> Result<DirectoryLock, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.directory.join(LOCK_FILE))?;
        file.lock_exclusive()?;
        Ok(DirectoryLock { _file: file })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() || key.starts_with('.') || key.contains(['/', '\\']) {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.directory.join(format!("{key}{LIST_EXTENSION}")))
    }

    fn read_newest_first(path: &Path) -> Result<Vec<String>, StoreError> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(text
                .lines()
                .rev()
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl LogStore for JsonLinesStore {
    fn push_front(&self, key: &str, entry: &str) -> Result<(), StoreError> {
        if entry.contains('\n') {
            return Err(StoreError::InvalidKey(format!("{key}: multi-line entry")));
        }
        let path = self.path_for(key)?;
        let _lock = self.lock()?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{entry}")?;
        Ok(())
    }

    fn range(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let path = self.path_for(key)?;
        let _lock = self.lock()?;
        Self::read_newest_first(&path)
    }

    fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let _lock = self.lock()?;
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(|n| n.strip_suffix(LIST_EXTENSION)) else {
                continue;
            };
            if entry.metadata()?.len() > 0 && glob_match(pattern, key) {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn delete_if_unchanged(&self, key: &str, expected: &[String]) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        let _lock = self.lock()?;
        if Self::read_newest_first(&path)? != expected {
            return Ok(false);
        }
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn LogStore) {
        store.push_front("tracking:pi:20240101", "{\"utc\":1}").unwrap();
        store.push_front("tracking:pi:20240101", "{\"utc\":2}").unwrap();
        store.push_front("tracking:pi:20240102", "{\"utc\":3}").unwrap();

        let list = store.range("tracking:pi:20240101").unwrap();
        assert_eq!(list, vec!["{\"utc\":2}".to_string(), "{\"utc\":1}".to_string()]);
        assert!(store.range("tracking:pi:19990101").unwrap().is_empty());

        assert_eq!(
            store.keys("tracking:*:20240101").unwrap(),
            vec!["tracking:pi:20240101".to_string()]
        );
        assert_eq!(store.keys("*").unwrap().len(), 2);

        // stale expectation: list keeps its data
        assert!(!store
            .delete_if_unchanged("tracking:pi:20240101", &list[..1])
            .unwrap());
        assert_eq!(store.range("tracking:pi:20240101").unwrap().len(), 2);

        assert!(store.delete_if_unchanged("tracking:pi:20240101", &list).unwrap());
        assert!(store.range("tracking:pi:20240101").unwrap().is_empty());
        // already gone
        assert!(store.delete_if_unchanged("tracking:pi:20240101", &[]).unwrap());
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_json_lines_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonLinesStore::open(dir.path()).unwrap();
        exercise(&store);
        assert!(matches!(
            store.push_front("../escape", "{}"),
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_json_lines_store_handles_share_the_lock() {
        const KEY: &str = "tracking:pi:20240101";
        const WRITTEN: usize = 2000;
        let dir = tempfile::tempdir().unwrap();
        let writer = JsonLinesStore::open(dir.path()).unwrap();
        let archiver = JsonLinesStore::open(dir.path()).unwrap();

        let appends = std::thread::spawn(move || {
            for i in 0..WRITTEN {
                writer.push_front(KEY, &format!("{{\"utc\":{i}}}")).unwrap();
            }
        });
        let mut archived = 0;
        while !appends.is_finished() {
            let list = archiver.range(KEY).unwrap();
            if !list.is_empty() && archiver.delete_if_unchanged(KEY, &list).unwrap() {
                archived += list.len();
            }
        }
        appends.join().unwrap();

        let remaining = archiver.range(KEY).unwrap().len();
        assert_eq!(archived + remaining, WRITTEN);
        assert!(archiver.keys("*").unwrap().iter().all(|k| k == KEY));
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("tracking:*:2024*", "tracking:pi:20240101"));
        assert!(glob_match("*:*:*", "a:b:c"));
        assert!(glob_match("*", ""));
        assert!(!glob_match("tracking:*:20240102", "tracking:pi:20240101"));
        assert!(!glob_match("tracking", "tracking:pi"));
        assert!(glob_match("a*b*c", "axxbyyc"));
        assert!(!glob_match("a*b*c", "axxbyy"));
    }
}
