//! Missing List (spec.md §4.4), grounded on `fen-missing.c`.
//!
//! Holds paths whose parent directory exists but the path itself does not
//! (yet) — typically a subscription made before its target was created, or
//! a path left over after its node was deleted while still subscribed.
//! Entries are periodically rechecked; the caller (the Façade) does the
//! actual `stat` and re-associates through the Port Layer if the path has
//! appeared.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::fdata::FDataId;

struct Entry {
    path: PathBuf,
    last_checked: Instant,
}

/// Tracks not-yet-existing monitored paths, keyed by the `FData` waiting on
/// them (there is exactly one Missing List entry per such FData at a time).
pub struct MissingList {
    entries: HashMap<FDataId, Entry>,
}

impl MissingList {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn add(&mut self, fdata: FDataId, path: PathBuf) {
        trace!(path = %path.display(), "added to missing list");
        self.entries.insert(
            fdata,
            Entry {
                path,
                last_checked: Instant::now(),
            },
        );
    }

    pub fn remove(&mut self, fdata: FDataId) -> bool {
        self.entries.remove(&fdata).is_some()
    }

    pub fn contains(&self, fdata: FDataId) -> bool {
        self.entries.contains_key(&fdata)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `(fdata, path)` pairs due for a re-check (`SCAN_MISSING_INTERVAL`
    /// has elapsed since the last check), without removing them — the
    /// caller removes an entry explicitly via [`Self::remove`] once the path
    /// is confirmed to exist and has been re-associated.
    pub fn due(&mut self, interval: Duration) -> Vec<(FDataId, PathBuf)> {
        let now = Instant::now();
        let mut ready = Vec::new();
        for (fdata, entry) in self.entries.iter_mut() {
            if now.duration_since(entry.last_checked) >= interval {
                entry.last_checked = now;
                ready.push((*fdata, entry.path.clone()));
            }
        }
        ready
    }
}

impl Default for MissingList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> FDataId {
        // FDataId has no public constructor; exercise the list through a
        // real arena-assigned id instead of fabricating one.
        let mut arena = crate::fdata::FDataArena::new();
        let node = crate::node::NodeTree::new().root();
        for _ in 0..n {
            arena.create(node, false);
        }
        arena.create(node, false)
    }

    #[test]
    fn add_and_remove_round_trip() {
        let mut list = MissingList::new();
        let fdata = id(0);
        list.add(fdata, PathBuf::from("/a/b"));
        assert!(list.contains(fdata));
        assert!(list.remove(fdata));
        assert!(!list.contains(fdata));
    }

    #[test]
    fn due_returns_nothing_before_interval_elapses() {
        let mut list = MissingList::new();
        let fdata = id(1);
        list.add(fdata, PathBuf::from("/a/b"));
        let ready = list.due(Duration::from_secs(60));
        assert!(ready.is_empty());
    }

    #[test]
    fn due_returns_entries_once_interval_elapses() {
        let mut list = MissingList::new();
        let fdata = id(2);
        list.add(fdata, PathBuf::from("/a/b"));
        let ready = list.due(Duration::from_secs(0));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, fdata);
    }
}
