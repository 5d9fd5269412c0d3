use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::AppResult;
use crate::providers::Candidate;
use crate::scoring::Strategy;

pub const DEFAULT_CLUSTER_THRESHOLD: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CachedResponse {
    Found { candidates: Vec<Candidate> },
    NoResult,
}

impl CachedResponse {
    pub fn from_candidates(candidates: Vec<Candidate>) -> Self {
        if candidates.is_empty() {
            CachedResponse::NoResult
        } else {
            CachedResponse::Found { candidates }
        }
    }

    pub fn candidates(&self) -> &[Candidate] {
        match self {
            CachedResponse::Found { candidates } => candidates,
            CachedResponse::NoResult => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub provider: String,
    pub strategy: Strategy,
    pub response: CachedResponse,
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(provider: impl Into<String>, strategy: Strategy, response: CachedResponse) -> Self {
        Self {
            provider: provider.into(),
            strategy,
            response,
            stored_at: Utc::now(),
        }
    }

    fn first_coordinate(&self) -> Option<(f64, f64)> {
        self.response.candidates().first().map(|c| (c.lat, c.lng))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub found: usize,
    pub no_result: usize,
    pub by_provider: BTreeMap<String, usize>,
    pub by_strategy: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PruneOptions {
    pub no_results: bool,
    /// Drops every key in a group of at least this many keys resolving to one coordinate.
    pub cluster_threshold: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub removed_no_results: usize,
    pub removed_clustered: usize,
    pub remaining: usize,
}

#[derive(Default)]
struct CacheState {
    entries: BTreeMap<String, CacheEntry>,
    writes_since_flush: usize,
    dirty: bool,
}

/// Query-string keyed store of provider answers, kept in memory and mirrored to a JSON file.
pub struct ResultCache {
    path: Option<PathBuf>,
    state: Mutex<CacheState>,
    flush_every: usize,
}

impl ResultCache {
    /// Loads the cache file. A missing file starts empty. A corrupt one is copied
    /// aside and an unreadable one is moved aside; if that move fails the cache
    /// stays in memory so the original is never overwritten.
    pub fn open(path: impl Into<PathBuf>, flush_every: usize) -> Self {
        let path = path.into();
        let (entries, persist) = load_entries(&path);
        info!(path = %path.display(), entries = entries.len(), "result cache loaded");
        Self {
            path: persist.then_some(path),
            state: Mutex::new(CacheState {
                entries,
                ..CacheState::default()
            }),
            flush_every,
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(CacheState::default()),
            flush_every: 0,
        }
    }

    pub fn lookup(&self, key: &str) -> Option<CacheEntry> {
        self.state.lock().entries.get(key).cloned()
    }

    /// Last write wins. Flushes when `flush_every` writes have accumulated.
    pub fn store(&self, key: impl Into<String>, entry: CacheEntry) -> AppResult<()> {
        let mut state = self.state.lock();
        state.entries.insert(key.into(), entry);
        state.writes_since_flush += 1;
        state.dirty = true;
        if self.flush_every > 0 && state.writes_since_flush >= self.flush_every {
            self.flush_locked(&mut state)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let mut stats = CacheStats {
            total: state.entries.len(),
            ..CacheStats::default()
        };
        for entry in state.entries.values() {
            match entry.response {
                CachedResponse::Found { .. } => stats.found += 1,
                CachedResponse::NoResult => stats.no_result += 1,
            }
            *stats.by_provider.entry(entry.provider.clone()).or_default() += 1;
            *stats
                .by_strategy
                .entry(entry.strategy.as_str().to_string())
                .or_default() += 1;
        }
        stats
    }

    /// Removes entries in memory; call [`ResultCache::flush`] to persist.
    pub fn prune(&self, options: PruneOptions) -> PruneReport {
        let mut state = self.state.lock();
        let mut report = PruneReport::default();

        if options.no_results {
            let before = state.entries.len();
            state
                .entries
                .retain(|_, entry| entry.response != CachedResponse::NoResult);
            report.removed_no_results = before - state.entries.len();
        }

        if let Some(threshold) = options.cluster_threshold.filter(|t| *t > 1) {
            let mut groups: HashMap<String, Vec<String>> = HashMap::new();
            for (key, entry) in &state.entries {
                if let Some((lat, lng)) = entry.first_coordinate() {
                    groups
                        .entry(format!("{lat:.6},{lng:.6}"))
                        .or_default()
                        .push(key.clone());
                }
            }
            for (coordinate, keys) in groups {
                if keys.len() < threshold {
                    continue;
                }
                debug!(%coordinate, count = keys.len(), "dropping clustered cache keys");
                for key in keys {
                    if state.entries.remove(&key).is_some() {
                        report.removed_clustered += 1;
                    }
                }
            }
        }

        if report.removed_no_results + report.removed_clustered > 0 {
            state.dirty = true;
        }
        report.remaining = state.entries.len();
        report
    }

    fn flush_locked(&self, state: &mut CacheState) -> AppResult<()> {
        let Some(path) = &self.path else {
            state.writes_since_flush = 0;
            return Ok(());
        };
        if !state.dirty {
            return Ok(());
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let encoded = serde_json::to_vec_pretty(&state.entries)?;
        let temp_path = sibling(path, "tmp");
        fs::write(&temp_path, encoded)?;
        fs::rename(&temp_path, path)?;

        state.writes_since_flush = 0;
        state.dirty = false;
        debug!(path = %path.display(), entries = state.entries.len(), "result cache flushed");
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "geocode_cache.json".into());
    name.push(format!(".{suffix}"));
    path.with_file_name(name)
}

/// Returns the loaded entries and whether the file may be written back.
fn load_entries(path: &Path) -> (BTreeMap<String, CacheEntry>, bool) {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return (BTreeMap::new(), true),
        Err(err) => {
            let aside = sibling(path, "unreadable");
            return match fs::rename(path, &aside) {
                Ok(()) => {
                    warn!(
                        path = %path.display(),
                        aside = %aside.display(),
                        ?err,
                        "result cache unreadable, starting empty"
                    );
                    (BTreeMap::new(), true)
                }
                Err(move_err) => {
                    warn!(
                        path = %path.display(),
                        ?err,
                        ?move_err,
                        "result cache unreadable and cannot be moved aside; results will not be saved"
                    );
                    (BTreeMap::new(), false)
                }
            };
        }
    };
    let entries = match serde_json::from_slice(&bytes) {
        Ok(entries) => entries,
        Err(err) => {
            let aside = sibling(path, "corrupt");
            warn!(
                path = %path.display(),
                aside = %aside.display(),
                %err,
                "result cache corrupt, starting empty"
            );
            if let Err(copy_err) = fs::copy(path, &aside) {
                warn!(?copy_err, "could not preserve corrupt cache file");
            }
            BTreeMap::new()
        }
    };
    (entries, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn found(lat: f64, lng: f64, display: &str) -> CacheEntry {
        CacheEntry::new(
            "nominatim",
            Strategy::FreeText,
            CachedResponse::Found {
                candidates: vec![Candidate {
                    lat,
                    lng,
                    display_name: display.into(),
                    kind: None,
                }],
            },
        )
    }

    #[test]
    fn store_then_lookup_returns_entry() {
        let cache = ResultCache::in_memory();
        let entry = found(42.69, 23.32, "София");
        cache.store("бул. Витоша 1, София, Bulgaria", entry.clone()).unwrap();
        assert_eq!(cache.lookup("бул. Витоша 1, София, Bulgaria"), Some(entry));
        assert!(cache.lookup("бул. Витоша 1, София").is_none());
    }

    #[test]
    fn last_write_wins() {
        let cache = ResultCache::in_memory();
        cache.store("k", found(42.0, 23.0, "a")).unwrap();
        let second = CacheEntry::new("relay", Strategy::FreeText, CachedResponse::NoResult);
        cache.store("k", second.clone()).unwrap();
        assert_eq!(cache.lookup("k"), Some(second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn reloads_every_entry_after_flush() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let cache = ResultCache::open(&path, 0);
        cache.store("a", found(42.1, 24.7, "Пловдив")).unwrap();
        cache
            .store(
                "b",
                CacheEntry::new("nominatim", Strategy::Structured, CachedResponse::NoResult),
            )
            .unwrap();
        cache.flush().unwrap();
        assert!(!dir.path().join("cache.json.tmp").exists());

        let reloaded = ResultCache::open(&path, 0);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.lookup("a"), cache.lookup("a"));
        assert_eq!(reloaded.lookup("b"), cache.lookup("b"));
    }

    #[test]
    fn flushes_after_configured_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let cache = ResultCache::open(&path, 2);
        cache.store("a", found(42.0, 23.0, "a")).unwrap();
        assert!(!path.exists());
        cache.store("b", found(42.0, 23.1, "b")).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn corrupt_file_is_preserved_and_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, "{not json").unwrap();

        let cache = ResultCache::open(&path, 0);
        assert!(cache.is_empty());
        let aside = dir.path().join("cache.json.corrupt");
        assert_eq!(fs::read_to_string(aside).unwrap(), "{not json");

        cache.store("a", found(42.0, 23.0, "a")).unwrap();
        cache.flush().unwrap();
        assert_eq!(ResultCache::open(&path, 0).len(), 1);
    }

    #[test]
    fn unreadable_path_is_moved_aside_before_flush() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep.txt"), "kept").unwrap();

        let cache = ResultCache::open(&path, 0);
        assert!(cache.is_empty());
        let aside = dir.path().join("cache.json.unreadable");
        assert_eq!(fs::read_to_string(aside.join("keep.txt")).unwrap(), "kept");

        cache.store("a", found(42.0, 23.0, "a")).unwrap();
        cache.flush().unwrap();
        assert_eq!(ResultCache::open(&path, 0).len(), 1);
    }

    #[test]
    fn prunes_no_results_and_coordinate_clusters() {
        let cache = ResultCache::in_memory();
        for key in ["x1", "x2", "x3"] {
            cache.store(key, found(42.6977, 23.3219, "София")).unwrap();
        }
        cache.store("y", found(43.2, 27.9, "Варна")).unwrap();
        cache
            .store(
                "none",
                CacheEntry::new("nominatim", Strategy::FreeText, CachedResponse::NoResult),
            )
            .unwrap();

        let stats = cache.stats();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.no_result, 1);
        assert_eq!(stats.by_provider.get("nominatim"), Some(&5));

        let report = cache.prune(PruneOptions {
            no_results: true,
            cluster_threshold: Some(DEFAULT_CLUSTER_THRESHOLD),
        });
        assert_eq!(report.removed_no_results, 1);
        assert_eq!(report.removed_clustered, 3);
        assert_eq!(report.remaining, 1);
        assert!(cache.lookup("y").is_some());
    }

    #[test]
    fn entries_serialize_with_status_tag() {
        let entry = CacheEntry::new("nominatim", Strategy::CityFallback, CachedResponse::NoResult);
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["response"]["status"], "no_result");
        assert_eq!(value["strategy"], "city_fallback");
    }
}
