//! Durable fingerprint-keyed store of per-file analyses.
//!
//! One entry per path, each persisted as its own JSON file named by the
//! sha256 of the path. An entry is valid only while its fingerprint matches
//! the file on disk; a `put` for a path replaces whatever was there.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::store::{read_json, write_json, CACHE_DIR};
use crate::{FileAnalysis, Fingerprint, SourceFile, StoreError, Workspace};

/// Bumped when the on-disk layout of an entry changes incompatibly.
pub const CACHE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub analysis: FileAnalysis,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryFile {
    version: u32,
    path: String,
    #[serde(flatten)]
    entry: CacheEntry,
}

type Entries = BTreeMap<String, Arc<CacheEntry>>;

/// Frozen view of the cache, taken at job start.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    entries: Arc<Entries>,
}

impl CacheSnapshot {
    pub fn lookup(&self, path: &str, fingerprint: &Fingerprint) -> Option<&FileAnalysis> {
        self.entries
            .get(path)
            .filter(|e| e.fingerprint.matches(fingerprint))
            .map(|e| &e.analysis)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
pub struct AnalysisCache {
    dir: PathBuf,
    entries: RwLock<Arc<Entries>>,
    write_lock: Mutex<()>,
}

fn entry_file_name(path: &str) -> String {
    format!("{}.json", Fingerprint::of_bytes(path.as_bytes()).hash)
}

impl AnalysisCache {
    /// Load every entry under `dir`. Entries with another schema version or
    /// that fail to parse are skipped and will be recomputed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        let mut entries = Entries::new();
        if dir.exists() {
            for item in fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))? {
                let file = item.map_err(|e| StoreError::io(&dir, e))?.path();
                if file.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match read_json::<EntryFile>(&file) {
                    Ok(Some(stored)) if stored.version == CACHE_SCHEMA_VERSION => {
                        entries.insert(stored.path, Arc::new(stored.entry));
                    }
                    Ok(Some(stored)) => warn!(
                        "discarding cache entry for {} with schema version {} (expected {})",
                        stored.path, stored.version, CACHE_SCHEMA_VERSION
                    ),
                    Ok(None) => {}
                    Err(e) => warn!("discarding unreadable cache entry: {}", e),
                }
            }
        }
        debug!("loaded {} cached analyses from {}", entries.len(), dir.display());
        Ok(Self {
            dir,
            entries: RwLock::new(Arc::new(entries)),
            write_lock: Mutex::new(()),
        })
    }

    pub fn in_workspace(workspace: &Workspace) -> Result<Self, StoreError> {
        Self::open(workspace.data_path(CACHE_DIR))
    }

    fn entry_path(&self, path: &str) -> PathBuf {
        self.dir.join(entry_file_name(path))
    }

    /// Cached analysis for `file`, if its fingerprint is still current.
    pub fn get(&self, file: &SourceFile) -> Option<FileAnalysis> {
        self.lookup(&file.path, &file.fingerprint)
    }

    pub fn lookup(&self, path: &str, fingerprint: &Fingerprint) -> Option<FileAnalysis> {
        let entries = self.entries.read();
        entries
            .get(path)
            .filter(|e| e.fingerprint.matches(fingerprint))
            .map(|e| e.analysis.clone())
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            entries: Arc::clone(&self.entries.read()),
        }
    }

    /// Upsert the entry for `path` and persist it. The in-memory view only
    /// changes once the file write succeeded.
    pub fn put(&self, path: &str, fingerprint: Fingerprint, analysis: FileAnalysis) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let stored = EntryFile {
            version: CACHE_SCHEMA_VERSION,
            path: path.to_string(),
            entry: CacheEntry {
                fingerprint,
                analysis,
            },
        };
        write_json(&self.entry_path(path), &stored)?;

        let mut entries = self.entries.write();
        // Clones only while a snapshot still holds the previous map.
        Arc::make_mut(&mut *entries).insert(stored.path, Arc::new(stored.entry));
        Ok(())
    }

    /// Drop entries whose path is not in `keep`. Returns how many were removed.
    pub fn retain_paths(&self, keep: &HashSet<&str>) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock();
        let stale: Vec<String> = self
            .entries
            .read()
            .keys()
            .filter(|path| !keep.contains(path.as_str()))
            .cloned()
            .collect();

        for (removed, path) in stale.iter().enumerate() {
            let file = self.entry_path(path);
            match fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    self.forget(&stale[..removed]);
                    return Err(StoreError::io(&file, e));
                }
            }
        }
        self.forget(&stale);
        if !stale.is_empty() {
            debug!("pruned {} stale cache entries", stale.len());
        }
        Ok(stale.len())
    }

    fn forget(&self, paths: &[String]) {
        if paths.is_empty() {
            return;
        }
        let mut entries = self.entries.write();
        let entries = Arc::make_mut(&mut *entries);
        for path in paths {
            entries.remove(path);
        }
    }

    /// Every cached analysis keyed by path.
    pub fn results(&self) -> BTreeMap<String, FileAnalysis> {
        self.entries
            .read()
            .iter()
            .map(|(path, entry)| (path.clone(), entry.analysis.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
