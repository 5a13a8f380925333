//! Workspace-scoped JSON storage.
//!
//! Every file lives under `<workspace>/.plm/` and is written atomically
//! (temp file + rename), so a reader never observes a half-written file.

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::settings::WorkspaceSettings;
use crate::{ArchitectureGraph, DomainConfig, RequirementRef, StoreError};

pub const DATA_DIR: &str = ".plm";
pub const SETTINGS_FILE: &str = "settings.json";
pub const DOMAINS_FILE: &str = "domains.json";
pub const REQUIREMENTS_FILE: &str = "requirements.json";
pub const ARCHITECTURE_FILE: &str = "architecture.json";
pub const CACHE_DIR: &str = "analysis_cache";

pub trait DomainStore: Send + Sync {
    fn load_domains(&self) -> Result<Vec<DomainConfig>, StoreError>;
    fn save_domains(&self, domains: &[DomainConfig]) -> Result<(), StoreError>;
}

pub trait RequirementStore: Send + Sync {
    fn list_requirements(&self) -> Result<Vec<RequirementRef>, StoreError>;
    fn get_requirement(&self, id: &str) -> Result<Option<RequirementRef>, StoreError>;
    fn put_requirement(&self, requirement: &RequirementRef) -> Result<(), StoreError>;

    /// Apply `edit` to requirement `id` under the store's write lock and
    /// persist the result if `edit` returns `true`.
    ///
    /// Returns `Ok(None)` when no requirement has that id.
    fn update_requirement(
        &self,
        id: &str,
        edit: &mut dyn FnMut(&mut RequirementRef) -> bool,
    ) -> Result<Option<bool>, StoreError>;
}

pub trait GraphStore: Send + Sync {
    fn load_graph(&self) -> Result<Option<ArchitectureGraph>, StoreError>;
    fn save_graph(&self, graph: &ArchitectureGraph) -> Result<(), StoreError>;

    /// Load, transform and save the graph as one step under the store's
    /// write lock. `edit` returns the graph to store, or `None` to leave the
    /// stored one untouched; the stored graph is returned.
    fn update_graph(
        &self,
        edit: &mut dyn FnMut(Option<ArchitectureGraph>) -> Option<ArchitectureGraph>,
    ) -> Result<Option<ArchitectureGraph>, StoreError>;
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write `data` to `path` via a uniquely named sibling temp file and a rename.
pub(crate) fn write_atomic(path: &Path, data: &str) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let seq = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp = dir.join(format!(".{}.{}.{}.tmp", file_name, std::process::id(), seq));
    fs::write(&tmp, data).map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StoreError::io(path, e)
    })
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| StoreError::json(path, e))
}

pub(crate) fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(value).map_err(|e| StoreError::json(path, e))?;
    write_atomic(path, &json)
}

/// A project directory plus its `.plm/` data folder.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    data_dir: PathBuf,
    requirements_lock: Mutex<()>,
    graph_lock: Mutex<()>,
}

impl Workspace {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(StoreError::MissingRoot(root));
        }
        let data_dir = root.join(DATA_DIR);
        fs::create_dir_all(&data_dir).map_err(|e| StoreError::io(&data_dir, e))?;
        debug!("opened workspace {}", root.display());
        Ok(Self {
            root,
            data_dir,
            requirements_lock: Mutex::new(()),
            graph_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_path(&self, file: &str) -> PathBuf {
        self.data_dir.join(file)
    }

    pub fn settings(&self) -> Result<WorkspaceSettings, StoreError> {
        Ok(read_json(&self.data_path(SETTINGS_FILE))?.unwrap_or_default())
    }

    pub fn save_settings(&self, settings: &WorkspaceSettings) -> Result<(), StoreError> {
        write_json(&self.data_path(SETTINGS_FILE), settings)
    }

    fn read_requirements(&self) -> Result<BTreeMap<String, RequirementRef>, StoreError> {
        Ok(read_json(&self.data_path(REQUIREMENTS_FILE))?.unwrap_or_default())
    }
}

impl DomainStore for Workspace {
    fn load_domains(&self) -> Result<Vec<DomainConfig>, StoreError> {
        Ok(read_json(&self.data_path(DOMAINS_FILE))?.unwrap_or_default())
    }

    fn save_domains(&self, domains: &[DomainConfig]) -> Result<(), StoreError> {
        write_json(&self.data_path(DOMAINS_FILE), domains)
    }
}

impl RequirementStore for Workspace {
    fn list_requirements(&self) -> Result<Vec<RequirementRef>, StoreError> {
        Ok(self.read_requirements()?.into_values().collect())
    }

    fn get_requirement(&self, id: &str) -> Result<Option<RequirementRef>, StoreError> {
        Ok(self.read_requirements()?.remove(id))
    }

    fn put_requirement(&self, requirement: &RequirementRef) -> Result<(), StoreError> {
        let _guard = self.requirements_lock.lock();
        let mut all = self.read_requirements()?;
        all.insert(requirement.id.clone(), requirement.clone());
        write_json(&self.data_path(REQUIREMENTS_FILE), &all)
    }

    fn update_requirement(
        &self,
        id: &str,
        edit: &mut dyn FnMut(&mut RequirementRef) -> bool,
    ) -> Result<Option<bool>, StoreError> {
        let _guard = self.requirements_lock.lock();
        let mut all = self.read_requirements()?;
        let Some(requirement) = all.get_mut(id) else {
            return Ok(None);
        };
        if !edit(requirement) {
            return Ok(Some(false));
        }
        write_json(&self.data_path(REQUIREMENTS_FILE), &all)?;
        Ok(Some(true))
    }
}

impl GraphStore for Workspace {
    fn load_graph(&self) -> Result<Option<ArchitectureGraph>, StoreError> {
        read_json(&self.data_path(ARCHITECTURE_FILE))
    }

    fn save_graph(&self, graph: &ArchitectureGraph) -> Result<(), StoreError> {
        let _guard = self.graph_lock.lock();
        write_json(&self.data_path(ARCHITECTURE_FILE), graph)
    }

    fn update_graph(
        &self,
        edit: &mut dyn FnMut(Option<ArchitectureGraph>) -> Option<ArchitectureGraph>,
    ) -> Result<Option<ArchitectureGraph>, StoreError> {
        let _guard = self.graph_lock.lock();
        let path = self.data_path(ARCHITECTURE_FILE);
        let current: Option<ArchitectureGraph> = read_json(&path)?;
        let Some(next) = edit(current.clone()) else {
            return Ok(current);
        };
        write_json(&path, &next)?;
        Ok(Some(next))
    }
}
