use glob::{MatchOptions, Pattern};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::settings::WorkspaceSettings;
use crate::{language_for_path, Fingerprint, SourceFile};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("source root is not a directory: {}", .0.display())]
    Root(PathBuf),

    #[error("invalid glob pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Enumerates source files under a root directory.
///
/// Patterns are matched against paths relative to `base` (the workspace root
/// by default), so `**/*.py` and `src/**` mean the same thing they do in the
/// settings file.
#[derive(Debug, Clone)]
pub struct FileScanner {
    base: PathBuf,
    root: PathBuf,
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
    respect_gitignore: bool,
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>, ScanError> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|source| ScanError::Pattern {
                pattern: p.clone(),
                source,
            })
        })
        .collect()
}

impl FileScanner {
    pub fn new(
        root: impl Into<PathBuf>,
        include: &[String],
        exclude: &[String],
    ) -> Result<Self, ScanError> {
        let root = root.into();
        Ok(Self {
            base: root.clone(),
            root,
            include: compile(include)?,
            exclude: compile(exclude)?,
            respect_gitignore: false,
        })
    }

    /// Scanner for `<workspace>/<source_folder>` with paths reported relative
    /// to the workspace root.
    pub fn from_settings(workspace_root: &Path, settings: &WorkspaceSettings) -> Result<Self, ScanError> {
        let mut scanner = Self::new(
            workspace_root.join(&settings.source_folder),
            &settings.include_patterns,
            &settings.exclude_patterns,
        )?;
        scanner.base = workspace_root.to_path_buf();
        scanner.respect_gitignore = settings.respect_gitignore;
        Ok(scanner)
    }

    pub fn respect_gitignore(mut self, yes: bool) -> Self {
        self.respect_gitignore = yes;
        self
    }

    /// True if `rel_path` hits an include pattern and no exclude pattern.
    pub fn matches(&self, rel_path: &str) -> bool {
        let included = self
            .include
            .iter()
            .any(|p| p.matches_with(rel_path, MATCH_OPTIONS));
        included
            && !self
                .exclude
                .iter()
                .any(|p| p.matches_with(rel_path, MATCH_OPTIONS))
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.base).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        Some(parts.join("/"))
    }

    /// Walk the root and fingerprint every matching file, sorted by path.
    /// Unreadable entries are logged and skipped.
    pub fn scan(&self) -> Result<Vec<SourceFile>, ScanError> {
        if !self.root.is_dir() {
            return Err(ScanError::Root(self.root.clone()));
        }

        let walker = WalkBuilder::new(&self.root)
            .hidden(true)
            .ignore(false)
            .git_global(false)
            .git_ignore(self.respect_gitignore)
            .git_exclude(self.respect_gitignore)
            .require_git(false)
            .parents(self.respect_gitignore)
            .follow_links(false)
            .build();

        let mut files = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let Some(rel) = self.relative(entry.path()) else {
                continue;
            };
            if !self.matches(&rel) {
                continue;
            }
            match Fingerprint::compute(entry.path()) {
                Ok(fingerprint) => files.push(SourceFile {
                    language: language_for_path(&rel).to_string(),
                    path: rel,
                    fingerprint,
                }),
                Err(e) => warn!("skipping {}: {}", entry.path().display(), e),
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        debug!("scanned {} source files under {}", files.len(), self.root.display());
        Ok(files)
    }
}
