//! Code references attached to requirements.
//!
//! References are deduplicated by `(file, line, function)` and carry a
//! `file:line` locator for editor integrations.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{CodeReference, ReferenceKind, RequirementRef, RequirementStore, SourceFile, StoreError};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("unknown requirement '{0}'")]
    UnknownRequirement(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub fn locator(file: &str, line: u32) -> String {
    format!("{}:{}", file, line)
}

impl CodeReference {
    pub fn new(file: impl Into<String>, line: u32, function: impl Into<String>, kind: ReferenceKind) -> Self {
        let file = file.into();
        Self {
            locator: locator(&file, line),
            file,
            line,
            function: function.into(),
            kind,
        }
    }

    fn same_location(&self, other: &CodeReference) -> bool {
        self.file == other.file && self.line == other.line && self.function == other.function
    }
}

/// Drop repeated `(file, line, function)` entries, keeping the first, and
/// refresh every locator.
pub fn dedup_references(references: &mut Vec<CodeReference>) {
    let mut seen = BTreeSet::new();
    references.retain(|r| seen.insert((r.file.clone(), r.line, r.function.clone())));
    for r in references.iter_mut() {
        r.locator = locator(&r.file, r.line);
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagScanSummary {
    pub files_scanned: usize,
    pub references_added: usize,
    /// Tagged ids with no matching requirement, sorted.
    pub unknown_requirements: Vec<String>,
}

/// A requirement tag found in source, tied to the definition that follows it.
#[derive(Debug, Clone, PartialEq)]
pub struct TagHit {
    pub requirement_id: String,
    pub line: u32,
    pub function: String,
}

pub struct RequirementLinker<'a, S: RequirementStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: RequirementStore + ?Sized> RequirementLinker<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    fn require(&self, id: &str) -> Result<RequirementRef, LinkError> {
        self.store
            .get_requirement(id)?
            .ok_or_else(|| LinkError::UnknownRequirement(id.to_string()))
    }

    fn update(&self, id: &str, edit: &mut dyn FnMut(&mut RequirementRef) -> bool) -> Result<bool, LinkError> {
        self.store
            .update_requirement(id, edit)?
            .ok_or_else(|| LinkError::UnknownRequirement(id.to_string()))
    }

    /// Attach a reference. Returns `false` if an equal location was already linked.
    pub fn link(&self, requirement_id: &str, reference: CodeReference) -> Result<bool, LinkError> {
        let reference = CodeReference::new(reference.file, reference.line, reference.function, reference.kind);
        let added = self.update(requirement_id, &mut |requirement| {
            if requirement.code_references.iter().any(|r| r.same_location(&reference)) {
                return false;
            }
            requirement.code_references.push(reference.clone());
            true
        })?;
        if added {
            debug!("linked {} to {}", requirement_id, reference.locator);
        }
        Ok(added)
    }

    pub fn unlink(&self, requirement_id: &str, file: &str, line: u32, function: &str) -> Result<bool, LinkError> {
        self.update(requirement_id, &mut |requirement| {
            let before = requirement.code_references.len();
            requirement
                .code_references
                .retain(|r| !(r.file == file && r.line == line && r.function == function));
            requirement.code_references.len() != before
        })
    }

    pub fn references(&self, requirement_id: &str) -> Result<Vec<CodeReference>, LinkError> {
        Ok(self.require(requirement_id)?.code_references)
    }

    /// Store a full requirement, normalising its reference list first.
    pub fn save(&self, mut requirement: RequirementRef) -> Result<RequirementRef, StoreError> {
        dedup_references(&mut requirement.code_references);
        self.store.put_requirement(&requirement)?;
        Ok(requirement)
    }

    /// Requirements with at least one reference into `file`.
    pub fn requirements_for_file(&self, file: &str) -> Result<Vec<RequirementRef>, StoreError> {
        Ok(self
            .store
            .list_requirements()?
            .into_iter()
            .filter(|r| r.code_references.iter().any(|c| c.file == file))
            .collect())
    }

    /// Scan `files` (relative to `base`) for requirement tags and link each
    /// tagged definition. Existing references are never removed.
    pub fn scan_tags(&self, base: &Path, files: &[SourceFile]) -> Result<TagScanSummary, StoreError> {
        let mut found: BTreeMap<String, Vec<CodeReference>> = BTreeMap::new();
        let mut summary = TagScanSummary::default();

        for file in files {
            let content = match fs::read_to_string(base.join(&file.path)) {
                Ok(c) => c,
                Err(e) => {
                    warn!("skipping {} during tag scan: {}", file.path, e);
                    continue;
                }
            };
            summary.files_scanned += 1;
            for hit in scan_source_for_tags(&content) {
                found.entry(hit.requirement_id).or_default().push(CodeReference::new(
                    file.path.clone(),
                    hit.line,
                    hit.function,
                    ReferenceKind::Implementation,
                ));
            }
        }

        for (requirement_id, references) in &found {
            let mut added = 0;
            let updated = self.store.update_requirement(requirement_id, &mut |requirement| {
                added = 0;
                for reference in references {
                    if !requirement.code_references.iter().any(|r| r.same_location(reference)) {
                        requirement.code_references.push(reference.clone());
                        added += 1;
                    }
                }
                added > 0
            })?;
            match updated {
                Some(_) => summary.references_added += added,
                None => summary.unknown_requirements.push(requirement_id.clone()),
            }
        }

        info!(
            "tag scan: {} files, {} references added, {} unknown ids",
            summary.files_scanned,
            summary.references_added,
            summary.unknown_requirements.len()
        );
        Ok(summary)
    }
}

const TAG_MARKERS: [&str; 4] = ["Requirement:", "@requirement", "@req", "RQ-"];

const DEFINITION_PREFIXES: [&str; 24] = [
    "def ",
    "async def ",
    "fn ",
    "pub fn ",
    "pub(crate) fn ",
    "async fn ",
    "pub async fn ",
    "function ",
    "async function ",
    "export function ",
    "void ",
    "int ",
    "bool ",
    "string ",
    "std::string ",
    "float ",
    "double ",
    "char ",
    "auto ",
    "static ",
    "inline ",
    "virtual ",
    "explicit ",
    "unsigned ",
];

const TYPE_PREFIXES: [&str; 6] = ["class ", "export class ", "struct ", "pub struct ", "enum ", "pub enum "];

lazy_static::lazy_static! {
    static ref REQUIREMENT_ID: Regex = Regex::new(r"RQ-[A-Z_]+(?:-[A-Z0-9_]+)*-\d+").unwrap();
    static ref CALL_NAME: Regex = Regex::new(r"([A-Za-z_~][\w:~]*)\s*\(").unwrap();
    static ref TYPE_NAME: Regex = Regex::new(r"(?:class|struct|enum)\s+([A-Za-z_]\w*)").unwrap();
}

/// Name of the function or type defined on `line`, if it is a definition.
fn definition_name(line: &str) -> Option<String> {
    let trimmed = line.trim_start();
    if TYPE_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
        return TYPE_NAME.captures(trimmed).map(|c| c[1].to_string());
    }
    let callable = DEFINITION_PREFIXES.iter().any(|p| trimmed.starts_with(p))
        || (trimmed.contains("::") && !trimmed.trim_end().ends_with(';'));
    if !callable || !trimmed.contains('(') {
        return None;
    }
    CALL_NAME.captures(trimmed).map(|c| c[1].to_string())
}

/// Find requirement tags in `content` and pair them with every definition
/// that follows, until a blank line or a closing brace drops the tag.
pub fn scan_source_for_tags(content: &str) -> Vec<TagHit> {
    let mut hits = Vec::new();
    let mut pending: Vec<String> = Vec::new();

    for (index, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if TAG_MARKERS.iter().any(|m| line.contains(m)) {
            let ids: Vec<String> = REQUIREMENT_ID
                .find_iter(line)
                .map(|m| m.as_str().to_string())
                .collect();
            if !ids.is_empty() {
                pending = ids;
            }
            continue;
        }
        if pending.is_empty() {
            continue;
        }
        if let Some(function) = definition_name(line) {
            let line = index as u32 + 1;
            for requirement_id in &pending {
                hits.push(TagHit {
                    requirement_id: requirement_id.clone(),
                    line,
                    function: function.clone(),
                });
            }
        } else if trimmed.is_empty() || trimmed.starts_with('}') {
            pending.clear();
        }
    }
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Workspace;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        ws.put_requirement(&RequirementRef::new("RQ-UI-001", "ui", "Show speed"))
            .unwrap();
        ws.put_requirement(&RequirementRef::new("RQ-MOTOR-002", "motor", "Stop on fault"))
            .unwrap();
        (dir, ws)
    }

    #[test]
    fn link_is_deduplicated_by_location() {
        let (_dir, ws) = workspace();
        let linker = RequirementLinker::new(&ws);
        let reference = CodeReference::new("src/ui.py", 10, "render", ReferenceKind::Implementation);
        assert!(linker.link("RQ-UI-001", reference.clone()).unwrap());
        assert!(!linker.link("RQ-UI-001", reference).unwrap());
        assert!(linker
            .link("RQ-UI-001", CodeReference::new("src/ui.py", 10, "render", ReferenceKind::Test))
            .is_ok_and(|added| !added));

        let refs = linker.references("RQ-UI-001").unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].locator, "src/ui.py:10");
    }

    #[test]
    fn unknown_requirement_is_an_error() {
        let (_dir, ws) = workspace();
        let linker = RequirementLinker::new(&ws);
        let err = linker
            .link("RQ-NONE-9", CodeReference::new("a.py", 1, "f", ReferenceKind::Implementation))
            .unwrap_err();
        assert!(matches!(err, LinkError::UnknownRequirement(id) if id == "RQ-NONE-9"));
    }

    #[test]
    fn unlink_and_reverse_lookup() {
        let (_dir, ws) = workspace();
        let linker = RequirementLinker::new(&ws);
        linker
            .link("RQ-UI-001", CodeReference::new("src/ui.py", 10, "render", ReferenceKind::Implementation))
            .unwrap();
        linker
            .link("RQ-MOTOR-002", CodeReference::new("src/motor.py", 4, "stop", ReferenceKind::Implementation))
            .unwrap();

        let for_ui: Vec<String> = linker
            .requirements_for_file("src/ui.py")
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(for_ui, vec!["RQ-UI-001"]);

        assert!(linker.unlink("RQ-UI-001", "src/ui.py", 10, "render").unwrap());
        assert!(!linker.unlink("RQ-UI-001", "src/ui.py", 10, "render").unwrap());
        assert!(linker.requirements_for_file("src/ui.py").unwrap().is_empty());
    }

    #[test]
    fn save_collapses_duplicates_and_fills_locators() {
        let (_dir, ws) = workspace();
        let linker = RequirementLinker::new(&ws);
        let mut requirement = RequirementRef::new("RQ-UI-001", "ui", "Show speed");
        let mut stale = CodeReference::new("a.py", 3, "f", ReferenceKind::Implementation);
        stale.locator = String::new();
        requirement.code_references = vec![
            stale.clone(),
            stale,
            CodeReference::new("a.py", 3, "g", ReferenceKind::Implementation),
        ];
        let saved = linker.save(requirement).unwrap();
        assert_eq!(saved.code_references.len(), 2);
        assert!(saved.code_references.iter().all(|r| r.locator == "a.py:3"));
    }

    #[test]
    fn tags_attach_to_following_definition() {
        let source = "\
# Requirement: RQ-UI-001
def render(screen):
    pass

// RQ-MOTOR-002 handles faults
void Motor::stop(int code) {
}

# RQ-UI-001

def orphaned():
    pass

/* @req RQ-NET-1 */
class Socket:
";
        let hits = scan_source_for_tags(source);
        assert_eq!(
            hits,
            vec![
                TagHit {
                    requirement_id: "RQ-UI-001".into(),
                    line: 2,
                    function: "render".into()
                },
                TagHit {
                    requirement_id: "RQ-MOTOR-002".into(),
                    line: 6,
                    function: "Motor::stop".into()
                },
                TagHit {
                    requirement_id: "RQ-NET-1".into(),
                    line: 15,
                    function: "Socket".into()
                },
            ]
        );
    }

    #[test]
    fn tag_covers_every_definition_until_a_blank_line() {
        let source = "\
// @req RQ-MOTOR-002
void Motor::start(int speed);
void Motor::stop(int code);

void Motor::reset();
";
        let hits: Vec<(u32, String)> = scan_source_for_tags(source)
            .into_iter()
            .map(|h| (h.line, h.function))
            .collect();
        assert_eq!(
            hits,
            vec![(2, "Motor::start".to_string()), (3, "Motor::stop".to_string())]
        );
    }

    #[test]
    fn concurrent_links_to_one_requirement_all_land() {
        use std::sync::{Arc, Barrier};
        use std::thread;

        let (_dir, ws) = workspace();
        let ws = Arc::new(ws);
        let rounds = 50;
        for round in 0..rounds {
            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = (0..2u32)
                .map(|i| {
                    let ws = Arc::clone(&ws);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        let reference =
                            CodeReference::new("a.py", round * 2 + i + 1, "f", ReferenceKind::Implementation);
                        RequirementLinker::new(&*ws).link("RQ-UI-001", reference).unwrap()
                    })
                })
                .collect();
            for handle in handles {
                assert!(handle.join().unwrap());
            }
        }
        let refs = RequirementLinker::new(&*ws).references("RQ-UI-001").unwrap();
        assert_eq!(refs.len(), (rounds * 2) as usize);
    }

    #[test]
    fn scan_tags_links_known_ids_and_reports_unknown() {
        let (dir, ws) = workspace();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("ui.py"), "# @requirement RQ-UI-001\ndef render():\n    pass\n").unwrap();
        fs::write(src.join("net.py"), "# RQ-NET-7\ndef send():\n    pass\n").unwrap();
        let files: Vec<SourceFile> = ["src/ui.py", "src/net.py", "src/missing.py"]
            .iter()
            .map(|p| SourceFile {
                path: p.to_string(),
                fingerprint: crate::Fingerprint::of_bytes(b""),
                language: "python".into(),
            })
            .collect();

        let linker = RequirementLinker::new(&ws);
        let summary = linker.scan_tags(dir.path(), &files).unwrap();
        assert_eq!(summary.files_scanned, 2);
        assert_eq!(summary.references_added, 1);
        assert_eq!(summary.unknown_requirements, vec!["RQ-NET-7"]);

        let again = linker.scan_tags(dir.path(), &files).unwrap();
        assert_eq!(again.references_added, 0);
        let refs = linker.references("RQ-UI-001").unwrap();
        assert_eq!(refs[0].locator, "src/ui.py:2");
        assert_eq!(refs[0].function, "render");
    }
}
