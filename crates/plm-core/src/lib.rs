pub mod architecture;
pub mod cache;
pub mod domains;
mod error;
pub mod fingerprint;
pub mod layout;
pub mod requirements;
pub mod scanner;
pub mod settings;
pub mod store;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use error::StoreError;
pub use fingerprint::Fingerprint;
pub use store::{DomainStore, GraphStore, RequirementStore, Workspace};

// --- Source files and per-file analysis ---

/// A file selected by the scanner. `path` is relative to the workspace root
/// and always uses `/` separators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceFile {
    pub path: String,
    pub fingerprint: Fingerprint,
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionInfo {
    pub name: String,
    #[serde(default)]
    pub line: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
    #[serde(default)]
    pub description: String,
}

/// Structured summary of one source file. Produced once per fingerprint and
/// replaced wholesale when the file changes.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileAnalysis {
    pub purpose: String,
    #[serde(default)]
    pub key_functionality: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub implementation_details: Vec<String>,
    #[serde(default)]
    pub potential_issues: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<FunctionInfo>,
}

// --- Domains ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub subdomain_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainRecommendation {
    pub domain_id: String,
    pub name: String,
    pub description: String,
    pub subdomain_ids: Vec<String>,
    /// Always within `[0, 1]`.
    pub confidence: f64,
    pub matching_files: Vec<String>,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainRecommendations {
    pub recommendations: Vec<DomainRecommendation>,
    pub changes_detected: bool,
}

// --- Architecture graph ---

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArchitectureBlock {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    /// Structural children, in display order.
    #[serde(default)]
    pub children: Vec<String>,
    /// Position pinned by the user. Layout never overwrites it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl ArchitectureBlock {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            domain: None,
            description: String::new(),
            requirements: Vec::new(),
            children: Vec::new(),
            position: None,
        }
    }
}

/// Non-structural edge between two blocks that share a requirement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrossEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub requirement_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArchitectureGraph {
    pub root_id: String,
    pub blocks: BTreeMap<String, ArchitectureBlock>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cross_edges: Vec<CrossEdge>,
    /// Effective coordinates of every block after the last layout pass.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub layout: BTreeMap<String, Position>,
}

impl ArchitectureGraph {
    pub fn root(&self) -> Option<&ArchitectureBlock> {
        self.blocks.get(&self.root_id)
    }

    /// Id of the first block listing `id` as a structural child.
    pub fn parent_of(&self, id: &str) -> Option<&str> {
        self.blocks
            .values()
            .find(|b| b.children.iter().any(|c| c == id))
            .map(|b| b.id.as_str())
    }
}

// --- Requirements ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceKind {
    #[default]
    Implementation,
    Test,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CodeReference {
    pub file: String,
    pub line: u32,
    #[serde(default)]
    pub function: String,
    #[serde(rename = "type", default)]
    pub kind: ReferenceKind,
    /// `file:line`, consumed by editor integrations.
    #[serde(default)]
    pub locator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequirementRef {
    pub id: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub linked_blocks: Vec<String>,
    #[serde(default)]
    pub code_references: Vec<CodeReference>,
}

impl RequirementRef {
    pub fn new(id: impl Into<String>, domain: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            domain: domain.into(),
            description: description.into(),
            linked_blocks: Vec::new(),
            code_references: Vec::new(),
        }
    }
}

/// Map a file extension to the language tag handed to the summarizer.
pub fn language_for_path(path: &str) -> &'static str {
    let ext = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "py" => "python",
        "js" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "cpp" | "hpp" | "cc" | "cxx" | "hxx" | "h" | "inl" => "c++",
        "c" => "c",
        "java" => "java",
        "cs" => "c#",
        "go" => "go",
        "rs" => "rust",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "kt" => "kotlin",
        _ => "unknown",
    }
}
