use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    schemars, tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use plm_analyze::{engine, LlmSummarizer, Orchestrator};
use plm_core::architecture;
use plm_core::requirements::RequirementLinker;
use plm_core::settings::{self, AiSettings};
use plm_core::{
    domains, ArchitectureGraph, CodeReference, DomainConfig, DomainStore, ReferenceKind, RequirementRef,
    RequirementStore, Workspace,
};

const WORKSPACE_ENV: &str = "PLM_WORKSPACE";

const INSTRUCTIONS: &str = "PLM analyzes a source tree and keeps an architecture graph in sync with it.\n\n\
Workflow:\n\
1. scan_sources to see which files the workspace settings select.\n\
2. start_analysis, then poll get_progress until status is completed or error. \
Unchanged files are served from the cache and cost nothing.\n\
3. recommend_domains to compare the domains reported by the analysis with the configured ones. \
If changesDetected is true, apply_domain_recommendations or edit them with set_domains.\n\
4. generate_architecture to rebuild the block graph. Manual edits and positions saved with \
save_layout survive regeneration.\n\
5. Link requirements to code with link_code, or scan_requirement_tags to pick up RQ- tags in comments.";

// --- Request types ---

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct StartAnalysisRequest {
    /// Workspace-relative paths to analyze (e.g. "src/ui/display.cpp"). Omit to analyze every scanned file.
    files: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct GetResultsRequest {
    /// Workspace-relative path of one file. Omit to get every cached analysis.
    path: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct SetDomainsRequest {
    /// The complete domain configuration as a JSON string: [{id, name, description, subdomainIds}]
    domains: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct SaveLayoutRequest {
    /// The complete architecture graph as a JSON string, as returned by generate_architecture. Blocks with a position are pinned.
    graph: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct SetRequirementRequest {
    /// The requirement as a JSON string: {id, domain, description, linkedBlocks, codeReferences}
    requirement: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct LinkCodeRequest {
    /// Requirement id (e.g. "RQ-UI-001")
    requirement_id: String,
    /// Workspace-relative file path
    file: String,
    /// 1-based line number
    line: u32,
    /// Function or type name at that line
    function: String,
    /// "implementation" (default) or "test"
    kind: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct UnlinkCodeRequest {
    requirement_id: String,
    file: String,
    line: u32,
    function: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct ConfigureAiRequest {
    /// openai, anthropic, google, ollama, groq, mistral or deepseek
    provider: String,
    /// Model name passed to the provider
    model: String,
    /// API key. Omit to keep the stored key; ollama needs none.
    api_key: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct RequirementsForFileRequest {
    /// Workspace-relative file path
    file: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ScannedFile<'a> {
    path: &'a str,
    language: &'a str,
    hash: &'a str,
    size: u64,
}

fn json_result<T: Serialize + ?Sized>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("Serialization error: {}", e));
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

fn error_result(message: impl Into<String>) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::error(vec![Content::text(message.into())]))
}

fn parse_kind(kind: Option<&str>) -> Result<ReferenceKind, String> {
    match kind.map(str::to_lowercase).as_deref() {
        None | Some("implementation") => Ok(ReferenceKind::Implementation),
        Some("test") => Ok(ReferenceKind::Test),
        Some(other) => Err(format!("Unknown reference kind '{}': use implementation or test", other)),
    }
}

fn check_domain_ids(domains: &[DomainConfig]) -> Result<(), String> {
    let mut seen = HashSet::new();
    for domain in domains {
        if domain.id.trim().is_empty() {
            return Err("Domain ids must not be empty".to_string());
        }
        if !seen.insert(domain.id.as_str()) {
            return Err(format!("Duplicate domain id '{}'", domain.id));
        }
    }
    Ok(())
}

// --- Server ---

#[derive(Clone)]
pub struct PlmServer {
    tool_router: ToolRouter<Self>,
    workspace: Arc<Workspace>,
    orchestrator: Orchestrator,
}

#[tool_router]
impl PlmServer {
    pub fn new(workspace: Arc<Workspace>, orchestrator: Orchestrator) -> Self {
        Self {
            tool_router: Self::tool_router(),
            workspace,
            orchestrator,
        }
    }

    pub fn open(root: PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let workspace = Arc::new(Workspace::open(root)?);
        let orchestrator = Orchestrator::open(Arc::clone(&workspace), Arc::new(LlmSummarizer::from_global_settings()))?;
        Ok(Self::new(workspace, orchestrator))
    }

    #[tool(
        description = "List the source files selected by the workspace settings (.plm/settings.json: sourceFolder, includePatterns, excludePatterns). Returns [{path, language, hash, size}] sorted by path."
    )]
    fn scan_sources(&self) -> Result<CallToolResult, McpError> {
        match self.orchestrator.scan() {
            Ok(files) => {
                let listed: Vec<ScannedFile> = files
                    .iter()
                    .map(|f| ScannedFile {
                        path: &f.path,
                        language: &f.language,
                        hash: &f.fingerprint.hash,
                        size: f.fingerprint.size,
                    })
                    .collect();
                json_result(&listed)
            }
            Err(e) => error_result(e.to_string()),
        }
    }

    #[tool(
        description = "Start an analysis job in the background. Files whose content is unchanged since the last run are served from the cache without calling the LLM. Rejected while another job is running. Poll get_progress for status."
    )]
    fn start_analysis(&self, Parameters(req): Parameters<StartAnalysisRequest>) -> Result<CallToolResult, McpError> {
        match self.orchestrator.start(req.files) {
            Ok(_handle) => {
                let job = self.orchestrator.progress();
                Ok(CallToolResult::success(vec![Content::text(format!(
                    "Analysis started for {} files. Poll get_progress for status.",
                    job.total_files
                ))]))
            }
            Err(e) => error_result(e.to_string()),
        }
    }

    #[tool(
        description = "Progress of the current or last analysis job: {totalFiles, analyzedFiles, currentFile, status (idle|running|completed|error), errorMessage, failures: [{path, message}], fraction}."
    )]
    fn get_progress(&self) -> Result<CallToolResult, McpError> {
        let job = self.orchestrator.progress();
        let mut value = serde_json::to_value(&job).unwrap_or_default();
        if let Some(obj) = value.as_object_mut() {
            obj.insert("fraction".to_string(), serde_json::json!(job.progress()));
        }
        json_result(&value)
    }

    #[tool(
        description = "Cached per-file analyses: {path: {purpose, keyFunctionality, dependencies, interfaces, implementationDetails, potentialIssues, domain?, functions?}}. Pass path to get a single file."
    )]
    fn get_results(&self, Parameters(req): Parameters<GetResultsRequest>) -> Result<CallToolResult, McpError> {
        let results = self.orchestrator.results();
        match req.path {
            None => json_result(&results),
            Some(path) => match results.get(&path) {
                Some(analysis) => json_result(analysis),
                None => error_result(format!("No analysis cached for '{}'", path)),
            },
        }
    }

    #[tool(
        description = "Group cached analyses by reported domain and compare with the configured domains. Returns {recommendations: [{domainId, name, description, subdomainIds, confidence, matchingFiles, reasoning}], changesDetected}."
    )]
    fn recommend_domains(&self) -> Result<CallToolResult, McpError> {
        match self.workspace.load_domains() {
            Ok(current) => json_result(&domains::recommend(&self.orchestrator.results(), &current)),
            Err(e) => error_result(e.to_string()),
        }
    }

    #[tool(
        description = "Merge the current domain recommendations into the configured domains and save them. Existing names and descriptions are kept. Returns the new configuration."
    )]
    fn apply_domain_recommendations(&self) -> Result<CallToolResult, McpError> {
        let current = match self.workspace.load_domains() {
            Ok(c) => c,
            Err(e) => return error_result(e.to_string()),
        };
        let recs = domains::recommend(&self.orchestrator.results(), &current);
        let merged = domains::apply(&current, &recs.recommendations);
        match self.workspace.save_domains(&merged) {
            Ok(()) => {
                info!("applied {} domain recommendations", recs.recommendations.len());
                json_result(&merged)
            }
            Err(e) => error_result(e.to_string()),
        }
    }

    #[tool(description = "Get the configured domains: [{id, name, description, subdomainIds}].")]
    fn get_domains(&self) -> Result<CallToolResult, McpError> {
        match self.workspace.load_domains() {
            Ok(domains) => json_result(&domains),
            Err(e) => error_result(e.to_string()),
        }
    }

    #[tool(description = "Replace the domain configuration. Ids must be unique.")]
    fn set_domains(&self, Parameters(req): Parameters<SetDomainsRequest>) -> Result<CallToolResult, McpError> {
        let domains: Vec<DomainConfig> = match serde_json::from_str(&req.domains) {
            Ok(d) => d,
            Err(e) => return error_result(format!("Invalid domains JSON: {}", e)),
        };
        if let Err(e) = check_domain_ids(&domains) {
            return error_result(e);
        }
        match self.workspace.save_domains(&domains) {
            Ok(()) => Ok(CallToolResult::success(vec![Content::text(format!(
                "Saved {} domains",
                domains.len()
            ))])),
            Err(e) => error_result(e.to_string()),
        }
    }

    #[tool(
        description = "Rebuild the architecture graph from the configured domains and requirement links, merge it into the saved graph and lay it out. Returns {rootId, blocks: {id: {id, name, domain?, description, requirements, children, position?}}, crossEdges, layout: {id: {x, y}}}. The saved graph is untouched on a structural error."
    )]
    fn generate_architecture(&self) -> Result<CallToolResult, McpError> {
        match architecture::regenerate(&*self.workspace) {
            Ok(graph) => json_result(&graph),
            Err(e) => error_result(e.to_string()),
        }
    }

    #[tool(
        description = "Save an edited architecture graph. Set a block's position to pin it; pinned blocks keep their coordinates across regeneration. Rejected if the structural edges contain a cycle or a block with two parents."
    )]
    fn save_layout(&self, Parameters(req): Parameters<SaveLayoutRequest>) -> Result<CallToolResult, McpError> {
        let graph: ArchitectureGraph = match serde_json::from_str(&req.graph) {
            Ok(g) => g,
            Err(e) => return error_result(format!("Invalid graph JSON: {}", e)),
        };
        match architecture::save_layout(&*self.workspace, graph) {
            Ok(saved) => json_result(&saved),
            Err(e) => error_result(e.to_string()),
        }
    }

    #[tool(
        description = "Show the global AI settings used by the summarizer (~/.plm/settings.json): {provider, model, hasApiKey, configured}. The key itself is never returned."
    )]
    fn get_ai_settings(&self) -> Result<CallToolResult, McpError> {
        let current = settings::read_ai_settings();
        json_result(&serde_json::json!({
            "provider": current.provider,
            "model": current.model,
            "hasApiKey": !current.api_key.is_empty(),
            "configured": settings::ai_configured(&current),
        }))
    }

    #[tool(
        description = "Set the global AI provider and model used to summarize files. Takes effect on the next analyzed file."
    )]
    fn configure_ai(&self, Parameters(req): Parameters<ConfigureAiRequest>) -> Result<CallToolResult, McpError> {
        let provider = req.provider.trim().to_lowercase();
        if !engine::supported_provider(&provider) {
            return error_result(format!("Unsupported provider '{}'", req.provider));
        }
        let current = settings::read_ai_settings();
        let next = AiSettings {
            provider,
            model: req.model.trim().to_string(),
            api_key: req.api_key.unwrap_or(current.api_key),
        };
        if !settings::ai_configured(&next) {
            return error_result("Model is required, and every provider except ollama needs an API key");
        }
        match settings::write_ai_settings(&next) {
            Ok(()) => {
                info!("AI provider set to {} ({})", next.provider, next.model);
                Ok(CallToolResult::success(vec![Content::text(format!(
                    "Using {} with model {}",
                    next.provider, next.model
                ))]))
            }
            Err(e) => error_result(e.to_string()),
        }
    }

    #[tool(description = "List every requirement with its linked blocks and code references.")]
    fn list_requirements(&self) -> Result<CallToolResult, McpError> {
        match self.workspace.list_requirements() {
            Ok(requirements) => json_result(&requirements),
            Err(e) => error_result(e.to_string()),
        }
    }

    #[tool(description = "Create or replace a requirement. Duplicate code references are collapsed.")]
    fn set_requirement(&self, Parameters(req): Parameters<SetRequirementRequest>) -> Result<CallToolResult, McpError> {
        let requirement: RequirementRef = match serde_json::from_str(&req.requirement) {
            Ok(r) => r,
            Err(e) => return error_result(format!("Invalid requirement JSON: {}", e)),
        };
        if requirement.id.trim().is_empty() {
            return error_result("Requirement id must not be empty");
        }
        match RequirementLinker::new(&*self.workspace).save(requirement) {
            Ok(saved) => json_result(&saved),
            Err(e) => error_result(e.to_string()),
        }
    }

    #[tool(
        description = "Attach a code reference to a requirement. Returns the reference's locator (file:line). Linking the same file, line and function twice is a no-op."
    )]
    fn link_code(&self, Parameters(req): Parameters<LinkCodeRequest>) -> Result<CallToolResult, McpError> {
        let kind = match parse_kind(req.kind.as_deref()) {
            Ok(k) => k,
            Err(e) => return error_result(e),
        };
        let reference = CodeReference::new(req.file, req.line, req.function, kind);
        let locator = reference.locator.clone();
        match RequirementLinker::new(&*self.workspace).link(&req.requirement_id, reference) {
            Ok(true) => Ok(CallToolResult::success(vec![Content::text(format!(
                "Linked {} to {}",
                req.requirement_id, locator
            ))])),
            Ok(false) => Ok(CallToolResult::success(vec![Content::text(format!(
                "{} already links {}",
                req.requirement_id, locator
            ))])),
            Err(e) => error_result(e.to_string()),
        }
    }

    #[tool(description = "Remove a code reference from a requirement.")]
    fn unlink_code(&self, Parameters(req): Parameters<UnlinkCodeRequest>) -> Result<CallToolResult, McpError> {
        match RequirementLinker::new(&*self.workspace).unlink(&req.requirement_id, &req.file, req.line, &req.function) {
            Ok(true) => Ok(CallToolResult::success(vec![Content::text(format!(
                "Unlinked {}:{} from {}",
                req.file, req.line, req.requirement_id
            ))])),
            Ok(false) => error_result(format!(
                "{} has no reference to {}:{} ({})",
                req.requirement_id, req.file, req.line, req.function
            )),
            Err(e) => error_result(e.to_string()),
        }
    }

    #[tool(description = "List the requirements that reference a given file.")]
    fn requirements_for_file(
        &self,
        Parameters(req): Parameters<RequirementsForFileRequest>,
    ) -> Result<CallToolResult, McpError> {
        match RequirementLinker::new(&*self.workspace).requirements_for_file(&req.file) {
            Ok(requirements) => json_result(&requirements),
            Err(e) => error_result(e.to_string()),
        }
    }

    #[tool(
        description = "Scan the selected source files for requirement tags (e.g. \"# Requirement: RQ-UI-001\", \"// @req RQ-MOTOR-002\") and link each tag to the function or type defined after it. Existing references are kept. Returns {filesScanned, referencesAdded, unknownRequirements}."
    )]
    fn scan_requirement_tags(&self) -> Result<CallToolResult, McpError> {
        let files = match self.orchestrator.scan() {
            Ok(f) => f,
            Err(e) => return error_result(e.to_string()),
        };
        match RequirementLinker::new(&*self.workspace).scan_tags(self.workspace.root(), &files) {
            Ok(summary) => json_result(&serde_json::json!({
                "filesScanned": summary.files_scanned,
                "referencesAdded": summary.references_added,
                "unknownRequirements": summary.unknown_requirements,
            })),
            Err(e) => error_result(e.to_string()),
        }
    }
}

#[tool_handler]
impl ServerHandler for PlmServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(INSTRUCTIONS.into()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

fn workspace_root() -> std::io::Result<PathBuf> {
    if let Some(arg) = std::env::args().nth(1) {
        return Ok(PathBuf::from(arg));
    }
    match std::env::var_os(WORKSPACE_ENV) {
        Some(root) if !root.is_empty() => Ok(PathBuf::from(root)),
        _ => std::env::current_dir(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_ansi(false))
        .init();

    let root = workspace_root()?;
    info!("serving workspace {}", root.display());

    let service = PlmServer::open(root)?
        .serve(rmcp::transport::io::stdio())
        .await
        .inspect_err(|e| error!("MCP server error: {}", e))?;
    service.waiting().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn server() -> (tempfile::TempDir, PlmServer) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/a.py"), "# RQ-UI-001\ndef render():\n    pass\n").unwrap();
        let server = PlmServer::open(dir.path().to_path_buf()).unwrap();
        (dir, server)
    }

    fn is_error(result: &CallToolResult) -> bool {
        result.is_error == Some(true)
    }

    #[test]
    fn reference_kinds_parse() {
        assert_eq!(parse_kind(None), Ok(ReferenceKind::Implementation));
        assert_eq!(parse_kind(Some("Test")), Ok(ReferenceKind::Test));
        assert!(parse_kind(Some("doc")).is_err());
    }

    #[test]
    fn duplicate_domain_ids_are_rejected() {
        let (_dir, server) = server();
        let result = server
            .set_domains(Parameters(SetDomainsRequest {
                domains: r#"[{"id": "ui", "name": "UI"}, {"id": "ui", "name": "Again"}]"#.into(),
            }))
            .unwrap();
        assert!(is_error(&result));
        assert!(server.workspace.load_domains().unwrap().is_empty());
    }

    #[test]
    fn link_code_requires_a_known_requirement() {
        let (_dir, server) = server();
        let request = || LinkCodeRequest {
            requirement_id: "RQ-UI-001".into(),
            file: "src/a.py".into(),
            line: 2,
            function: "render".into(),
            kind: None,
        };
        assert!(is_error(&server.link_code(Parameters(request())).unwrap()));

        server
            .workspace
            .put_requirement(&RequirementRef::new("RQ-UI-001", "ui", "Show speed"))
            .unwrap();
        assert!(!is_error(&server.link_code(Parameters(request())).unwrap()));
        let linked = server.workspace.get_requirement("RQ-UI-001").unwrap().unwrap();
        assert_eq!(linked.code_references[0].locator, "src/a.py:2");
    }

    #[test]
    fn generate_architecture_with_no_domains_is_just_the_root() {
        let (_dir, server) = server();
        assert!(!is_error(&server.generate_architecture().unwrap()));
        let graph = plm_core::GraphStore::load_graph(&*server.workspace).unwrap().unwrap();
        assert_eq!(graph.blocks.len(), 1);
    }

    #[tokio::test]
    async fn start_analysis_rejects_unknown_files() {
        let (_dir, server) = server();
        let result = server
            .start_analysis(Parameters(StartAnalysisRequest {
                files: Some(vec!["src/missing.py".into()]),
            }))
            .unwrap();
        assert!(is_error(&result));
    }
}
