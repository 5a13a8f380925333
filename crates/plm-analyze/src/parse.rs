use serde::Deserialize;

use plm_core::{FileAnalysis, FunctionInfo};

use crate::summarizer::SummarizeError;

#[derive(Deserialize, Default)]
#[serde(default)]
struct LlmFunction {
    name: String,
    line: u32,
    parameters: Vec<String>,
    #[serde(alias = "returnType")]
    return_type: Option<String>,
    description: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LlmAnalysis {
    purpose: String,
    #[serde(alias = "keyFunctionality")]
    key_functionality: Vec<String>,
    dependencies: Vec<String>,
    interfaces: Vec<String>,
    #[serde(alias = "implementationDetails")]
    implementation_details: Vec<String>,
    #[serde(alias = "potentialIssues")]
    potential_issues: Vec<String>,
    domain: Option<String>,
    functions: Vec<LlmFunction>,
}

/// Parse a summarizer reply. A JSON object anywhere in the reply wins;
/// otherwise the reply is read as blank-line separated sections.
pub fn parse_analysis(raw: &str) -> Result<FileAnalysis, SummarizeError> {
    if raw.trim().is_empty() {
        return Err(SummarizeError::EmptyResponse);
    }

    let analysis = match extract_json_object(raw).and_then(|s| serde_json::from_str::<LlmAnalysis>(s).ok()) {
        Some(parsed) => from_llm(parsed),
        None => parse_sections(raw),
    };

    if analysis.purpose.is_empty() {
        return Err(SummarizeError::Parse("reply has no purpose".to_string()));
    }
    Ok(analysis)
}

/// The outermost `{ ... }` span of the reply.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&raw[start..=end])
}

fn clean_list(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn clean_domain(domain: Option<String>) -> Option<String> {
    let domain = domain?.trim().to_string();
    match domain.to_lowercase().as_str() {
        "" | "null" | "none" | "unknown" => None,
        _ => Some(domain),
    }
}

/// Interfaces fall back to the dependencies that mention one.
fn finish(mut analysis: FileAnalysis) -> FileAnalysis {
    if analysis.interfaces.is_empty() {
        analysis.interfaces = analysis
            .dependencies
            .iter()
            .filter(|d| d.to_lowercase().contains("interface"))
            .cloned()
            .collect();
    }
    analysis
}

fn from_llm(parsed: LlmAnalysis) -> FileAnalysis {
    finish(FileAnalysis {
        purpose: parsed.purpose.trim().to_string(),
        key_functionality: clean_list(parsed.key_functionality),
        dependencies: clean_list(parsed.dependencies),
        interfaces: clean_list(parsed.interfaces),
        implementation_details: clean_list(parsed.implementation_details),
        potential_issues: clean_list(parsed.potential_issues),
        domain: clean_domain(parsed.domain),
        functions: parsed
            .functions
            .into_iter()
            .filter(|f| !f.name.trim().is_empty())
            .map(|f| FunctionInfo {
                name: f.name.trim().to_string(),
                line: f.line,
                parameters: clean_list(f.parameters),
                return_type: f.return_type.map(|r| r.trim().to_string()).filter(|r| !r.is_empty()),
                description: f.description.trim().to_string(),
            })
            .collect(),
    })
}

fn bullets(section: Option<&&str>) -> Vec<String> {
    section
        .map(|s| {
            s.lines()
                .map(str::trim)
                .filter_map(|l| l.strip_prefix('-').or_else(|| l.strip_prefix('*')))
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Sections in order: purpose, key functionality, dependencies,
/// implementation details, potential issues.
fn parse_sections(raw: &str) -> FileAnalysis {
    let sections: Vec<&str> = raw
        .split("\n\n")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    finish(FileAnalysis {
        purpose: sections.first().map(|s| s.to_string()).unwrap_or_default(),
        key_functionality: bullets(sections.get(1)),
        dependencies: bullets(sections.get(2)),
        implementation_details: bullets(sections.get(3)),
        potential_issues: bullets(sections.get(4)),
        ..FileAnalysis::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_reply_inside_a_code_fence() {
        let raw = r#"Here you go:
```json
{"purpose": " Drives the stepper motor. ", "keyFunctionality": ["step", " "],
 "dependencies": ["GPIO interface", "timer"], "domain": "motor",
 "functions": [{"name": "step", "line": 12, "parameters": ["n"], "returnType": "void"}]}
```"#;
        let analysis = parse_analysis(raw).unwrap();
        assert_eq!(analysis.purpose, "Drives the stepper motor.");
        assert_eq!(analysis.key_functionality, vec!["step"]);
        assert_eq!(analysis.interfaces, vec!["GPIO interface"]);
        assert_eq!(analysis.domain.as_deref(), Some("motor"));
        assert_eq!(analysis.functions[0].line, 12);
        assert_eq!(analysis.functions[0].return_type.as_deref(), Some("void"));
    }

    #[test]
    fn snake_case_keys_and_null_domain() {
        let raw = r#"{"purpose": "Glue", "key_functionality": ["wire"], "domain": "null"}"#;
        let analysis = parse_analysis(raw).unwrap();
        assert_eq!(analysis.key_functionality, vec!["wire"]);
        assert!(analysis.domain.is_none());
    }

    #[test]
    fn plain_text_reply_is_read_as_sections() {
        let raw = "Renders the dashboard.\n\n- draw gauges\n- handle touch\n\n- display interface\n- fonts\n\n- double buffering\n\n- no error handling";
        let analysis = parse_analysis(raw).unwrap();
        assert_eq!(analysis.purpose, "Renders the dashboard.");
        assert_eq!(analysis.key_functionality, vec!["draw gauges", "handle touch"]);
        assert_eq!(analysis.dependencies, vec!["display interface", "fonts"]);
        assert_eq!(analysis.interfaces, vec!["display interface"]);
        assert_eq!(analysis.implementation_details, vec!["double buffering"]);
        assert_eq!(analysis.potential_issues, vec!["no error handling"]);
        assert!(analysis.domain.is_none());
    }

    #[test]
    fn empty_or_purposeless_replies_fail() {
        assert!(matches!(parse_analysis("  \n"), Err(SummarizeError::EmptyResponse)));
        assert!(matches!(
            parse_analysis(r#"{"purpose": ""}"#),
            Err(SummarizeError::Parse(_))
        ));
    }
}
