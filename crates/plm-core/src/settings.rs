use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::{store::write_atomic, StoreError};

/// Per-workspace scanner settings, stored in `<workspace>/.plm/settings.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkspaceSettings {
    /// Folder under the workspace root that is scanned for sources.
    pub source_folder: String,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub respect_gitignore: bool,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            source_folder: "src".to_string(),
            include_patterns: default_include_patterns(),
            exclude_patterns: default_exclude_patterns(),
            respect_gitignore: true,
        }
    }
}

pub fn default_include_patterns() -> Vec<String> {
    [
        "**/*.py", "**/*.js", "**/*.ts", "**/*.cpp", "**/*.hpp", "**/*.h", "**/*.c", "**/*.cc",
        "**/*.cxx", "**/*.hxx", "**/*.inl",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub fn default_exclude_patterns() -> Vec<String> {
    [
        "**/node_modules/**",
        "**/__pycache__/**",
        "**/venv/**",
        "**/build/**",
        "**/dist/**",
        "**/CMakeFiles/**",
        "**/.git/**",
        "**/.vs/**",
        "**/.idea/**",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// --- AI Settings ---

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AiSettings {
    pub provider: String,
    pub api_key: String,
    pub model: String,
}

/// Resolve the user-global settings directory (~/.plm/).
pub fn global_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".plm")
}

fn ai_settings_path(dir: &Path) -> PathBuf {
    dir.join("settings.json")
}

pub fn read_ai_settings() -> AiSettings {
    read_ai_settings_in(&global_dir())
}

/// AI settings stored under `dir`; defaults when missing or unreadable.
pub fn read_ai_settings_in(dir: &Path) -> AiSettings {
    let path = ai_settings_path(dir);
    if !path.exists() {
        return AiSettings::default();
    }
    fs::read_to_string(&path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

pub fn write_ai_settings(settings: &AiSettings) -> Result<(), StoreError> {
    write_ai_settings_in(&global_dir(), settings)
}

pub fn write_ai_settings_in(dir: &Path, settings: &AiSettings) -> Result<(), StoreError> {
    let path = ai_settings_path(dir);
    let json = serde_json::to_string_pretty(settings).map_err(|e| StoreError::json(&path, e))?;
    write_atomic(&path, &json)
}

pub fn ai_configured(settings: &AiSettings) -> bool {
    !settings.provider.is_empty()
        && !settings.model.is_empty()
        && (settings.provider == "ollama" || !settings.api_key.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_settings_fill_in_defaults() {
        let settings: WorkspaceSettings =
            serde_json::from_str(r#"{"sourceFolder": "lib"}"#).unwrap();
        assert_eq!(settings.source_folder, "lib");
        assert_eq!(settings.include_patterns, default_include_patterns());
        assert!(settings.respect_gitignore);
    }

    #[test]
    fn ai_settings_round_trip_through_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join(".plm");
        assert!(!ai_configured(&read_ai_settings_in(&home)));

        let settings = AiSettings {
            provider: "anthropic".into(),
            api_key: "sk-test".into(),
            model: "claude-sonnet".into(),
        };
        write_ai_settings_in(&home, &settings).unwrap();
        let loaded = read_ai_settings_in(&home);
        assert_eq!(loaded.provider, "anthropic");
        assert!(ai_configured(&loaded));

        fs::write(home.join("settings.json"), "{oops").unwrap();
        assert!(read_ai_settings_in(&home).provider.is_empty());
    }

    #[test]
    fn ollama_needs_no_api_key() {
        let settings = AiSettings {
            provider: "ollama".into(),
            api_key: String::new(),
            model: "llama3".into(),
        };
        assert!(ai_configured(&settings));
        let missing_key = AiSettings {
            provider: "openai".into(),
            ..settings
        };
        assert!(!ai_configured(&missing_key));
    }
}
