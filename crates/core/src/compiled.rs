use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Post-normalization canonical form with stable IDs. This is the machine
/// layer consumed by the QA reviewer and the graph publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledMethodology {
    pub metadata: CompiledMetadata,
    pub classification: CompiledClassification,
    pub structure: CompiledStructure,
    /// Filled by the semantic linker after compilation; absent on a fresh
    /// compile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glossary_references: Option<GlossaryReferences>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlossaryReferences {
    #[serde(default)]
    pub found_terms: Vec<FoundTerm>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoundTerm {
    pub term_id: String,
    /// Entity the term was found in (`stage_001`, `ind_002`, ...); absent
    /// means the methodology as a whole.
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub term_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledMetadata {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub source: CompiledSource,
    #[serde(default)]
    pub outline_metadata: serde_yaml::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledSource {
    pub work_outline: String,
    #[serde(default)]
    pub sources_metadata: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledClassification {
    pub methodology_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompiledStructure {
    #[serde(default)]
    pub stages: Vec<CompiledStage>,
    #[serde(default)]
    pub tools: Vec<CompiledTool>,
    #[serde(default)]
    pub indicators: Vec<CompiledIndicator>,
    #[serde(default)]
    pub rules: Vec<CompiledRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledStage {
    pub id: String,
    pub title: String,
    pub description: String,
    /// Source order value; kept verbatim so downstream checks can spot
    /// renumbering.
    #[serde(default)]
    pub order: Option<i64>,
    pub order_display: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledTool {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledIndicator {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Trimmed formula text, empty when the source carried none.
    pub formula: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledRule {
    pub id: String,
    pub condition: String,
    pub action: String,
    pub severity: String,
}

/// Closed tool vocabulary. The compiler folds aliases into it and anything
/// unrecognized lands in `other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolType {
    Table,
    Template,
    Checklist,
    Calculator,
    Document,
    Chart,
    Other,
}

impl ToolType {
    pub fn normalize(raw: Option<&str>) -> ToolType {
        match raw.map(|s| s.trim().to_lowercase()).as_deref() {
            Some("table") => ToolType::Table,
            Some("template") => ToolType::Template,
            Some("checklist") => ToolType::Checklist,
            Some("calculator") => ToolType::Calculator,
            Some("document") => ToolType::Document,
            Some("chart") | Some("graph") => ToolType::Chart,
            _ => ToolType::Other,
        }
    }
}

impl std::fmt::Display for ToolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolType::Table => write!(f, "table"),
            ToolType::Template => write!(f, "template"),
            ToolType::Checklist => write!(f, "checklist"),
            ToolType::Calculator => write!(f, "calculator"),
            ToolType::Document => write!(f, "document"),
            ToolType::Chart => write!(f, "chart"),
            ToolType::Other => write!(f, "other"),
        }
    }
}

/// `stage_001`-style stable entity id from a 1-based position.
pub fn stable_id(prefix: &str, index: usize) -> String {
    format!("{prefix}_{index:03}")
}

impl CompiledMethodology {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read compiled YAML: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse compiled YAML: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            serde_yaml::to_string(self).context("Failed to serialize compiled methodology")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write compiled YAML: {}", path.display()))?;
        Ok(())
    }
}
