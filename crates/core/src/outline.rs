use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Pre-compilation intermediate produced by the outline builder and judged
/// by the Quality Gate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Outline {
    #[serde(default)]
    pub metadata: serde_yaml::Value,
    #[serde(default)]
    pub classification: Classification,
    #[serde(default)]
    pub structure: Structure,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Classification {
    #[serde(default)]
    pub methodology_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Structure {
    #[serde(default)]
    pub stages: Vec<OutlineStage>,
    #[serde(default)]
    pub tools: Vec<OutlineTool>,
    #[serde(default)]
    pub indicators: Vec<OutlineIndicator>,
    #[serde(default)]
    pub rules: Vec<OutlineRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutlineStage {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Kept loose on purpose: the Gate must detect non-integer orders
    /// rather than fail the whole parse.
    #[serde(default)]
    pub order: Option<serde_yaml::Value>,
}

impl OutlineStage {
    pub fn order_as_int(&self) -> Option<i64> {
        match &self.order {
            Some(serde_yaml::Value::Number(n)) => n.as_i64(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutlineTool {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, rename = "type")]
    pub tool_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutlineIndicator {
    #[serde(default)]
    pub name: Option<String>,
    /// Legacy field; older outlines carried `title` instead of `name`.
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub formula: Option<String>,
}

impl OutlineIndicator {
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or(self.title.as_deref())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutlineRule {
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
}

impl Outline {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read outline: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse outline YAML: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self).context("Failed to serialize outline")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write outline: {}", path.display()))?;
        Ok(())
    }
}

/// Methodology classes with distinct QA expectations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodologyType {
    Diagnostic,
    Planning,
    Analysis,
    Optimization,
    Standard,
}

impl MethodologyType {
    /// Types whose indicators are expected to carry formulas.
    pub fn expects_formulas(&self) -> bool {
        matches!(
            self,
            MethodologyType::Diagnostic | MethodologyType::Analysis | MethodologyType::Optimization
        )
    }
}

impl std::fmt::Display for MethodologyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MethodologyType::Diagnostic => write!(f, "diagnostic"),
            MethodologyType::Planning => write!(f, "planning"),
            MethodologyType::Analysis => write!(f, "analysis"),
            MethodologyType::Optimization => write!(f, "optimization"),
            MethodologyType::Standard => write!(f, "standard"),
        }
    }
}

impl std::str::FromStr for MethodologyType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "diagnostic" => Ok(MethodologyType::Diagnostic),
            "planning" => Ok(MethodologyType::Planning),
            "analysis" => Ok(MethodologyType::Analysis),
            "optimization" => Ok(MethodologyType::Optimization),
            "standard" => Ok(MethodologyType::Standard),
            other => Err(format!("unknown methodology type: {other}")),
        }
    }
}

/// Rule severity vocabulary enforced by the Gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
    Info,
    Low,
}

impl Severity {
    pub const ALLOWED: &'static [&'static str] = &["critical", "warning", "info", "low"];

    pub fn is_allowed(raw: &str) -> bool {
        Self::ALLOWED.contains(&raw)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::Warning => write!(f, "warning"),
            Severity::Info => write!(f, "info"),
            Severity::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "critical" => Ok(Severity::Critical),
            "warning" => Ok(Severity::Warning),
            "info" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

pub fn is_blank(value: Option<&str>) -> bool {
    value.map(|s| s.trim().is_empty()).unwrap_or(true)
}

/// Matching key for titles and indicator names: lowercase, `ё→е`,
/// collapsed whitespace.
pub fn normalize_name(name: &str) -> String {
    let lowered = name.trim().to_lowercase().replace('ё', "е");
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_outline() {
        let yaml = r#"
classification:
  methodology_type: diagnostic
structure:
  stages:
    - title: "Assess"
      description: "Collect the baseline."
      order: 1
  indicators:
    - name: "EBITDA"
      description: "Earnings measure"
      formula: "EBITDA = revenue - opex"
  rules:
    - condition: "margin < 0.1"
      action: "flag the unit"
      severity: info
"#;
        let outline: Outline = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(outline.classification.methodology_type.as_deref(), Some("diagnostic"));
        assert_eq!(outline.structure.stages.len(), 1);
        assert_eq!(outline.structure.stages[0].order_as_int(), Some(1));
        assert_eq!(outline.structure.indicators[0].display_name(), "EBITDA");
    }

    #[test]
    fn non_integer_order_is_detected_not_fatal() {
        let yaml = r#"
structure:
  stages:
    - title: "A"
      description: "x"
      order: "first"
"#;
        let outline: Outline = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(outline.structure.stages[0].order_as_int(), None);
    }

    #[test]
    fn indicator_falls_back_to_legacy_title() {
        let ind = OutlineIndicator {
            name: None,
            title: Some("ROE".to_string()),
            description: None,
            formula: None,
        };
        assert_eq!(ind.display_name(), "ROE");
    }

    #[test]
    fn normalize_name_collapses_case_and_spaces() {
        assert_eq!(normalize_name("  Valovaya   Marzha "), "valovaya marzha");
        assert_eq!(normalize_name("Ebitda"), normalize_name("EBITDA"));
        assert_eq!(normalize_name("учёт"), "учет");
    }

    #[test]
    fn severity_parse_rejects_unknown() {
        assert!("critical".parse::<Severity>().is_ok());
        assert!("high".parse::<Severity>().is_err());
        assert!(Severity::is_allowed("low"));
        assert!(!Severity::is_allowed("medium"));
    }

    #[test]
    fn methodology_type_formula_expectations() {
        use std::str::FromStr;
        assert!(MethodologyType::from_str("diagnostic").unwrap().expects_formulas());
        assert!(!MethodologyType::from_str("planning").unwrap().expects_formulas());
        assert!(MethodologyType::from_str("weird").is_err());
    }
}
