pub mod llm;
pub mod prechecks;
pub mod report;

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::glossary;
use crate::layout::Layout;
use finkb_llm::ChatClient;

/// Built-in copy of the compiled-methodology schema, used when the repo
/// file is absent (mirrors the compiler's template fallback).
const EMBEDDED_SCHEMA: &str =
    include_str!("../../../../schemas/methodology_compiled.schema.json");

pub const PROMPT_VERSION: &str = "v1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueSeverity {
    #[serde(rename = "BLOCKER")]
    Blocker,
    #[serde(rename = "MAJOR")]
    Major,
    #[serde(rename = "MINOR")]
    Minor,
}

impl std::str::FromStr for IssueSeverity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "BLOCKER" => Ok(IssueSeverity::Blocker),
            "MAJOR" => Ok(IssueSeverity::Major),
            "MINOR" => Ok(IssueSeverity::Minor),
            other => Err(format!("unknown issue severity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub severity: IssueSeverity,
    pub category: String,
    pub message: String,
    pub evidence: Value,
    #[serde(default)]
    pub fix_hint: String,
}

impl Issue {
    pub fn new(
        id: impl Into<String>,
        severity: IssueSeverity,
        category: &str,
        message: impl Into<String>,
        evidence: Value,
        fix_hint: &str,
    ) -> Self {
        Self {
            id: id.into(),
            severity,
            category: category.to_string(),
            message: message.into(),
            evidence,
            fix_hint: fix_hint.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReviewOptions {
    pub use_llm: bool,
    pub glossary_dir: Option<PathBuf>,
    pub schema_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaSummary {
    pub blockers: usize,
    pub majors: usize,
    pub minors: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaMetrics {
    pub schema_valid: bool,
    pub glossary_coverage: f64,
    pub formula_checks_passed: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmFindings {
    pub enabled: bool,
    pub issues_found: usize,
    pub strengths_found: usize,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewerInfo {
    pub agent: String,
    pub model: String,
    pub prompt_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaResult {
    pub book_id: String,
    pub approved: bool,
    pub score: u32,
    pub summary: QaSummary,
    pub issues: Vec<Issue>,
    pub metrics: QaMetrics,
    pub llm_findings: LlmFindings,
    pub generated_at: String,
    pub reviewer: ReviewerInfo,
}

impl QaResult {
    pub fn exit_code(&self) -> i32 {
        if self.approved {
            0
        } else {
            1
        }
    }
}

fn count_severity(issues: &[Issue], severity: IssueSeverity) -> usize {
    issues.iter().filter(|i| i.severity == severity).count()
}

/// Score starts at 100: −40 for an invalid schema, −25/−10/−3 per
/// BLOCKER/MAJOR/MINOR, soft penalties for glossary and formula coverage.
pub fn compute_score(
    issues: &[Issue],
    glossary_coverage: f64,
    formula_ratio: f64,
    schema_ok: bool,
) -> u32 {
    let mut score: i64 = 100;
    if !schema_ok {
        score -= 40;
    }
    for issue in issues {
        score -= match issue.severity {
            IssueSeverity::Blocker => 25,
            IssueSeverity::Major => 10,
            IssueSeverity::Minor => 3,
        };
    }
    score -= ((1.0 - glossary_coverage) * 20.0) as i64;
    score -= ((1.0 - formula_ratio) * 15.0) as i64;
    score.clamp(0, 100) as u32
}

/// `approved = no blockers ∧ fewer than three majors`.
pub fn decide(issues: &[Issue]) -> bool {
    count_severity(issues, IssueSeverity::Blocker) == 0
        && count_severity(issues, IssueSeverity::Major) < 3
}

fn load_yaml_value(path: &std::path::Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn load_schema(layout: &Layout, options: &ReviewOptions) -> Result<Value> {
    let path = options
        .schema_path
        .clone()
        .unwrap_or_else(|| layout.compiled_schema_path());
    if path.exists() {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read schema {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse schema {}", path.display()))
    } else {
        serde_json::from_str(EMBEDDED_SCHEMA).context("Embedded schema is invalid")
    }
}

/// Run the hybrid review: deterministic prechecks always, the reasoning
/// layer only when enabled and a chat client is supplied. Writes
/// `qa_result.json`, `qa_report.md` and `approved.flag` under
/// `work/<id>/qa/`.
pub async fn validate_methodology(
    layout: &Layout,
    book_id: &str,
    options: &ReviewOptions,
    chat: Option<&dyn ChatClient>,
) -> Result<QaResult> {
    let compiled_path = layout.methodology_yaml_path(book_id);
    let schema = load_schema(layout, options)?;

    let mut issues: Vec<Issue> = Vec::new();
    let mut strengths: Vec<String> = Vec::new();

    // Layer 1 starts with the schema; everything else degrades gracefully
    // so one broken artifact still yields a complete report.
    let schema_issues = prechecks::precheck_schema(&compiled_path, &schema);
    let schema_ok = !schema_issues
        .iter()
        .any(|i| i.severity == IssueSeverity::Blocker);
    issues.extend(schema_issues);

    let compiled: Option<Value> = if compiled_path.exists() {
        match load_yaml_value(&compiled_path) {
            Ok(v) => Some(v),
            Err(e) => {
                issues.push(Issue::new(
                    "RUNTIME-001",
                    IssueSeverity::Blocker,
                    "runtime",
                    format!("Failed to parse compiled YAML: {e}"),
                    json!({"path": compiled_path.display().to_string()}),
                    "Fix YAML syntax or regenerate with the compiler.",
                ));
                None
            }
        }
    } else {
        None
    };

    let outline: Value = match layout.find_outline(book_id) {
        Ok(path) => match load_yaml_value(&path) {
            Ok(v) => v,
            Err(e) => {
                issues.push(Issue::new(
                    "FILES-OUTLINE-002",
                    IssueSeverity::Blocker,
                    "files",
                    format!("Failed to parse outline YAML: {e}"),
                    json!({"path": path.display().to_string()}),
                    "Fix outline syntax or rebuild it.",
                ));
                Value::Null
            }
        },
        Err(_) => {
            issues.push(Issue::new(
                "FILES-OUTLINE-001",
                IssueSeverity::Blocker,
                "files",
                "Outline YAML not found (outline builder output missing).",
                json!({"path": layout.work_dir(book_id).display().to_string()}),
                "Run the outline builder to produce work/<id>/outline_<id>.yaml",
            ));
            Value::Null
        }
    };

    let mut glossary_coverage = 1.0;
    let mut formula_ratio = 1.0;

    if let Some(compiled) = &compiled {
        issues.extend(prechecks::precheck_ids(compiled));
        issues.extend(prechecks::precheck_docs_consistency(layout, book_id, compiled));
        issues.extend(prechecks::precheck_duplicate_indicators(compiled));
        issues.extend(prechecks::precheck_stage_order(compiled));
        issues.extend(prechecks::precheck_duplicate_stage_titles(compiled));
        issues.extend(prechecks::precheck_readme_coverage(layout, book_id, compiled));

        let glossary_terms: Option<HashSet<String>> = options
            .glossary_dir
            .as_ref()
            .map(|dir| glossary::load_term_index(dir))
            .transpose()?;
        let (gloss_issues, coverage) =
            prechecks::precheck_glossary(compiled, glossary_terms.as_ref());
        issues.extend(gloss_issues);
        glossary_coverage = coverage;

        let (formula_issues, ratio) = prechecks::precheck_formulas(compiled);
        issues.extend(formula_issues);
        formula_ratio = ratio;

        issues.extend(prechecks::precheck_empty_formulas(compiled, 0.7));
    }

    // Layer 2: optional reasoning pass; failures never block the verdict.
    let mut llm_issue_count = 0;
    let mut llm_strength_count = 0;
    let llm_enabled = options.use_llm && chat.is_some();
    if let (true, Some(chat)) = (options.use_llm, chat) {
        let readme = std::fs::read_to_string(
            layout.methodology_docs_dir(book_id).join("README.md"),
        )
        .unwrap_or_default();
        let (llm_issues, llm_strengths) = llm::review(
            chat,
            compiled.as_ref().unwrap_or(&Value::Null),
            &outline,
            &readme,
        )
        .await;
        llm_issue_count = llm_issues.len();
        llm_strength_count = llm_strengths.len();
        issues.extend(llm_issues);
        strengths.extend(llm_strengths);
    }

    let approved = decide(&issues);
    let score = compute_score(&issues, glossary_coverage, formula_ratio, schema_ok);

    let result = QaResult {
        book_id: book_id.to_string(),
        approved,
        score,
        summary: QaSummary {
            blockers: count_severity(&issues, IssueSeverity::Blocker),
            majors: count_severity(&issues, IssueSeverity::Major),
            minors: count_severity(&issues, IssueSeverity::Minor),
        },
        issues,
        metrics: QaMetrics {
            schema_valid: schema_ok,
            glossary_coverage,
            formula_checks_passed: formula_ratio,
        },
        llm_findings: LlmFindings {
            enabled: llm_enabled,
            issues_found: llm_issue_count,
            strengths_found: llm_strength_count,
            model: llm_enabled.then(|| chat.map(|c| c.name().to_string()).unwrap_or_default()),
        },
        generated_at: chrono::Utc::now().to_rfc3339(),
        reviewer: ReviewerInfo {
            agent: "qa-reviewer".to_string(),
            model: if llm_enabled {
                chat.map(|c| c.name().to_string()).unwrap_or_default()
            } else {
                "none (precheck-only)".to_string()
            },
            prompt_version: PROMPT_VERSION.to_string(),
        },
    };

    write_outputs(layout, book_id, &result, &strengths)?;
    Ok(result)
}

fn write_outputs(
    layout: &Layout,
    book_id: &str,
    result: &QaResult,
    strengths: &[String],
) -> Result<()> {
    let qa_dir = layout.qa_work_dir(book_id);
    std::fs::create_dir_all(&qa_dir)?;

    let json = serde_json::to_string_pretty(result).context("Failed to serialize QA result")?;
    std::fs::write(layout.qa_result_path(book_id), json)?;

    let md = report::render_qa_report(book_id, result, strengths);
    std::fs::write(layout.qa_report_path(book_id), md)?;

    std::fs::write(
        layout.approved_flag_path(book_id),
        if result.approved { "true" } else { "false" },
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(severity: IssueSeverity) -> Issue {
        Issue::new("T-001", severity, "test", "msg", Value::Null, "")
    }

    #[test]
    fn decision_blocks_on_any_blocker() {
        assert!(!decide(&[issue(IssueSeverity::Blocker)]));
        assert!(decide(&[issue(IssueSeverity::Minor)]));
    }

    #[test]
    fn decision_blocks_on_three_majors() {
        let majors = vec![
            issue(IssueSeverity::Major),
            issue(IssueSeverity::Major),
            issue(IssueSeverity::Major),
        ];
        assert!(!decide(&majors));
        assert!(decide(&majors[..2]));
    }

    #[test]
    fn score_applies_penalties_and_clamps() {
        assert_eq!(compute_score(&[], 1.0, 1.0, true), 100);
        assert_eq!(compute_score(&[issue(IssueSeverity::Blocker)], 1.0, 1.0, true), 75);
        assert_eq!(compute_score(&[issue(IssueSeverity::Major)], 1.0, 1.0, true), 90);
        assert_eq!(compute_score(&[issue(IssueSeverity::Minor)], 1.0, 1.0, true), 97);
        assert_eq!(compute_score(&[], 0.5, 1.0, true), 90);
        assert_eq!(compute_score(&[], 1.0, 0.0, false), 45);
        let many: Vec<Issue> = (0..10).map(|_| issue(IssueSeverity::Blocker)).collect();
        assert_eq!(compute_score(&many, 0.0, 0.0, false), 0);
    }

    #[test]
    fn issue_severity_serializes_uppercase() {
        let json = serde_json::to_string(&IssueSeverity::Blocker).unwrap();
        assert_eq!(json, "\"BLOCKER\"");
        let parsed: IssueSeverity = "major".parse().unwrap();
        assert_eq!(parsed, IssueSeverity::Major);
    }
}
