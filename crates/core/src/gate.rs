use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::outline::{is_blank, normalize_name, Outline, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateStatus {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateStatus::Pass => write!(f, "PASS"),
            GateStatus::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateMetrics {
    pub n_stages: usize,
    pub empty_stage_desc_ratio: Option<f64>,
    pub order_ok: Option<bool>,
    pub n_indicators: usize,
    pub empty_indicator_desc_ratio: Option<f64>,
    pub formula_non_empty_ratio: Option<f64>,
    pub n_rules: usize,
    pub severity_ok: Option<bool>,
    pub duplicate_indicators: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateReport {
    pub status: GateStatus,
    pub metrics: GateMetrics,
    pub errors: Vec<GateError>,
}

impl GateReport {
    pub fn exit_code(&self) -> i32 {
        match self.status {
            GateStatus::Pass => 0,
            GateStatus::Fail => 2,
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize gate report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write gate report: {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read gate report: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse gate report: {}", path.display()))
    }
}

fn push_error(errors: &mut Vec<GateError>, code: &str, message: String) {
    errors.push(GateError {
        code: code.to_string(),
        message,
    });
}

/// Deterministic structural verdict on an outline. An outline that fails
/// here cannot be compiled into a usable methodology.
pub fn run_gate(outline: &Outline) -> GateReport {
    let mut errors = Vec::new();
    let mut metrics = GateMetrics::default();

    let stages = &outline.structure.stages;
    let indicators = &outline.structure.indicators;
    let rules = &outline.structure.rules;

    // 1) Stage count
    let n_stages = stages.len();
    metrics.n_stages = n_stages;
    if n_stages < 1 {
        push_error(
            &mut errors,
            "BQG_STAGE_COUNT",
            "stages must contain at least 1 item".to_string(),
        );
    }

    // 2) Stage description coverage
    if n_stages > 0 {
        let empty = stages
            .iter()
            .filter(|s| is_blank(s.description.as_deref()))
            .count();
        metrics.empty_stage_desc_ratio = Some(empty as f64 / n_stages as f64);
        if empty > 0 {
            push_error(
                &mut errors,
                "BQG_STAGE_DESC_EMPTY",
                format!("{empty} stage descriptions are empty"),
            );
        }
    }

    // 3) Stage order correctness
    if n_stages > 0 {
        let mut orders = Vec::new();
        let mut bad_order = false;
        for stage in stages {
            match stage.order_as_int() {
                Some(o) => orders.push(o),
                None => bad_order = true,
            }
        }

        if bad_order {
            metrics.order_ok = Some(false);
            push_error(
                &mut errors,
                "BQG_STAGE_ORDER_TYPE",
                "stage.order must be int for all stages".to_string(),
            );
        } else {
            let unique: HashSet<i64> = orders.iter().copied().collect();
            let ok = unique.len() == n_stages
                && orders.iter().min() == Some(&1)
                && orders.iter().max() == Some(&(n_stages as i64));
            metrics.order_ok = Some(ok);
            if !ok {
                push_error(
                    &mut errors,
                    "BQG_STAGE_ORDER_RANGE",
                    "stage.order must be unique and cover 1..N without gaps".to_string(),
                );
            }
        }
    }

    // 4) Indicator description coverage
    let n_ind = indicators.len();
    metrics.n_indicators = n_ind;
    if n_ind > 0 {
        let empty = indicators
            .iter()
            .filter(|i| is_blank(i.description.as_deref()))
            .count();
        let ratio = empty as f64 / n_ind as f64;
        metrics.empty_indicator_desc_ratio = Some(ratio);
        if ratio > 0.10 {
            push_error(
                &mut errors,
                "BQG_IND_DESC_COVERAGE",
                "indicator description coverage below 90%".to_string(),
            );
        }
    }

    // 5) Formula coverage is reported but never blocks: narrative
    //    methodologies legitimately carry no formulas.
    if n_ind > 0 {
        let non_empty = indicators
            .iter()
            .filter(|i| !is_blank(i.formula.as_deref()))
            .count();
        metrics.formula_non_empty_ratio = Some(non_empty as f64 / n_ind as f64);
    }

    // 6) Severity vocabulary
    let n_rules = rules.len();
    metrics.n_rules = n_rules;
    if n_rules > 0 {
        let mut bad: Vec<String> = rules
            .iter()
            .filter_map(|r| {
                let sev = r.severity.as_deref().unwrap_or("null");
                if Severity::is_allowed(sev) {
                    None
                } else {
                    Some(sev.to_string())
                }
            })
            .collect();
        bad.sort();
        bad.dedup();
        metrics.severity_ok = Some(bad.is_empty());
        if !bad.is_empty() {
            push_error(
                &mut errors,
                "BQG_SEVERITY_ENUM",
                format!("invalid severity values: {bad:?}"),
            );
        }
    }

    // 7) Duplicate indicator names
    if n_ind > 0 {
        let mut seen = HashSet::new();
        let mut duplicates = 0usize;
        for indicator in indicators {
            let name = normalize_name(indicator.display_name());
            if !seen.insert(name) {
                duplicates += 1;
            }
        }
        metrics.duplicate_indicators = Some(duplicates);
        if duplicates > 0 {
            push_error(
                &mut errors,
                "BQG_IND_DUPES",
                format!("duplicate indicators by normalized name: {duplicates}"),
            );
        }
    }

    let status = if errors.is_empty() {
        GateStatus::Pass
    } else {
        GateStatus::Fail
    };

    GateReport {
        status,
        metrics,
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outline_from(yaml: &str) -> Outline {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn codes(report: &GateReport) -> Vec<&str> {
        report.errors.iter().map(|e| e.code.as_str()).collect()
    }

    #[test]
    fn clean_outline_passes() {
        let outline = outline_from(
            r#"
structure:
  stages:
    - {title: "A", description: "first step", order: 1}
    - {title: "B", description: "second step", order: 2}
    - {title: "C", description: "third step", order: 3}
  indicators:
    - {name: "Margin", description: "profitability"}
  rules:
    - {condition: "x", action: "y", severity: info}
"#,
        );
        let report = run_gate(&outline);
        assert_eq!(report.status, GateStatus::Pass);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.metrics.order_ok, Some(true));
    }

    #[test]
    fn order_gap_fails_with_range_code() {
        let outline = outline_from(
            r#"
structure:
  stages:
    - {title: "A", description: "first", order: 1}
    - {title: "B", description: "second", order: 3}
"#,
        );
        let report = run_gate(&outline);
        assert_eq!(report.status, GateStatus::Fail);
        assert!(codes(&report).contains(&"BQG_STAGE_ORDER_RANGE"));
        assert_eq!(report.exit_code(), 2);
    }

    #[test]
    fn zero_stages_fails() {
        let outline = outline_from("structure: {stages: []}");
        let report = run_gate(&outline);
        assert!(codes(&report).contains(&"BQG_STAGE_COUNT"));
    }

    #[test]
    fn empty_description_fails() {
        let outline = outline_from(
            r#"
structure:
  stages:
    - {title: "A", description: "", order: 1}
"#,
        );
        let report = run_gate(&outline);
        assert!(codes(&report).contains(&"BQG_STAGE_DESC_EMPTY"));
    }

    #[test]
    fn non_integer_order_fails_with_type_code() {
        let outline = outline_from(
            r#"
structure:
  stages:
    - {title: "A", description: "x", order: "first"}
"#,
        );
        let report = run_gate(&outline);
        assert!(codes(&report).contains(&"BQG_STAGE_ORDER_TYPE"));
        assert_eq!(report.metrics.order_ok, Some(false));
    }

    #[test]
    fn duplicate_indicator_names_fail_case_insensitively() {
        let outline = outline_from(
            r#"
structure:
  stages:
    - {title: "A", description: "x", order: 1}
  indicators:
    - {name: "Ebitda", description: "a"}
    - {name: "EBITDA", description: "b"}
"#,
        );
        let report = run_gate(&outline);
        assert!(codes(&report).contains(&"BQG_IND_DUPES"));
        assert_eq!(report.metrics.duplicate_indicators, Some(1));
    }

    #[test]
    fn invalid_severity_fails() {
        let outline = outline_from(
            r#"
structure:
  stages:
    - {title: "A", description: "x", order: 1}
  rules:
    - {condition: "c", action: "a", severity: high}
"#,
        );
        let report = run_gate(&outline);
        assert!(codes(&report).contains(&"BQG_SEVERITY_ENUM"));
        assert_eq!(report.metrics.severity_ok, Some(false));
    }

    #[test]
    fn empty_formulas_only_lower_metric() {
        let outline = outline_from(
            r#"
structure:
  stages:
    - {title: "A", description: "x", order: 1}
  indicators:
    - {name: "N1", description: "d1"}
    - {name: "N2", description: "d2", formula: "N2 = a / b"}
"#,
        );
        let report = run_gate(&outline);
        assert_eq!(report.status, GateStatus::Pass);
        assert_eq!(report.metrics.formula_non_empty_ratio, Some(0.5));
    }

    #[test]
    fn indicator_desc_coverage_threshold() {
        // 2 of 10 empty -> 20% > 10% threshold
        let mut yaml = String::from("structure:\n  stages:\n    - {title: A, description: x, order: 1}\n  indicators:\n");
        for i in 0..8 {
            yaml.push_str(&format!("    - {{name: \"i{i}\", description: \"d{i}\"}}\n"));
        }
        yaml.push_str("    - {name: \"empty1\", description: \"\"}\n");
        yaml.push_str("    - {name: \"empty2\"}\n");
        let report = run_gate(&outline_from(&yaml));
        assert!(codes(&report).contains(&"BQG_IND_DESC_COVERAGE"));
    }

    #[test]
    fn report_roundtrips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let outline = outline_from("structure: {stages: []}");
        let report = run_gate(&outline);
        let path = dir.path().join("gate.json");
        report.write(&path).unwrap();
        let loaded = GateReport::load(&path).unwrap();
        assert_eq!(loaded.status, GateStatus::Fail);
        assert_eq!(loaded.errors.len(), report.errors.len());
    }
}
