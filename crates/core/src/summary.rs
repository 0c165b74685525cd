use std::path::Path;

use anyhow::{Context, Result};

use crate::gate::{GateMetrics, GateReport};
use crate::manifest::{RunManifest, StepStatus};

/// Everything the release summary needs, derived from the run manifest and
/// (when present) the gate report next to it.
#[derive(Debug, Clone)]
pub struct ReleaseSummary {
    pub run_id: String,
    pub book_id: String,
    pub created_at: String,
    pub total_duration: f64,

    pub steps: Vec<StepLine>,

    pub gate_status: Option<String>,
    pub gate_metrics: Option<GateMetrics>,
    pub gate_errors: Vec<(String, String)>,

    pub approved: Option<bool>,
    pub blockers: u64,
    pub warnings: u64,

    pub require_gate_pass: bool,

    pub success: bool,
    pub exit_code: i32,
}

#[derive(Debug, Clone)]
pub struct StepLine {
    pub name: String,
    pub status: StepStatus,
    pub duration_sec: f64,
    pub artifacts: Vec<String>,
    pub error: Option<String>,
}

impl ReleaseSummary {
    pub fn completed_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.status == StepStatus::Ok).count()
    }

    pub fn failed_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.status == StepStatus::Fail).count()
    }

    pub fn skipped_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Skipped)
            .count()
    }
}

/// Derive the run verdict from the manifest: a failed step means exit 1,
/// gate FAIL under policy means exit 2, anything else is success.
pub fn parse_manifest(manifest_path: &Path) -> Result<ReleaseSummary> {
    let manifest = RunManifest::load(manifest_path)?;

    let steps: Vec<StepLine> = manifest
        .steps
        .iter()
        .map(|s| StepLine {
            name: s.name.clone(),
            status: s.status,
            duration_sec: s.duration_sec,
            artifacts: s.artifacts.clone(),
            error: s.error.clone(),
        })
        .collect();

    let total_duration: f64 = steps.iter().map(|s| s.duration_sec).sum();
    let gate_status = manifest.qa.gate_status.clone();
    let require_gate_pass = manifest.policy.require_gate_pass;

    let failed = steps.iter().any(|s| s.status == StepStatus::Fail);
    let gate_fail = gate_status.as_deref() == Some("FAIL") && require_gate_pass;
    let (exit_code, success) = if failed {
        (1, false)
    } else if gate_fail {
        (2, false)
    } else {
        (0, true)
    };

    let mut gate_metrics = None;
    let mut gate_errors = Vec::new();
    if gate_status.is_some() {
        let report_path = manifest_path
            .parent()
            .map(|dir| dir.join("b_quality_gate.json"))
            .unwrap_or_default();
        if report_path.exists() {
            if let Ok(report) = GateReport::load(&report_path) {
                gate_metrics = Some(report.metrics);
                gate_errors = report
                    .errors
                    .into_iter()
                    .map(|e| (e.code, e.message))
                    .collect();
            }
        }
    }

    Ok(ReleaseSummary {
        run_id: manifest.run_id,
        book_id: manifest.book_id,
        created_at: manifest.created_at,
        total_duration,
        steps,
        gate_status,
        gate_metrics,
        gate_errors,
        approved: manifest.qa.approved,
        blockers: manifest.qa.blockers.unwrap_or(0),
        warnings: manifest.qa.warnings.unwrap_or(0),
        require_gate_pass,
        success,
        exit_code,
    })
}

fn percent(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.1}%", v * 100.0),
        None => "n/a".to_string(),
    }
}

/// Render the markdown release report.
pub fn render_summary(summary: &ReleaseSummary) -> String {
    let mut lines: Vec<String> = Vec::new();

    lines.push(format!("# Release Summary: {}", summary.book_id));
    lines.push(String::new());
    lines.push(format!("**Run ID**: `{}`  ", summary.run_id));
    lines.push(format!("**Created**: {}  ", summary.created_at));
    lines.push(format!("**Duration**: {:.1}s  ", summary.total_duration));
    lines.push(format!(
        "**Status**: {}  ",
        if summary.success { "SUCCESS" } else { "FAILED" }
    ));
    lines.push(format!("**Exit Code**: {}", summary.exit_code));
    lines.push(String::new());

    lines.push("## Verdict".to_string());
    lines.push(String::new());
    if summary.success {
        lines.push("**Pipeline completed successfully**".to_string());
        if summary.gate_status.as_deref() == Some("PASS") {
            lines.push("- Quality Gate: **PASS**".to_string());
        }
        if let Some(approved) = summary.approved {
            lines.push(format!(
                "- QA Review: **{}**",
                if approved { "APPROVED" } else { "NOT APPROVED" }
            ));
        }
        lines.push(String::new());
        lines.push("**Next actions**:".to_string());
        lines.push("- Review artifacts in `work/` and `data/`".to_string());
        lines.push("- Methodology ready for publication".to_string());
    } else if summary.exit_code == 2 {
        lines.push("**Pipeline stopped: Quality Gate FAIL**".to_string());
        lines.push(String::new());
        lines.push(format!(
            "- Gate status: **{}**",
            summary.gate_status.as_deref().unwrap_or("FAIL")
        ));
        lines.push(format!("- Gate errors: **{}**", summary.gate_errors.len()));
        lines.push(String::new());
        lines.push("**Next actions**:".to_string());
        lines.push("1. Review Gate errors below".to_string());
        lines.push("2. Fix the outline (work/<id>/outline_<id>.yaml)".to_string());
        lines.push(format!(
            "3. Re-run: `finkb run --book-id {} --steps Gate,G,E`",
            summary.book_id
        ));
    } else {
        lines.push("**Pipeline failed during execution**".to_string());
        lines.push(String::new());
        if let Some(failed) = summary.steps.iter().find(|s| s.status == StepStatus::Fail) {
            lines.push(format!("- Failed step: **{}**", failed.name));
            if let Some(error) = &failed.error {
                lines.push(format!("- Error: `{error}`"));
            }
        }
        lines.push(String::new());
        lines.push("**Next actions**:".to_string());
        lines.push("1. Check error details below".to_string());
        lines.push("2. Fix the issue in the step or its input data".to_string());
        lines.push("3. Re-run the full pipeline".to_string());
    }
    lines.push(String::new());

    lines.push("## Pipeline Steps".to_string());
    lines.push(String::new());
    lines.push(format!(
        "**Total**: {} | **Completed**: {} | **Failed**: {} | **Skipped**: {}",
        summary.steps.len(),
        summary.completed_steps(),
        summary.failed_steps(),
        summary.skipped_steps()
    ));
    lines.push(String::new());
    lines.push("| Step | Status | Duration | Artifacts |".to_string());
    lines.push("|------|--------|----------|-----------|".to_string());
    for step in &summary.steps {
        let artifacts = if step.artifacts.is_empty() {
            "-".to_string()
        } else {
            format!("{} files", step.artifacts.len())
        };
        lines.push(format!(
            "| {} | {} | {:.2}s | {} |",
            step.name, step.status, step.duration_sec, artifacts
        ));
    }
    lines.push(String::new());

    if let Some(status) = &summary.gate_status {
        lines.push("## Quality Gate".to_string());
        lines.push(String::new());
        lines.push(format!("**Status**: {status}"));
        lines.push(String::new());

        if let Some(metrics) = &summary.gate_metrics {
            lines.push("### Metrics".to_string());
            lines.push(String::new());
            lines.push(format!("- **Stages**: {}", metrics.n_stages));
            lines.push(format!(
                "- **Empty stage descriptions**: {}",
                percent(metrics.empty_stage_desc_ratio)
            ));
            lines.push(format!(
                "- **Stage order correct**: {}",
                match metrics.order_ok {
                    Some(true) => "yes",
                    Some(false) => "no",
                    None => "n/a",
                }
            ));
            lines.push(format!("- **Indicators**: {}", metrics.n_indicators));
            lines.push(format!(
                "- **Formula coverage**: {}",
                percent(metrics.formula_non_empty_ratio)
            ));
            lines.push(format!(
                "- **Duplicate indicators**: {}",
                metrics.duplicate_indicators.unwrap_or(0)
            ));
            lines.push(String::new());
        }

        if !summary.gate_errors.is_empty() {
            lines.push("### Errors".to_string());
            lines.push(String::new());
            for (code, message) in &summary.gate_errors {
                lines.push(format!("- **{code}**: {message}"));
            }
            lines.push(String::new());
        }
    }

    if let Some(approved) = summary.approved {
        lines.push("## QA Review".to_string());
        lines.push(String::new());
        lines.push(format!("**Approved**: {}", if approved { "yes" } else { "no" }));
        lines.push(format!("**Blockers**: {}", summary.blockers));
        lines.push(format!("**Warnings**: {}", summary.warnings));
        lines.push(String::new());
        if summary.blockers > 0 {
            lines.push(format!(
                "**Action required**: review `work/{}/qa/qa_report.md`",
                summary.book_id
            ));
            lines.push(String::new());
        }
    }

    lines.push("## Artifacts".to_string());
    lines.push(String::new());
    let mut has_artifacts = false;
    for step in &summary.steps {
        if step.artifacts.is_empty() {
            continue;
        }
        has_artifacts = true;
        lines.push(format!("### {}", step.name));
        lines.push(String::new());
        for artifact in &step.artifacts {
            lines.push(format!("- `{artifact}`"));
        }
        lines.push(String::new());
    }
    if !has_artifacts {
        lines.push("*No artifacts produced*".to_string());
        lines.push(String::new());
    }

    let errored: Vec<&StepLine> = summary.steps.iter().filter(|s| s.error.is_some()).collect();
    if !errored.is_empty() {
        lines.push("## Error Details".to_string());
        lines.push(String::new());
        for step in errored {
            lines.push(format!("### Step: {}", step.name));
            lines.push(String::new());
            lines.push("```".to_string());
            lines.push(step.error.clone().unwrap_or_default());
            lines.push("```".to_string());
            lines.push(String::new());
        }
    }

    lines.push("---".to_string());
    lines.push(String::new());
    lines.push("*Generated by the release summary publisher*".to_string());

    lines.join("\n")
}

/// Parse the manifest and write the rendered summary.
pub fn publish_summary(manifest_path: &Path, output_path: &Path) -> Result<ReleaseSummary> {
    let summary = parse_manifest(manifest_path)?;
    let markdown = render_summary(&summary);
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output_path, markdown)
        .with_context(|| format!("Failed to write {}", output_path.display()))?;
    Ok(summary)
}
