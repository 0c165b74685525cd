use super::{Issue, IssueSeverity, QaResult};

fn format_issue(issue: &Issue) -> String {
    let pointer = issue
        .evidence
        .get("pointer")
        .or_else(|| issue.evidence.get("path"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let snippet = issue.evidence.get("snippet").and_then(|v| v.as_str());

    let severity = match issue.severity {
        IssueSeverity::Blocker => "BLOCKER",
        IssueSeverity::Major => "MAJOR",
        IssueSeverity::Minor => "MINOR",
    };

    let mut s = format!("- **[{severity}][{}]** {}", issue.category, issue.message);
    if !pointer.is_empty() {
        s.push_str(&format!("\n  - Evidence: `{pointer}`"));
    }
    if let Some(snippet) = snippet {
        s.push_str(&format!("\n  - Snippet: `{snippet}`"));
    }
    if !issue.fix_hint.is_empty() {
        s.push_str(&format!("\n  - Fix: {}", issue.fix_hint));
    }
    s
}

/// Human-readable companion to `qa_result.json`.
pub fn render_qa_report(book_id: &str, result: &QaResult, strengths: &[String]) -> String {
    let mut md: Vec<String> = Vec::new();

    md.push(format!("# QA Report — {book_id}\n"));
    md.push("## Verdict".to_string());
    md.push(format!("- approved: **{}**", result.approved));
    md.push(format!("- score: **{}/100**\n", result.score));

    for (section, severity) in [
        ("## Blockers", IssueSeverity::Blocker),
        ("## Major issues", IssueSeverity::Major),
        ("## Minor issues", IssueSeverity::Minor),
    ] {
        let group: Vec<&Issue> = result
            .issues
            .iter()
            .filter(|i| i.severity == severity)
            .collect();
        if group.is_empty() {
            continue;
        }
        md.push(section.to_string());
        for issue in group {
            md.push(format_issue(issue));
        }
        md.push(String::new());
    }

    if !strengths.is_empty() {
        md.push("## Strengths (from reasoning layer)".to_string());
        for s in strengths {
            md.push(format!("- {s}"));
        }
        md.push(String::new());
    }

    md.push("## Next actions (pipeline)".to_string());
    md.push("1. Fix BLOCKER/MAJOR issues in the outline or the compilation.".to_string());
    md.push("2. Re-run the compiler to regenerate `data/` and `docs/`.".to_string());
    md.push("3. Re-run the QA review until approved.\n".to_string());

    md.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qa::{LlmFindings, QaMetrics, QaSummary, ReviewerInfo};
    use serde_json::json;

    fn result_with(issues: Vec<Issue>) -> QaResult {
        QaResult {
            book_id: "b1".to_string(),
            approved: issues.is_empty(),
            score: 75,
            summary: QaSummary {
                blockers: 0,
                majors: 0,
                minors: 0,
            },
            issues,
            metrics: QaMetrics {
                schema_valid: true,
                glossary_coverage: 1.0,
                formula_checks_passed: 1.0,
            },
            llm_findings: LlmFindings {
                enabled: false,
                issues_found: 0,
                strengths_found: 0,
                model: None,
            },
            generated_at: "2024-01-01T00:00:00Z".to_string(),
            reviewer: ReviewerInfo {
                agent: "qa-reviewer".to_string(),
                model: "none (precheck-only)".to_string(),
                prompt_version: "v1.0".to_string(),
            },
        }
    }

    #[test]
    fn groups_issues_by_severity() {
        let issues = vec![
            Issue::new(
                "DUP-IND-001",
                IssueSeverity::Blocker,
                "duplicates",
                "dup indicator",
                json!({"pointer": "/structure/indicators/0"}),
                "merge",
            ),
            Issue::new(
                "ORDER-DUP-001",
                IssueSeverity::Major,
                "stage_order",
                "dup order",
                json!({}),
                "",
            ),
        ];
        let md = render_qa_report("b1", &result_with(issues), &[]);
        assert!(md.contains("## Blockers"));
        assert!(md.contains("## Major issues"));
        assert!(!md.contains("## Minor issues"));
        assert!(md.contains("`/structure/indicators/0`"));
    }

    #[test]
    fn clean_report_has_no_issue_sections() {
        let md = render_qa_report("b1", &result_with(Vec::new()), &["good flow".to_string()]);
        assert!(md.contains("- approved: **true**"));
        assert!(!md.contains("## Blockers"));
        assert!(md.contains("- good flow"));
    }
}
