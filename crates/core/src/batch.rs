use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::gate::GateReport;
use crate::invoker::CommandRunner;
use crate::layout::Layout;
use crate::manifest::{RunManifest, StepStatus};

pub fn default_batch_id() -> String {
    format!("batch_{}", chrono::Utc::now().timestamp())
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub steps: String,
    pub batch_id: String,
    pub require_gate_pass: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookResult {
    pub book_id: String,
    pub success: bool,
    pub exit_code: i32,
    pub duration_sec: f64,
    pub run_id: String,

    pub gate_status: Option<String>,
    pub gate_blockers: usize,
    pub qa_approved: Option<bool>,
    pub qa_blockers: u64,

    pub error: Option<String>,
}

/// Sources under `sources/` that actually carry extracted blocks.
pub fn discover_books(layout: &Layout) -> Result<Vec<String>> {
    let sources_dir = layout.sources_dir();
    if !sources_dir.exists() {
        return Ok(Vec::new());
    }
    let mut books: Vec<String> = std::fs::read_dir(&sources_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(String::from))
        .filter(|name| !name.starts_with('.'))
        .filter(|name| layout.blocks_path(name).exists())
        .collect();
    books.sort();
    Ok(books)
}

/// Run the orchestrator on one book as a subprocess and harvest its
/// manifest for the batch report.
pub async fn run_book(
    layout: &Layout,
    invoker: &dyn CommandRunner,
    book_id: &str,
    options: &BatchOptions,
) -> BookResult {
    let run_id = format!("{}_{book_id}", options.batch_id);
    tracing::info!(book_id, run_id, "Processing book");

    let mut args = vec![
        "run".to_string(),
        "--book-id".to_string(),
        book_id.to_string(),
        "--steps".to_string(),
        options.steps.clone(),
        "--run-id".to_string(),
        run_id.clone(),
        "--base-dir".to_string(),
        layout.root().to_string_lossy().to_string(),
    ];
    if !options.require_gate_pass {
        args.push("--no-require-gate-pass".to_string());
    }

    let start = Instant::now();
    let exit_code = match invoker.run(&args).await {
        Ok(code) => code,
        Err(e) => {
            return BookResult {
                book_id: book_id.to_string(),
                success: false,
                exit_code: 1,
                duration_sec: start.elapsed().as_secs_f64(),
                run_id,
                gate_status: None,
                gate_blockers: 0,
                qa_approved: None,
                qa_blockers: 0,
                error: Some(format!("Failed to launch run: {e}")),
            };
        }
    };
    let duration_sec = (start.elapsed().as_secs_f64() * 100.0).round() / 100.0;

    let mut result = BookResult {
        book_id: book_id.to_string(),
        success: exit_code == 0,
        exit_code,
        duration_sec,
        run_id: run_id.clone(),
        gate_status: None,
        gate_blockers: 0,
        qa_approved: None,
        qa_blockers: 0,
        error: None,
    };

    let manifest_path = layout.manifest_path(&run_id);
    if manifest_path.exists() {
        match RunManifest::load(&manifest_path) {
            Ok(manifest) => {
                result.gate_status = manifest.qa.gate_status.clone();
                result.qa_approved = manifest.qa.approved;
                result.qa_blockers = manifest.qa.blockers.unwrap_or(0);

                let gate_report_path = layout.gate_report_path(&run_id);
                if gate_report_path.exists() {
                    if let Ok(report) = GateReport::load(&gate_report_path) {
                        result.gate_blockers = report.errors.len();
                    }
                }

                if let Some(failed) = manifest
                    .steps
                    .iter()
                    .find(|s| s.status == StepStatus::Fail)
                {
                    result.error = Some(
                        failed
                            .error
                            .clone()
                            .unwrap_or_else(|| format!("Failed step: {}", failed.name)),
                    );
                }
            }
            Err(e) => result.error = Some(format!("Failed to read manifest: {e}")),
        }
    }

    result
}

/// Markdown batch report written to `qa/<batch_id>.md`.
pub fn render_batch_report(results: &[BookResult], batch_id: &str, steps: &str) -> String {
    let success_count = results.iter().filter(|r| r.success).count();
    let fail_count = results.len() - success_count;
    let total_duration: f64 = results.iter().map(|r| r.duration_sec).sum();

    let mut lines: Vec<String> = Vec::new();
    lines.push("# Batch Pipeline Report".to_string());
    lines.push(String::new());
    lines.push(format!("**Batch ID**: `{batch_id}`  "));
    lines.push(format!("**Steps**: {steps}  "));
    lines.push(format!("**Total books**: {}  ", results.len()));
    lines.push(format!("**Success**: {success_count}  "));
    lines.push(format!("**Failed**: {fail_count}  "));
    lines.push(format!("**Total duration**: {total_duration:.1}s  "));
    lines.push(String::new());

    lines.push("## Verdict".to_string());
    lines.push(String::new());
    if fail_count == 0 {
        lines.push(format!(
            "**All {} books processed successfully**",
            results.len()
        ));
    } else {
        lines.push(format!("**{fail_count}/{} books failed**", results.len()));
        lines.push(String::new());
        lines.push("**Next actions**:".to_string());
        lines.push("1. Review failed books below".to_string());
        lines.push("2. Check individual `qa/runs/<run_id>/release/summary.md`".to_string());
        lines.push("3. Fix issues and re-run failed books".to_string());
    }
    lines.push(String::new());

    lines.push("## Results".to_string());
    lines.push(String::new());
    lines.push("| Book | Status | Duration | Gate | QA | Blockers |".to_string());
    lines.push("|------|--------|----------|------|----|----------|".to_string());
    for r in results {
        let status = if r.success { "ok" } else { "fail" };
        let gate = r.gate_status.as_deref().unwrap_or("-");
        let qa = match r.qa_approved {
            Some(true) => "approved",
            Some(false) => "rejected",
            None => "-",
        };
        let blockers = r.gate_blockers as u64 + r.qa_blockers;
        lines.push(format!(
            "| {} | {status} | {:.1}s | {gate} | {qa} | {blockers} |",
            r.book_id, r.duration_sec
        ));
    }
    lines.push(String::new());

    let failed: Vec<&BookResult> = results.iter().filter(|r| !r.success).collect();
    if !failed.is_empty() {
        lines.push("## Failed Books".to_string());
        lines.push(String::new());
        for r in failed {
            lines.push(format!("### {}", r.book_id));
            lines.push(String::new());
            lines.push(format!("- **Exit code**: {}", r.exit_code));
            lines.push(format!("- **Run ID**: `{}`", r.run_id));
            if let Some(error) = &r.error {
                lines.push(format!("- **Error**: {error}"));
            }
            if r.gate_status.as_deref() == Some("FAIL") {
                lines.push(format!("- **Gate blockers**: {}", r.gate_blockers));
            }
            if r.qa_approved == Some(false) {
                lines.push(format!("- **QA blockers**: {}", r.qa_blockers));
            }
            lines.push(format!(
                "- **Details**: `qa/runs/{}/release/summary.md`",
                r.run_id
            ));
            lines.push(String::new());
        }
    }

    if success_count > 0 {
        lines.push("## Statistics".to_string());
        lines.push(String::new());
        let passed_gate = results
            .iter()
            .filter(|r| r.gate_status.as_deref() == Some("PASS"))
            .count();
        if passed_gate > 0 {
            lines.push(format!("- **Gate PASS**: {passed_gate}/{}", results.len()));
        }
        let approved = results.iter().filter(|r| r.qa_approved == Some(true)).count();
        if approved > 0 {
            lines.push(format!("- **QA Approved**: {approved}/{}", results.len()));
        }
        lines.push(format!(
            "- **Avg duration**: {:.1}s per book",
            total_duration / results.len() as f64
        ));
        lines.push(String::new());
    }

    lines.push("---".to_string());
    lines.push(String::new());
    lines.push("*Generated by the batch runner*".to_string());

    lines.join("\n")
}

/// Run every book sequentially and write the batch report. Returns the
/// results; the caller derives its exit code from them.
pub async fn run_batch(
    layout: &Layout,
    invoker: &dyn CommandRunner,
    books: &[String],
    options: &BatchOptions,
) -> Result<Vec<BookResult>> {
    let mut results = Vec::new();
    for book_id in books {
        let result = run_book(layout, invoker, book_id, options).await;
        tracing::info!(
            book_id,
            success = result.success,
            exit_code = result.exit_code,
            "Book finished"
        );
        results.push(result);
    }

    let report = render_batch_report(&results, &options.batch_id, &options.steps);
    let report_path = layout.batch_report_path(&options.batch_id);
    if let Some(parent) = report_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&report_path, report)
        .with_context(|| format!("Failed to write {}", report_path.display()))?;
    tracing::info!(report = %report_path.display(), "Batch report written");

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StubInvoker {
        exit_codes: Mutex<Vec<i32>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl StubInvoker {
        fn new(exit_codes: Vec<i32>) -> Self {
            Self {
                exit_codes: Mutex::new(exit_codes),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for StubInvoker {
        async fn run(&self, args: &[String]) -> Result<i32> {
            self.calls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(args.to_vec());
            let mut codes = self.exit_codes.lock().unwrap_or_else(|e| e.into_inner());
            Ok(if codes.is_empty() { 0 } else { codes.remove(0) })
        }
    }

    fn options() -> BatchOptions {
        BatchOptions {
            steps: "B,C,D,Gate".to_string(),
            batch_id: "batch_t".to_string(),
            require_gate_pass: true,
        }
    }

    #[test]
    fn discovers_only_books_with_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let with_blocks = layout.blocks_path("book_a");
        std::fs::create_dir_all(with_blocks.parent().unwrap()).unwrap();
        std::fs::write(&with_blocks, "{}").unwrap();
        std::fs::create_dir_all(layout.source_dir("book_without")).unwrap();
        std::fs::create_dir_all(layout.source_dir(".hidden")).unwrap();

        let books = discover_books(&layout).unwrap();
        assert_eq!(books, vec!["book_a".to_string()]);
    }

    #[tokio::test]
    async fn batch_collects_results_and_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let invoker = StubInvoker::new(vec![0, 2]);
        let books = vec!["book_a".to_string(), "book_b".to_string()];

        let results = run_batch(&layout, &invoker, &books, &options()).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].success);
        assert!(!results[1].success);
        assert_eq!(results[1].exit_code, 2);

        let report_path = layout.batch_report_path("batch_t");
        let report = std::fs::read_to_string(report_path).unwrap();
        assert!(report.contains("**1/2 books failed**"));
        assert!(report.contains("| book_a | ok |"));
        assert!(report.contains("### book_b"));
    }

    #[tokio::test]
    async fn batch_run_ids_are_namespaced_per_book() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let invoker = StubInvoker::new(vec![0]);
        let result = run_book(&layout, &invoker, "book_x", &options()).await;
        assert_eq!(result.run_id, "batch_t_book_x");
        let calls = invoker.calls.lock().unwrap();
        assert!(calls[0].contains(&"--run-id".to_string()));
        assert!(calls[0].contains(&"batch_t_book_x".to_string()));
    }

    #[tokio::test]
    async fn harvests_manifest_details_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());

        let run_dir = layout.run_dir("batch_t_book_y");
        std::fs::create_dir_all(&run_dir).unwrap();
        let mut manifest = RunManifest::new(
            "batch_t_book_y",
            "book_y",
            "sources/book_y",
            None,
            true,
        );
        manifest.qa.gate_status = Some("PASS".to_string());
        manifest.qa.approved = Some(true);
        manifest.write(&run_dir).unwrap();

        let invoker = StubInvoker::new(vec![0]);
        let result = run_book(&layout, &invoker, "book_y", &options()).await;
        assert_eq!(result.gate_status.as_deref(), Some("PASS"));
        assert_eq!(result.qa_approved, Some(true));
    }
}
