use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Result};
use serde_json::json;

use crate::builder::OutlineBuilder;
use crate::compiler;
use crate::gate::GateReport;
use crate::invoker::CommandRunner;
use crate::layout::Layout;
use crate::manifest::{write_json_atomic, RunManifest, StepRecord, StepStatus};
use crate::qa::{self, ReviewOptions};
use finkb_llm::ChatClient;

pub const ALLOWED_STEPS: &[&str] = &["B", "C", "D", "Gate", "G", "E", "F"];
pub const DEFAULT_STEPS: &str = "B,C,D,Gate,G,E,F";

/// Exit codes of a pipeline run.
pub const EXIT_OK: i32 = 0;
pub const EXIT_RUNTIME_FAIL: i32 = 1;
pub const EXIT_GATE_FAIL: i32 = 2;

pub fn parse_steps(raw: &str) -> Result<Vec<String>> {
    let steps: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    let unknown: Vec<&String> = steps
        .iter()
        .filter(|s| !ALLOWED_STEPS.contains(&s.as_str()))
        .collect();
    if !unknown.is_empty() {
        bail!("Unknown steps: {unknown:?}. Allowed: {ALLOWED_STEPS:?}");
    }
    Ok(steps)
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub book_id: String,
    pub source_path: PathBuf,
    /// Source ids that contributed, when resolved from a bundle.
    pub sources: Option<Vec<String>>,
    pub run_id: String,
    pub steps: Vec<String>,

    pub require_gate_pass: bool,

    pub use_gigachat: bool,
    pub skip_qa_for_publish: bool,
    pub g_reconcile: bool,
    pub g_dry_run: bool,
}

pub struct Runner<'a> {
    cfg: OrchestratorConfig,
    layout: Layout,
    run_dir: PathBuf,
    manifest: RunManifest,
    invoker: &'a dyn CommandRunner,
    chat: Option<&'a dyn ChatClient>,
}

impl<'a> Runner<'a> {
    pub fn new(
        cfg: OrchestratorConfig,
        layout: Layout,
        invoker: &'a dyn CommandRunner,
        chat: Option<&'a dyn ChatClient>,
    ) -> Result<Self> {
        let run_dir = layout.run_dir(&cfg.run_id);
        std::fs::create_dir_all(&run_dir)?;
        let manifest = RunManifest::new(
            &cfg.run_id,
            &cfg.book_id,
            &cfg.source_path.to_string_lossy(),
            cfg.sources.clone(),
            cfg.require_gate_pass,
        );
        manifest.write(&run_dir)?;
        Ok(Self {
            cfg,
            layout,
            run_dir,
            manifest,
            invoker,
            chat,
        })
    }

    pub fn manifest(&self) -> &RunManifest {
        &self.manifest
    }

    fn add_step(&mut self, record: StepRecord) -> Result<()> {
        self.manifest.steps.push(record);
        self.manifest.write(&self.run_dir)
    }

    fn finalize(&self, reason: &str) -> Result<()> {
        write_json_atomic(
            &self.run_dir.join("final.json"),
            &json!({"status": "FINALIZE", "reason": reason}),
        )
    }

    /// Run one step with timing and error capture; the manifest hits disk
    /// on both outcomes so a watcher always sees the latest state.
    async fn execute_step(&mut self, name: &str) -> bool {
        let started_at = chrono::Utc::now().to_rfc3339();
        let t0 = Instant::now();
        let outcome = match name {
            "B" => self.step_b().await,
            "C" => self.step_c().await,
            "D" => self.step_d().await,
            "Gate" => self.step_gate().await,
            "G" => self.step_g().await,
            "E" => self.step_e().await,
            "F" => self.step_f().await,
            other => Err(anyhow::anyhow!("Unknown step: {other}")),
        };
        let ended_at = chrono::Utc::now().to_rfc3339();
        let duration_sec = (t0.elapsed().as_secs_f64() * 1000.0).round() / 1000.0;

        let record = match &outcome {
            Ok(artifacts) => StepRecord {
                name: name.to_string(),
                status: StepStatus::Ok,
                artifacts: artifacts
                    .iter()
                    .map(|p| p.to_string_lossy().to_string())
                    .collect(),
                started_at,
                ended_at,
                duration_sec,
                error: None,
            },
            Err(e) => StepRecord {
                name: name.to_string(),
                status: StepStatus::Fail,
                artifacts: Vec::new(),
                started_at,
                ended_at,
                duration_sec,
                error: Some(format!("{e:#}")),
            },
        };
        if let Err(e) = self.add_step(record) {
            tracing::error!(error = %e, "Failed to write manifest");
            return false;
        }
        outcome.is_ok()
    }

    // ---- step implementations ----

    async fn step_b(&self) -> Result<Vec<PathBuf>> {
        let blocks_path = self.cfg.source_path.join("extracted").join("blocks.jsonl");
        if !blocks_path.exists() {
            bail!("blocks.jsonl not found: {}", blocks_path.display());
        }
        let chat = self
            .chat
            .ok_or_else(|| anyhow::anyhow!("Outline builder needs an LLM client (set credentials)"))?;

        let builder = OutlineBuilder::new(chat);
        let outline = builder.build_outline(&blocks_path).await?;

        let out_path = self.layout.outline_path(&self.cfg.book_id);
        if !out_path.exists() {
            outline.save(&out_path)?;
        }
        Ok(vec![out_path])
    }

    async fn step_c(&self) -> Result<Vec<PathBuf>> {
        let output = compiler::compile_methodology(&self.layout, &self.cfg.book_id)?;
        Ok(vec![output.yaml_path, output.docs_dir])
    }

    async fn step_d(&mut self) -> Result<Vec<PathBuf>> {
        let glossary_dir = self.layout.glossary_dir();
        let options = ReviewOptions {
            use_llm: false,
            glossary_dir: glossary_dir.is_dir().then_some(glossary_dir),
            schema_path: None,
        };
        let result =
            qa::validate_methodology(&self.layout, &self.cfg.book_id, &options, self.chat).await?;

        self.manifest.qa.approved = Some(result.approved);
        self.manifest.qa.blockers = Some(result.summary.blockers as u64);
        self.manifest.qa.warnings = Some((result.summary.majors + result.summary.minors) as u64);
        self.manifest.write(&self.run_dir)?;

        // the verdict is in the manifest either way; a rejection still
        // halts the pipeline before anything reaches the graph
        if !result.approved {
            bail!(
                "QA not approved: {} blockers, {} majors (see {})",
                result.summary.blockers,
                result.summary.majors,
                self.layout.qa_report_path(&self.cfg.book_id).display()
            );
        }

        Ok(vec![self.layout.qa_result_path(&self.cfg.book_id)])
    }

    async fn step_gate(&mut self) -> Result<Vec<PathBuf>> {
        let outline_path = self.layout.find_outline(&self.cfg.book_id)?;
        let report_path = self.layout.gate_report_path(&self.cfg.run_id);

        let args = vec![
            "gate".to_string(),
            "--input".to_string(),
            outline_path.to_string_lossy().to_string(),
            "--report".to_string(),
            report_path.to_string_lossy().to_string(),
        ];
        let code = self.invoker.run(&args).await?;
        // Gate exit codes: 0=PASS, 2=FAIL; anything else is a crash
        if code != 0 && code != 2 {
            bail!("Gate command failed with unexpected code ({code})");
        }

        let gate = GateReport::load(&report_path)?;
        self.manifest.qa.gate_status = Some(gate.status.to_string());
        self.manifest.write(&self.run_dir)?;
        Ok(vec![report_path])
    }

    async fn step_g(&self) -> Result<Vec<PathBuf>> {
        let mut args = vec![
            "glossary-sync".to_string(),
            "--base-dir".to_string(),
            self.layout.root().to_string_lossy().to_string(),
        ];
        if self.cfg.g_reconcile {
            args.push("--reconcile".to_string());
        }
        if self.cfg.g_dry_run {
            args.push("--dry-run".to_string());
        }
        let code = self.invoker.run(&args).await?;
        if code != 0 {
            bail!("Glossary sync failed ({code})");
        }
        let report = self.layout.glossary_sync_report_path();
        Ok(if report.exists() { vec![report] } else { Vec::new() })
    }

    async fn step_e(&self) -> Result<Vec<PathBuf>> {
        let mut args = vec![
            "publish".to_string(),
            self.cfg.book_id.clone(),
            "--base-dir".to_string(),
            self.layout.root().to_string_lossy().to_string(),
        ];
        if self.cfg.skip_qa_for_publish {
            args.push("--skip-qa".to_string());
        }
        let code = self.invoker.run(&args).await?;
        if code != 0 {
            bail!("Publish failed ({code})");
        }
        let receipt = self.layout.publish_receipt_path(&self.cfg.book_id);
        Ok(if receipt.exists() { vec![receipt] } else { Vec::new() })
    }

    async fn step_f(&self) -> Result<Vec<PathBuf>> {
        let manifest_path = self.layout.manifest_path(&self.cfg.run_id);
        let output_path = self.layout.summary_path(&self.cfg.run_id);
        let args = vec![
            "summary".to_string(),
            "--manifest".to_string(),
            manifest_path.to_string_lossy().to_string(),
            "--output".to_string(),
            output_path.to_string_lossy().to_string(),
        ];
        let code = self.invoker.run(&args).await?;
        if code != 0 {
            bail!("Summary publisher failed ({code})");
        }
        Ok(if output_path.exists() {
            vec![output_path]
        } else {
            Vec::new()
        })
    }

    /// Execute the requested steps in order, halting on the first failure.
    pub async fn run(&mut self) -> Result<i32> {
        let steps = self.cfg.steps.clone();

        for (position, step) in steps.iter().enumerate() {
            let ok = self.execute_step(step).await;
            if !ok {
                self.finalize(&format!("Step {step} failed"))?;
                return Ok(EXIT_RUNTIME_FAIL);
            }
            if step == "Gate" && self.gate_failed_with_policy(position, &steps)? {
                return Ok(EXIT_GATE_FAIL);
            }
        }

        self.finalize("Completed")?;
        Ok(EXIT_OK)
    }

    /// After a successful Gate step: on FAIL with the policy on, mark the
    /// remaining graph-facing steps skipped and stop with exit 2.
    fn gate_failed_with_policy(&mut self, position: usize, steps: &[String]) -> Result<bool> {
        if !self.cfg.require_gate_pass {
            return Ok(false);
        }
        let failed = self.manifest.qa.gate_status.as_deref() == Some("FAIL");
        if !failed {
            return Ok(false);
        }

        let now = chrono::Utc::now().to_rfc3339();
        for remaining in &steps[position + 1..] {
            if remaining == "G" || remaining == "E" {
                self.manifest.steps.push(StepRecord {
                    name: remaining.clone(),
                    status: StepStatus::Skipped,
                    artifacts: Vec::new(),
                    started_at: now.clone(),
                    ended_at: now.clone(),
                    duration_sec: 0.0,
                    error: Some("Skipped due to Gate FAIL".to_string()),
                });
            }
        }
        self.manifest.write(&self.run_dir)?;
        self.finalize("Gate FAIL")?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::run_gate;
    use crate::outline::Outline;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Runs the Gate in-process the way the real subprocess would, and
    /// records every invocation for assertions.
    struct StubInvoker {
        calls: Mutex<Vec<Vec<String>>>,
        fail_step: Option<&'static str>,
    }

    impl StubInvoker {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_step: None,
            }
        }

        fn failing(step: &'static str) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_step: Some(step),
            }
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }
    }

    #[async_trait]
    impl CommandRunner for StubInvoker {
        async fn run(&self, args: &[String]) -> Result<i32> {
            self.calls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(args.to_vec());
            let subcommand = args.first().map(String::as_str).unwrap_or("");
            if Some(subcommand) == self.fail_step {
                return Ok(1);
            }
            match subcommand {
                "gate" => {
                    let input = PathBuf::from(&args[2]);
                    let report = PathBuf::from(&args[4]);
                    let outline = Outline::load(&input)?;
                    let gate = run_gate(&outline);
                    gate.write(&report)?;
                    Ok(gate.exit_code())
                }
                _ => Ok(0),
            }
        }
    }

    fn write_outline(layout: &Layout, book_id: &str, yaml: &str) {
        let path = layout.outline_path(book_id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, yaml).unwrap();
    }

    const GOOD_OUTLINE: &str = r#"
classification: {methodology_type: planning}
structure:
  stages:
    - {title: "A", description: "first", order: 1}
    - {title: "B", description: "second", order: 2}
  indicators:
    - {name: "N", description: "d"}
  rules:
    - {condition: "c", action: "a", severity: info}
"#;

    const EMPTY_OUTLINE: &str = "structure: {stages: []}\n";

    fn config(book_id: &str, steps: &str, require_gate_pass: bool) -> OrchestratorConfig {
        OrchestratorConfig {
            book_id: book_id.to_string(),
            source_path: PathBuf::from(format!("sources/{book_id}")),
            sources: None,
            run_id: format!("test_{book_id}"),
            steps: parse_steps(steps).unwrap(),
            require_gate_pass,
            use_gigachat: false,
            skip_qa_for_publish: false,
            g_reconcile: false,
            g_dry_run: false,
        }
    }

    #[test]
    fn parse_steps_rejects_unknown() {
        assert!(parse_steps("B,C,Q").is_err());
        assert_eq!(parse_steps(" B , Gate ").unwrap(), vec!["B", "Gate"]);
    }

    #[tokio::test]
    async fn gate_fail_with_policy_exits_2_and_skips_graph_steps() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        write_outline(&layout, "b1", EMPTY_OUTLINE);

        let invoker = StubInvoker::new();
        let mut runner = Runner::new(
            config("b1", "Gate,G,E,F", true),
            layout.clone(),
            &invoker,
            None,
        )
        .unwrap();
        let code = runner.run().await.unwrap();
        assert_eq!(code, EXIT_GATE_FAIL);

        let manifest = RunManifest::load(&layout.manifest_path("test_b1")).unwrap();
        assert_eq!(manifest.qa.gate_status.as_deref(), Some("FAIL"));
        assert_eq!(manifest.steps[0].name, "Gate");
        assert_eq!(manifest.steps[0].status, StepStatus::Ok);
        let skipped: Vec<&str> = manifest
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Skipped)
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(skipped, vec!["G", "E"]);

        let final_json: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(layout.run_dir("test_b1").join("final.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(final_json["reason"], "Gate FAIL");
    }

    #[tokio::test]
    async fn gate_fail_without_policy_continues() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        write_outline(&layout, "b2", EMPTY_OUTLINE);

        let invoker = StubInvoker::new();
        let mut runner =
            Runner::new(config("b2", "Gate,G", false), layout.clone(), &invoker, None).unwrap();
        let code = runner.run().await.unwrap();
        assert_eq!(code, EXIT_OK);

        let manifest = RunManifest::load(&layout.manifest_path("test_b2")).unwrap();
        assert_eq!(manifest.steps.len(), 2);
        assert!(manifest.steps.iter().all(|s| s.status == StepStatus::Ok));
    }

    #[tokio::test]
    async fn full_local_pipeline_records_qa_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        write_outline(&layout, "b3", GOOD_OUTLINE);

        let invoker = StubInvoker::new();
        let mut runner = Runner::new(
            config("b3", "C,D,Gate", true),
            layout.clone(),
            &invoker,
            None,
        )
        .unwrap();
        let code = runner.run().await.unwrap();
        assert_eq!(code, EXIT_OK);

        let manifest = RunManifest::load(&layout.manifest_path("test_b3")).unwrap();
        assert_eq!(manifest.steps.len(), 3);
        assert_eq!(manifest.qa.approved, Some(true));
        assert_eq!(manifest.qa.blockers, Some(0));
        assert_eq!(manifest.qa.gate_status.as_deref(), Some("PASS"));
        assert!(layout.methodology_yaml_path("b3").exists());
        assert!(layout.qa_result_path("b3").exists());
    }

    #[tokio::test]
    async fn failing_step_halts_run_with_exit_1() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        write_outline(&layout, "b4", GOOD_OUTLINE);

        let invoker = StubInvoker::failing("publish");
        let mut runner = Runner::new(
            config("b4", "Gate,E,F", true),
            layout.clone(),
            &invoker,
            None,
        )
        .unwrap();
        let code = runner.run().await.unwrap();
        assert_eq!(code, EXIT_RUNTIME_FAIL);

        let manifest = RunManifest::load(&layout.manifest_path("test_b4")).unwrap();
        let names: Vec<&str> = manifest.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Gate", "E"]);
        assert_eq!(manifest.steps[1].status, StepStatus::Fail);
        assert!(manifest.steps[1].error.as_deref().unwrap().contains("Publish failed"));
        // F never ran
        assert!(invoker.calls().iter().all(|c| c[0] != "summary"));
    }

    #[tokio::test]
    async fn missing_blocks_fails_step_b_with_recorded_error() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());

        let invoker = StubInvoker::new();
        let mut cfg = config("b5", "B", true);
        cfg.source_path = layout.source_dir("b5");
        let mut runner = Runner::new(cfg, layout.clone(), &invoker, None).unwrap();
        let code = runner.run().await.unwrap();
        assert_eq!(code, EXIT_RUNTIME_FAIL);

        let manifest = RunManifest::load(&layout.manifest_path("test_b5")).unwrap();
        assert_eq!(manifest.steps[0].status, StepStatus::Fail);
        assert!(manifest.steps[0]
            .error
            .as_deref()
            .unwrap()
            .contains("blocks.jsonl not found"));
    }

    #[tokio::test]
    async fn rejected_qa_fails_step_d_but_keeps_verdict_in_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        // diagnostic methodology whose indicators all lack formulas
        write_outline(
            &layout,
            "b7",
            r#"
classification: {methodology_type: diagnostic}
structure:
  stages:
    - {title: "A", description: "first", order: 1}
  indicators:
    - {name: "I1", description: "d1"}
    - {name: "I2", description: "d2"}
"#,
        );

        let invoker = StubInvoker::new();
        let mut runner =
            Runner::new(config("b7", "C,D", true), layout.clone(), &invoker, None).unwrap();
        let code = runner.run().await.unwrap();
        assert_eq!(code, EXIT_RUNTIME_FAIL);

        let manifest = RunManifest::load(&layout.manifest_path("test_b7")).unwrap();
        assert_eq!(manifest.qa.approved, Some(false));
        assert_eq!(manifest.qa.blockers, Some(1));
        assert_eq!(manifest.steps[1].status, StepStatus::Fail);
        assert!(manifest.steps[1]
            .error
            .as_deref()
            .unwrap()
            .contains("QA not approved"));
    }

    #[tokio::test]
    async fn manifest_stays_valid_after_every_step() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        write_outline(&layout, "b6", GOOD_OUTLINE);

        let invoker = StubInvoker::new();
        let mut runner =
            Runner::new(config("b6", "C,D", true), layout.clone(), &invoker, None).unwrap();

        // before any step: zero-step manifest already readable
        let manifest = RunManifest::load(&layout.manifest_path("test_b6")).unwrap();
        assert!(manifest.steps.is_empty());

        runner.run().await.unwrap();
        let manifest = RunManifest::load(&layout.manifest_path("test_b6")).unwrap();
        assert_eq!(manifest.steps.len(), 2);
    }
}
