use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub fn default_run_id() -> String {
    format!("kb_{}", chrono::Utc::now().timestamp())
}

/// Write JSON through a temp file in the target directory so readers never
/// observe a partially written manifest.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Path has no parent: {}", path.display()))?;
    std::fs::create_dir_all(parent)?;
    let json = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    let tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
    std::fs::write(tmp.path(), json)?;
    tmp.persist(path)
        .with_context(|| format!("Failed to persist {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Ok,
    Fail,
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Ok => write!(f, "ok"),
            StepStatus::Fail => write!(f, "fail"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub artifacts: Vec<String>,
    pub started_at: String,
    pub ended_at: String,
    pub duration_sec: f64,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QaRecord {
    #[serde(default)]
    pub approved: Option<bool>,
    #[serde(default)]
    pub blockers: Option<u64>,
    #[serde(default)]
    pub warnings: Option<u64>,
    /// PASS | FAIL, absent until the Gate step ran.
    #[serde(default)]
    pub gate_status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub require_gate_pass: bool,
}

/// Append-only per-run record, rewritten after every step transition so a
/// reader mid-run always sees valid JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub book_id: String,
    pub source_path: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,
    pub steps: Vec<StepRecord>,
    pub qa: QaRecord,
    pub policy: PolicyRecord,
}

impl RunManifest {
    pub fn new(
        run_id: &str,
        book_id: &str,
        source_path: &str,
        sources: Option<Vec<String>>,
        require_gate_pass: bool,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            book_id: book_id.to_string(),
            source_path: source_path.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            sources,
            steps: Vec::new(),
            qa: QaRecord::default(),
            policy: PolicyRecord { require_gate_pass },
        }
    }

    pub fn write(&self, run_dir: &Path) -> Result<()> {
        write_json_atomic(&run_dir.join("manifest.json"), self)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest: {}", path.display()))
    }
}
