use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

/// Repo-relative filesystem contract shared by every step. All paths hang
/// off a single base directory so runs are position-independent.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn current() -> Self {
        Self::new(std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // sources/

    pub fn sources_dir(&self) -> PathBuf {
        self.root.join("sources")
    }

    pub fn source_dir(&self, source_id: &str) -> PathBuf {
        self.sources_dir().join(source_id)
    }

    pub fn blocks_path(&self, source_id: &str) -> PathBuf {
        self.source_dir(source_id).join("extracted").join("blocks.jsonl")
    }

    pub fn source_manifest_path(&self, source_id: &str) -> PathBuf {
        self.source_dir(source_id).join("source_manifest.json")
    }

    pub fn source_metadata_path(&self, source_id: &str) -> PathBuf {
        self.source_dir(source_id).join("metadata.json")
    }

    // work/

    pub fn work_dir(&self, book_id: &str) -> PathBuf {
        self.root.join("work").join(book_id)
    }

    /// Canonical outline name used on write.
    pub fn outline_path(&self, book_id: &str) -> PathBuf {
        self.work_dir(book_id).join(format!("outline_{book_id}.yaml"))
    }

    /// Locate the outline on read: suffixed name first, then the legacy
    /// `outline.yaml`, then the first `outline*.yaml` match.
    pub fn find_outline(&self, book_id: &str) -> Result<PathBuf> {
        let work_dir = self.work_dir(book_id);
        let preferred = self.outline_path(book_id);
        if preferred.exists() {
            return Ok(preferred);
        }
        let legacy = work_dir.join("outline.yaml");
        if legacy.exists() {
            return Ok(legacy);
        }
        let pattern = work_dir.join("outline*.yaml");
        let mut candidates: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
            .map(|paths| paths.filter_map(|p| p.ok()).collect())
            .unwrap_or_default();
        candidates.sort();
        match candidates.into_iter().next() {
            Some(p) => Ok(p),
            None => bail!("Outline file not found in: {}", work_dir.display()),
        }
    }

    pub fn qa_work_dir(&self, book_id: &str) -> PathBuf {
        self.work_dir(book_id).join("qa")
    }

    pub fn qa_result_path(&self, book_id: &str) -> PathBuf {
        self.qa_work_dir(book_id).join("qa_result.json")
    }

    pub fn qa_report_path(&self, book_id: &str) -> PathBuf {
        self.qa_work_dir(book_id).join("qa_report.md")
    }

    pub fn approved_flag_path(&self, book_id: &str) -> PathBuf {
        self.qa_work_dir(book_id).join("approved.flag")
    }

    pub fn glossary_sync_report_path(&self) -> PathBuf {
        self.root.join("work").join("glossary_sync_report.json")
    }

    // data/

    pub fn methodology_yaml_path(&self, book_id: &str) -> PathBuf {
        self.root
            .join("data")
            .join("methodologies")
            .join(format!("{book_id}.yaml"))
    }

    pub fn bundles_dir(&self) -> PathBuf {
        self.root.join("data").join("bundles")
    }

    pub fn bundle_path(&self, bundle_id: &str) -> PathBuf {
        self.bundles_dir().join(format!("{bundle_id}.yaml"))
    }

    pub fn glossary_dir(&self) -> PathBuf {
        self.root.join("data").join("glossary")
    }

    pub fn publish_receipt_path(&self, book_id: &str) -> PathBuf {
        self.root
            .join("data")
            .join("published")
            .join(format!("{book_id}.json"))
    }

    // docs/

    pub fn methodology_docs_dir(&self, book_id: &str) -> PathBuf {
        self.root.join("docs").join("methodologies").join(book_id)
    }

    // qa/runs/

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join("qa").join("runs").join(run_id)
    }

    pub fn manifest_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("manifest.json")
    }

    pub fn gate_report_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("b_quality_gate.json")
    }

    pub fn final_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("final.json")
    }

    pub fn summary_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("release").join("summary.md")
    }

    pub fn batch_report_path(&self, batch_id: &str) -> PathBuf {
        self.root.join("qa").join(format!("{batch_id}.md"))
    }

    // schemas/ and templates/

    pub fn compiled_schema_path(&self) -> PathBuf {
        self.root.join("schemas").join("methodology_compiled.schema.json")
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.root.join("templates").join("methodology")
    }
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .map_err(|e| anyhow::anyhow!("Failed to create {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_contract() {
        let layout = Layout::new("/repo");
        assert_eq!(
            layout.blocks_path("book-a"),
            PathBuf::from("/repo/sources/book-a/extracted/blocks.jsonl")
        );
        assert_eq!(
            layout.methodology_yaml_path("book-a"),
            PathBuf::from("/repo/data/methodologies/book-a.yaml")
        );
        assert_eq!(
            layout.manifest_path("kb_1"),
            PathBuf::from("/repo/qa/runs/kb_1/manifest.json")
        );
        assert_eq!(
            layout.summary_path("kb_1"),
            PathBuf::from("/repo/qa/runs/kb_1/release/summary.md")
        );
    }

    #[test]
    fn find_outline_prefers_suffixed_name() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let work = layout.work_dir("b1");
        std::fs::create_dir_all(&work).unwrap();
        std::fs::write(work.join("outline.yaml"), "{}").unwrap();
        std::fs::write(work.join("outline_b1.yaml"), "{}").unwrap();

        let found = layout.find_outline("b1").unwrap();
        assert!(found.ends_with("outline_b1.yaml"));
    }

    #[test]
    fn find_outline_accepts_legacy_name() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let work = layout.work_dir("b1");
        std::fs::create_dir_all(&work).unwrap();
        std::fs::write(work.join("outline.yaml"), "{}").unwrap();

        let found = layout.find_outline("b1").unwrap();
        assert!(found.ends_with("outline.yaml"));
    }

    #[test]
    fn find_outline_errors_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        std::fs::create_dir_all(layout.work_dir("b1")).unwrap();
        assert!(layout.find_outline("b1").is_err());
    }
}
