use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::layout::Layout;

/// Hints left next to an extracted source by the extraction stage.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceManifest {
    #[serde(default)]
    pub signals: SourceSignals,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceSignals {
    #[serde(default)]
    pub candidate_methodology_ids: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
}

/// Explicit multi-source grouping under `data/bundles/<id>.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub bundle_id: String,
    pub methodology_id: String,
    pub sources: Vec<String>,
}

pub fn load_source_manifest(layout: &Layout, source_id: &str) -> Result<Option<SourceManifest>> {
    let path = layout.source_manifest_path(source_id);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let manifest = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(manifest))
}

/// Top candidate from the manifest signals, gated by confidence.
pub fn pick_methodology_id(manifest: &SourceManifest, min_confidence: f64) -> Option<String> {
    if manifest.signals.confidence < min_confidence {
        return None;
    }
    manifest.signals.candidate_methodology_ids.first().cloned()
}

pub fn load_bundle(layout: &Layout, bundle_id: &str) -> Result<Bundle> {
    let path = layout.bundle_path(bundle_id);
    if !path.exists() {
        bail!("Bundle not found: {}", path.display());
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let bundle: Bundle = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    if bundle.sources.is_empty() {
        bail!("Bundle 'sources' must be a non-empty list: {}", path.display());
    }
    Ok(bundle)
}

/// Resolve a bundle to `(methodology_id, source paths)`, verifying every
/// source directory exists.
pub fn bundle_sources(layout: &Layout, bundle_id: &str) -> Result<(String, Vec<PathBuf>)> {
    let bundle = load_bundle(layout, bundle_id)?;
    let mut paths = Vec::new();
    for source_id in &bundle.sources {
        let path = layout.source_dir(source_id);
        if !path.exists() {
            bail!("Source not found: {}", path.display());
        }
        paths.push(path);
    }
    Ok((bundle.methodology_id, paths))
}

/// Group every source under `sources/` by the methodology its manifest
/// points at, skipping sources without a confident signal.
pub fn auto_bundle_sources(
    layout: &Layout,
    min_confidence: f64,
) -> Result<BTreeMap<String, Vec<PathBuf>>> {
    let mut bundles: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    let sources_dir = layout.sources_dir();
    if !sources_dir.exists() {
        return Ok(bundles);
    }

    let mut entries: Vec<_> = std::fs::read_dir(&sources_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    entries.sort();

    for source_path in entries {
        let source_id = match source_path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        let Some(manifest) = load_source_manifest(layout, &source_id)? else {
            continue;
        };
        let Some(methodology_id) = pick_methodology_id(&manifest, min_confidence) else {
            continue;
        };
        bundles.entry(methodology_id).or_default().push(source_path);
    }
    Ok(bundles)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(layout: &Layout, source_id: &str, json: &str) {
        let dir = layout.source_dir(source_id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(layout.source_manifest_path(source_id), json).unwrap();
    }

    #[test]
    fn picks_top_candidate_over_threshold() {
        let manifest: SourceManifest = serde_json::from_str(
            r#"{"signals": {"candidate_methodology_ids": ["power-of-one", "other"], "confidence": 0.8}}"#,
        )
        .unwrap();
        assert_eq!(
            pick_methodology_id(&manifest, 0.3).as_deref(),
            Some("power-of-one")
        );
        assert_eq!(pick_methodology_id(&manifest, 0.9), None);
    }

    #[test]
    fn bundle_resolution_checks_sources_exist() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        std::fs::create_dir_all(layout.bundles_dir()).unwrap();
        std::fs::write(
            layout.bundle_path("p1"),
            "bundle_id: p1\nmethodology_id: power-of-one\nsources: [book_01, book_02]\n",
        )
        .unwrap();
        std::fs::create_dir_all(layout.source_dir("book_01")).unwrap();

        // book_02 missing
        assert!(bundle_sources(&layout, "p1").is_err());

        std::fs::create_dir_all(layout.source_dir("book_02")).unwrap();
        let (methodology_id, paths) = bundle_sources(&layout, "p1").unwrap();
        assert_eq!(methodology_id, "power-of-one");
        assert_eq!(paths.len(), 2);
    }

    #[test]
    fn empty_bundle_sources_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        std::fs::create_dir_all(layout.bundles_dir()).unwrap();
        std::fs::write(
            layout.bundle_path("empty"),
            "bundle_id: empty\nmethodology_id: m\nsources: []\n",
        )
        .unwrap();
        assert!(load_bundle(&layout, "empty").is_err());
    }

    #[test]
    fn auto_bundle_groups_by_methodology() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        write_manifest(
            &layout,
            "book_a",
            r#"{"signals": {"candidate_methodology_ids": ["m1"], "confidence": 0.9}}"#,
        );
        write_manifest(
            &layout,
            "book_b",
            r#"{"signals": {"candidate_methodology_ids": ["m1"], "confidence": 0.5}}"#,
        );
        write_manifest(
            &layout,
            "book_c",
            r#"{"signals": {"candidate_methodology_ids": ["m2"], "confidence": 0.1}}"#,
        );
        std::fs::create_dir_all(layout.source_dir("no_manifest")).unwrap();

        let bundles = auto_bundle_sources(&layout, 0.3).unwrap();
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles["m1"].len(), 2);
    }
}
