use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::glossary;
use crate::layout::Layout;
use finkb_graph::{GraphStore, UpsertStats};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub reconcile: bool,
    pub dry_run: bool,
    pub glossary_dir: Option<PathBuf>,
    pub source_repo: String,
    pub source_ref: String,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            reconcile: false,
            dry_run: false,
            glossary_dir: None,
            source_repo: "finkb".to_string(),
            source_ref: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StubMatch {
    pub stub_id: String,
    pub canonical_id: String,
    pub match_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnknownStub {
    pub stub_id: String,
    pub stub_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub total_stubs: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub updated_count: usize,
    pub matched_details: Vec<StubMatch>,
    pub unknown_terms: Vec<UnknownStub>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub upserts: HashMap<String, UpsertStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciliation: Option<ReconcileReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub agent: String,
    pub glossary_dir: String,
    pub source: Value,
    pub loaded_terms: usize,
    pub prepared_docs: usize,
    pub errors: Vec<Value>,
    pub dry_run: bool,
    pub timestamp: String,
    pub result: SyncOutcome,
}

/// Sync canonical glossary terms into `glossary_terms` and optionally
/// reconcile stubs the publisher created along the way.
pub async fn run_sync(
    layout: &Layout,
    store: &dyn GraphStore,
    options: &SyncOptions,
) -> Result<SyncReport> {
    let glossary_dir = options
        .glossary_dir
        .clone()
        .unwrap_or_else(|| layout.glossary_dir());

    let source = json!({
        "repo": options.source_repo,
        "ref": options.source_ref,
        "path": glossary_dir
            .strip_prefix(layout.root())
            .unwrap_or(&glossary_dir)
            .display()
            .to_string(),
        "agent": "glossary-sync",
    });

    let raw_terms = glossary::load_raw_terms(&glossary_dir)?;
    tracing::info!(count = raw_terms.len(), "Loaded glossary terms");

    let now = chrono::Utc::now().to_rfc3339();
    let mut docs = Vec::new();
    let mut errors = Vec::new();
    for raw in &raw_terms {
        match glossary::make_term_doc(raw, &source, &now) {
            Ok(doc) => docs.push(doc),
            Err(e) => errors.push(json!({"term": raw, "error": e.to_string()})),
        }
    }
    let docs = glossary::reduce_terms(docs);

    let mut report = SyncReport {
        agent: "glossary-sync".to_string(),
        glossary_dir: glossary_dir.display().to_string(),
        source,
        loaded_terms: raw_terms.len(),
        prepared_docs: docs.len(),
        errors,
        dry_run: options.dry_run,
        timestamp: now.clone(),
        result: SyncOutcome::default(),
    };

    if options.dry_run {
        tracing::info!("Dry run: not writing to the graph");
        write_report(layout, &report)?;
        return Ok(report);
    }

    store
        .ensure_collections()
        .await
        .map_err(|e| anyhow::anyhow!("Graph unavailable: {e}"))?;

    let canonical = docs.clone();
    let stats = finkb_graph::upsert_batch(store, "glossary_terms", docs)
        .await
        .map_err(|e| anyhow::anyhow!("Upsert failed: {e}"))?;
    report.result.upserts.insert("glossary_terms".to_string(), stats);
    tracing::info!(
        inserted = stats.inserted,
        updated = stats.updated,
        "Glossary terms upserted"
    );

    if options.reconcile {
        report.result.reconciliation = Some(reconcile_stubs(store, &canonical, &now).await?);
    }

    write_report(layout, &report)?;
    Ok(report)
}

/// Match `needs_definition` stubs against canonical terms: exact term id
/// first, then normalized name/alias. Matched stubs are patched to
/// `merged` with a `merged_into` pointer.
pub async fn reconcile_stubs(
    store: &dyn GraphStore,
    canonical: &[Value],
    now: &str,
) -> Result<ReconcileReport> {
    let canonical_ids: std::collections::HashSet<&str> = canonical
        .iter()
        .filter_map(|t| t.get("_key").and_then(|v| v.as_str()))
        .collect();

    let mut name_index: HashMap<String, String> = HashMap::new();
    for term in canonical {
        let Some(key) = term.get("_key").and_then(|v| v.as_str()) else {
            continue;
        };
        if let Some(name) = term.get("name").and_then(|v| v.as_str()) {
            name_index.insert(glossary::normalize_text(name), key.to_string());
        }
        if let Some(aliases) = term.get("aliases").and_then(|v| v.as_array()) {
            for alias in aliases.iter().filter_map(|v| v.as_str()) {
                name_index.insert(glossary::normalize_text(alias), key.to_string());
            }
        }
    }

    let stubs = store
        .documents_by_status("glossary_terms", "needs_definition")
        .await
        .map_err(|e| anyhow::anyhow!("Stub query failed: {e}"))?;

    let mut matched = Vec::new();
    let mut unknown = Vec::new();

    for stub in &stubs {
        let stub_id = stub
            .get("_key")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let stub_name = glossary::normalize_text(
            stub.get("name").and_then(|v| v.as_str()).unwrap_or(""),
        );

        if canonical_ids.contains(stub_id.as_str()) {
            matched.push(StubMatch {
                stub_id: stub_id.clone(),
                canonical_id: stub_id,
                match_type: "exact_id".to_string(),
            });
        } else if let Some(canonical_id) = name_index.get(&stub_name) {
            matched.push(StubMatch {
                stub_id,
                canonical_id: canonical_id.clone(),
                match_type: "name".to_string(),
            });
        } else {
            unknown.push(UnknownStub {
                stub_id,
                stub_name: stub.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            });
        }
    }

    let mut updated_count = 0usize;
    for m in &matched {
        store
            .patch_document(
                "glossary_terms",
                &m.stub_id,
                json!({
                    "status": "merged",
                    "merged_into": m.canonical_id,
                    "merged_at": now,
                }),
            )
            .await
            .map_err(|e| anyhow::anyhow!("Stub update failed for {}: {e}", m.stub_id))?;
        updated_count += 1;
    }

    tracing::info!(
        total = stubs.len(),
        matched = matched.len(),
        unknown = unknown.len(),
        "Stub reconciliation complete"
    );

    Ok(ReconcileReport {
        total_stubs: stubs.len(),
        matched: matched.len(),
        unmatched: unknown.len(),
        updated_count,
        matched_details: matched,
        unknown_terms: unknown,
    })
}

fn write_report(layout: &Layout, report: &SyncReport) -> Result<()> {
    let path = layout.glossary_sync_report_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(report).context("Failed to serialize sync report")?;
    std::fs::write(&path, json)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use finkb_graph::MemoryStore;

    fn fixture_layout() -> (tempfile::TempDir, Layout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let glossary = layout.glossary_dir();
        std::fs::create_dir_all(&glossary).unwrap();
        std::fs::write(
            glossary.join("terms.yaml"),
            "- {term_id: term_ebitda, name: EBITDA, definition: \"Earnings measure\"}\n\
             - {term_id: term_roi, name: ROI, definition: \"Return on investment\", aliases: [рентабельность]}\n",
        )
        .unwrap();
        (dir, layout)
    }

    #[tokio::test]
    async fn sync_upserts_canonical_terms() {
        let (_dir, layout) = fixture_layout();
        let store = MemoryStore::new();
        let report = run_sync(&layout, &store, &SyncOptions::default()).await.unwrap();

        assert_eq!(report.loaded_terms, 2);
        assert_eq!(report.prepared_docs, 2);
        let stats = report.result.upserts["glossary_terms"];
        assert_eq!(stats.inserted, 2);
        assert_eq!(store.count("glossary_terms").await.unwrap(), 2);
        assert!(layout.glossary_sync_report_path().exists());
    }

    #[tokio::test]
    async fn dry_run_touches_nothing() {
        let (_dir, layout) = fixture_layout();
        let store = MemoryStore::new();
        let options = SyncOptions {
            dry_run: true,
            ..SyncOptions::default()
        };
        let report = run_sync(&layout, &store, &options).await.unwrap();
        assert!(report.result.upserts.is_empty());
        assert_eq!(store.count("glossary_terms").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reconcile_merges_stub_by_alias() {
        let (_dir, layout) = fixture_layout();
        let store = MemoryStore::new();
        store.ensure_collections().await.unwrap();
        // a stub the publisher would have created
        store
            .insert_document(
                "glossary_terms",
                json!({
                    "_key": "term_рентабельность",
                    "term_id": "term_рентабельность",
                    "name": "рентабельность",
                    "definition": "",
                    "status": "needs_definition",
                }),
            )
            .await
            .unwrap();

        let options = SyncOptions {
            reconcile: true,
            ..SyncOptions::default()
        };
        let report = run_sync(&layout, &store, &options).await.unwrap();
        let rec = report.result.reconciliation.unwrap();
        assert_eq!(rec.total_stubs, 1);
        assert_eq!(rec.matched, 1);
        assert_eq!(rec.matched_details[0].match_type, "name");
        assert_eq!(rec.matched_details[0].canonical_id, "term_roi");

        let stub = store
            .get_document("glossary_terms", "term_рентабельность")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stub["status"], "merged");
        assert_eq!(stub["merged_into"], "term_roi");
    }

    #[tokio::test]
    async fn reconcile_reports_unknown_stubs() {
        let (_dir, layout) = fixture_layout();
        let store = MemoryStore::new();
        store.ensure_collections().await.unwrap();
        store
            .insert_document(
                "glossary_terms",
                json!({
                    "_key": "term_mystery",
                    "name": "mystery metric",
                    "status": "needs_definition",
                }),
            )
            .await
            .unwrap();

        let options = SyncOptions {
            reconcile: true,
            ..SyncOptions::default()
        };
        let report = run_sync(&layout, &store, &options).await.unwrap();
        let rec = report.result.reconciliation.unwrap();
        assert_eq!(rec.unmatched, 1);
        assert_eq!(rec.unknown_terms[0].stub_id, "term_mystery");

        let stub = store
            .get_document("glossary_terms", "term_mystery")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stub["status"], "needs_definition");
    }
}
