use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::compiled::CompiledMethodology;
use crate::layout::Layout;
use crate::outline::normalize_name;
use finkb_graph::{edge_key, GraphStore, UpsertStats};

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub skip_qa: bool,
    pub source_repo: String,
    pub source_ref: String,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            skip_qa: false,
            source_repo: "finkb".to_string(),
            source_ref: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishReport {
    pub methodology_id: String,
    pub published_at: String,
    pub agent: String,
    pub source_yaml: String,
    pub compiled_hash: String,
    pub qa_approved: bool,
    pub entities: BTreeMap<String, UpsertStats>,
    pub edges: BTreeMap<String, UpsertStats>,
    pub warnings: Vec<String>,
}

struct EntityBatch {
    entities: BTreeMap<String, Vec<Value>>,
    edges: BTreeMap<String, Vec<Value>>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn doc(
    key: &str,
    content_text: String,
    source: &Value,
    now: &str,
    extra: Value,
) -> Value {
    let mut doc = json!({
        "_key": key,
        "content_text": content_text,
        "content_hash": sha256_hex(content_text.as_bytes()),
        "source": source,
        "created_at": now,
        "updated_at": now,
    });
    if let (Some(target), Some(fields)) = (doc.as_object_mut(), extra.as_object()) {
        for (k, v) in fields {
            target.insert(k.clone(), v.clone());
        }
    }
    doc
}

fn join_fields(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// A stage "uses" a tool/indicator when its text mentions the entity by
/// normalized name. The flat canonical form carries no explicit
/// assignment, so mention matching is the deterministic association rule.
fn stage_mentions(stage_text: &str, entity_name: &str) -> bool {
    let name = normalize_name(entity_name);
    !name.is_empty() && stage_text.contains(&name)
}

fn extract(
    methodology: &CompiledMethodology,
    compiled_hash: &str,
    source: &Value,
    now: &str,
) -> EntityBatch {
    let mut entities: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    let mut edges: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    let id = &methodology.metadata.id;

    let methodology_text = join_fields(&[
        methodology.metadata.title.as_str(),
        methodology.classification.methodology_type.as_str(),
    ]);
    entities.entry("methodologies".to_string()).or_default().push(doc(
        id,
        methodology_text,
        source,
        now,
        json!({
            "methodology_id": id,
            "title": methodology.metadata.title,
            "methodology_type": methodology.classification.methodology_type,
            "compiled_hash": compiled_hash,
        }),
    ));

    let mut edge = |collection: &str, from: String, to: String, extra: Value| {
        let key = edge_key(&from, &to, collection);
        let mut e = json!({
            "_key": key,
            "_from": from,
            "_to": to,
            "source": source,
            "created_at": now,
        });
        if let (Some(target), Some(fields)) = (e.as_object_mut(), extra.as_object()) {
            for (k, v) in fields {
                target.insert(k.clone(), v.clone());
            }
        }
        edges.entry(collection.to_string()).or_default().push(e);
    };

    for stage in &methodology.structure.stages {
        let content = join_fields(&[stage.title.as_str(), stage.description.as_str()]);
        entities.entry("stages".to_string()).or_default().push(doc(
            &stage.id,
            content,
            source,
            now,
            json!({
                "stage_id": stage.id,
                "title": stage.title,
                "description": stage.description,
                "order": stage.order,
                "order_display": stage.order_display,
                "status": "active",
            }),
        ));
        edge(
            "methodology_has_stage",
            format!("methodologies/{id}"),
            format!("stages/{}", stage.id),
            json!({"order": stage.order}),
        );
    }

    for tool in &methodology.structure.tools {
        let content = join_fields(&[tool.title.as_str(), tool.description.as_str()]);
        entities.entry("tools".to_string()).or_default().push(doc(
            &tool.id,
            content,
            source,
            now,
            json!({
                "tool_id": tool.id,
                "title": tool.title,
                "type": tool.tool_type,
                "description": tool.description,
            }),
        ));
    }

    for indicator in &methodology.structure.indicators {
        let content = join_fields(&[
            indicator.name.as_str(),
            indicator.description.as_str(),
            indicator.formula.as_str(),
        ]);
        entities.entry("indicators".to_string()).or_default().push(doc(
            &indicator.id,
            content,
            source,
            now,
            json!({
                "indicator_id": indicator.id,
                "name": indicator.name,
                "description": indicator.description,
                "formula": indicator.formula,
            }),
        ));
    }

    for rule in &methodology.structure.rules {
        let content = join_fields(&[rule.condition.as_str(), rule.action.as_str()]);
        entities.entry("rules".to_string()).or_default().push(doc(
            &rule.id,
            content,
            source,
            now,
            json!({
                "rule_id": rule.id,
                "condition": rule.condition,
                "action": rule.action,
                "severity": rule.severity,
            }),
        ));
    }

    // Mention-derived stage associations
    for stage in &methodology.structure.stages {
        let stage_text = normalize_name(&join_fields(&[stage.title.as_str(), stage.description.as_str()]));
        for tool in &methodology.structure.tools {
            if stage_mentions(&stage_text, &tool.title) {
                edge(
                    "stage_uses_tool",
                    format!("stages/{}", stage.id),
                    format!("tools/{}", tool.id),
                    json!({}),
                );
            }
        }
        for indicator in &methodology.structure.indicators {
            if stage_mentions(&stage_text, &indicator.name) {
                edge(
                    "stage_uses_indicator",
                    format!("stages/{}", stage.id),
                    format!("indicators/{}", indicator.id),
                    json!({}),
                );
            }
        }
        for rule in &methodology.structure.rules {
            if stage_mentions(&stage_text, &rule.condition) {
                edge(
                    "stage_has_rule",
                    format!("stages/{}", stage.id),
                    format!("rules/{}", rule.id),
                    json!({}),
                );
            }
        }
    }

    // Formula-derived indicator dependencies
    for indicator in &methodology.structure.indicators {
        if indicator.formula.is_empty() {
            continue;
        }
        let formula = normalize_name(&indicator.formula);
        for other in &methodology.structure.indicators {
            if other.id == indicator.id {
                continue;
            }
            let name = normalize_name(&other.name);
            if !name.is_empty() && formula.contains(&name) {
                edge(
                    "indicator_depends_on",
                    format!("indicators/{}", indicator.id),
                    format!("indicators/{}", other.id),
                    json!({}),
                );
            }
        }
    }

    // Glossary term references from the semantic linker
    if let Some(refs) = &methodology.glossary_references {
        for found in &refs.found_terms {
            let (collection, from) = match found.entity_id.as_deref() {
                Some(e) if e.starts_with("stage_") => ("stage_uses_term", format!("stages/{e}")),
                Some(e) if e.starts_with("ind_") => {
                    ("indicator_uses_term", format!("indicators/{e}"))
                }
                Some(e) if e.starts_with("tool_") => ("tool_uses_term", format!("tools/{e}")),
                _ => ("methodology_uses_term", format!("methodologies/{id}")),
            };
            edge(
                collection,
                from,
                format!("glossary_terms/{}", found.term_id),
                json!({"term_name": found.term_name}),
            );
        }
    }

    EntityBatch { entities, edges }
}

/// Create a `needs_definition` placeholder for a dangling glossary target
/// and report it as a QA warning.
async fn create_term_stub(
    store: &dyn GraphStore,
    term_key: &str,
    term_name: Option<&str>,
    referenced_by: &str,
    source: &Value,
    now: &str,
    warnings: &mut Vec<String>,
) -> Result<()> {
    let stub = json!({
        "_key": term_key,
        "term_id": term_key,
        "name": term_name.unwrap_or(term_key),
        "definition": "",
        "aliases": [],
        "status": "needs_definition",
        "entity_type": "term",
        "source": source,
        "created_at": now,
        "updated_at": now,
    });
    store
        .insert_document("glossary_terms", stub)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create term stub {term_key}: {e}"))?;
    warnings.push(format!(
        "Created glossary stub '{term_key}' (needs_definition), referenced by {referenced_by}"
    ));
    Ok(())
}

/// Idempotent projection of a compiled methodology into the graph.
pub async fn publish_methodology(
    layout: &Layout,
    store: &dyn GraphStore,
    book_id: &str,
    options: &PublishOptions,
) -> Result<PublishReport> {
    let yaml_path = layout.methodology_yaml_path(book_id);
    if !yaml_path.exists() {
        bail!("Methodology YAML not found: {}", yaml_path.display());
    }
    let methodology = CompiledMethodology::load(&yaml_path)?;
    let compiled_hash = sha256_hex(&std::fs::read(&yaml_path)?);

    // QA gatekeeping
    if !options.skip_qa {
        let qa_path = layout.qa_result_path(book_id);
        if !qa_path.exists() {
            bail!("Cannot publish: no QA result at {}", qa_path.display());
        }
        let qa: Value = serde_json::from_str(&std::fs::read_to_string(&qa_path)?)
            .with_context(|| format!("Failed to parse {}", qa_path.display()))?;
        if qa.get("approved").and_then(|v| v.as_bool()) != Some(true) {
            bail!(
                "Cannot publish: QA not approved (blockers={})",
                qa.get("summary")
                    .and_then(|s| s.get("blockers"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0)
            );
        }
    } else {
        tracing::warn!(book_id, "Skipping QA approval check (forced publish)");
    }

    store
        .ensure_collections()
        .await
        .map_err(|e| anyhow::anyhow!("Graph unavailable: {e}"))?;

    let source_yaml = yaml_path
        .strip_prefix(layout.root())
        .unwrap_or(&yaml_path)
        .display()
        .to_string();
    let source = json!({
        "repo": options.source_repo,
        "ref": options.source_ref,
        "path": source_yaml,
        "agent": "publisher",
    });
    let now = chrono::Utc::now().to_rfc3339();

    let batch = extract(&methodology, &compiled_hash, &source, &now);

    let mut entity_stats: BTreeMap<String, UpsertStats> = BTreeMap::new();
    for (collection, docs) in batch.entities {
        let stats = finkb_graph::upsert_batch(store, &collection, docs)
            .await
            .map_err(|e| anyhow::anyhow!("Entity upsert failed for {collection}: {e}"))?;
        entity_stats.insert(collection, stats);
    }

    let mut warnings = Vec::new();
    let mut edge_stats: BTreeMap<String, UpsertStats> = BTreeMap::new();
    for (collection, edge_docs) in batch.edges {
        let mut stats = UpsertStats::default();
        for edge_doc in edge_docs {
            let to = edge_doc.get("_to").and_then(|v| v.as_str()).unwrap_or("");
            if let Some(term_key) = to.strip_prefix("glossary_terms/") {
                let exists = store
                    .get_document("glossary_terms", term_key)
                    .await
                    .map_err(|e| anyhow::anyhow!("Term lookup failed: {e}"))?
                    .is_some();
                if !exists {
                    let term_name = edge_doc.get("term_name").and_then(|v| v.as_str());
                    let from = edge_doc.get("_from").and_then(|v| v.as_str()).unwrap_or("");
                    create_term_stub(
                        store,
                        term_key,
                        term_name,
                        from,
                        &source,
                        &now,
                        &mut warnings,
                    )
                    .await?;
                }
            }
            let inserted = finkb_graph::upsert_document(store, &collection, edge_doc)
                .await
                .map_err(|e| anyhow::anyhow!("Edge upsert failed for {collection}: {e}"))?;
            if inserted {
                stats.inserted += 1;
            } else {
                stats.updated += 1;
            }
        }
        edge_stats.insert(collection, stats);
    }

    let report = PublishReport {
        methodology_id: book_id.to_string(),
        published_at: now,
        agent: "publisher".to_string(),
        source_yaml,
        compiled_hash,
        qa_approved: !options.skip_qa,
        entities: entity_stats,
        edges: edge_stats,
        warnings,
    };

    let receipt_path = layout.publish_receipt_path(book_id);
    if let Some(parent) = receipt_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        &receipt_path,
        serde_json::to_string_pretty(&report).context("Failed to serialize publish report")?,
    )
    .with_context(|| format!("Failed to write {}", receipt_path.display()))?;

    tracing::info!(
        book_id,
        entities = report.entities.values().map(|s| s.inserted + s.updated).sum::<u64>(),
        edges = report.edges.values().map(|s| s.inserted + s.updated).sum::<u64>(),
        warnings = report.warnings.len(),
        "Published methodology"
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use finkb_graph::MemoryStore;

    const COMPILED: &str = r#"
metadata:
  id: fin-diag
  title: "Финансовая диагностика"
  created_at: "2024-01-01T00:00:00Z"
  source: {work_outline: "work/fin-diag/outline_fin-diag.yaml"}
classification: {methodology_type: diagnostic}
structure:
  stages:
    - id: stage_001
      title: "Оценка EBITDA"
      description: "Считаем EBITDA, используя чек-лист аудита."
      order: 1
      order_display: "1"
    - id: stage_002
      title: "Планирование"
      description: "Строим план."
      order: 2
      order_display: "2"
  tools:
    - {id: tool_001, title: "Чек-лист аудита", type: checklist, description: "Список проверок."}
  indicators:
    - {id: ind_001, name: "EBITDA", description: "Прибыль до вычетов", formula: "EBITDA = Выручка - Расходы"}
    - {id: ind_002, name: "Маржа", description: "Доля прибыли", formula: "Маржа = EBITDA / Выручка"}
  rules:
    - {id: rule_001, condition: "маржа < 10%", action: "пересмотреть цены", severity: critical}
glossary_references:
  found_terms:
    - {term_id: term_ebitda, entity_id: ind_001, term_name: "EBITDA"}
"#;

    fn fixture(approved: bool) -> (tempfile::TempDir, Layout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let yaml_path = layout.methodology_yaml_path("fin-diag");
        std::fs::create_dir_all(yaml_path.parent().unwrap()).unwrap();
        std::fs::write(&yaml_path, COMPILED).unwrap();

        let qa_dir = layout.qa_work_dir("fin-diag");
        std::fs::create_dir_all(&qa_dir).unwrap();
        std::fs::write(
            layout.qa_result_path("fin-diag"),
            format!(r#"{{"book_id": "fin-diag", "approved": {approved}, "summary": {{"blockers": 1}}}}"#),
        )
        .unwrap();
        (dir, layout)
    }

    #[tokio::test]
    async fn publish_refused_without_approval() {
        let (_dir, layout) = fixture(false);
        let store = MemoryStore::new();
        let err = publish_methodology(&layout, &store, "fin-diag", &PublishOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("QA not approved"));
    }

    #[tokio::test]
    async fn skip_qa_overrides_refusal() {
        let (_dir, layout) = fixture(false);
        let store = MemoryStore::new();
        let options = PublishOptions {
            skip_qa: true,
            ..PublishOptions::default()
        };
        let report = publish_methodology(&layout, &store, "fin-diag", &options)
            .await
            .unwrap();
        assert!(!report.qa_approved);
        assert_eq!(store.count("methodologies").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn publish_creates_entities_edges_and_receipt() {
        let (_dir, layout) = fixture(true);
        let store = MemoryStore::new();
        let report = publish_methodology(&layout, &store, "fin-diag", &PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(report.entities["stages"].inserted, 2);
        assert_eq!(report.entities["indicators"].inserted, 2);
        assert_eq!(report.edges["methodology_has_stage"].inserted, 2);
        // stage_001 mentions both the tool and EBITDA
        assert_eq!(report.edges["stage_uses_tool"].inserted, 1);
        assert!(report.edges["stage_uses_indicator"].inserted >= 1);
        // Маржа formula references EBITDA
        assert_eq!(report.edges["indicator_depends_on"].inserted, 1);
        assert!(layout.publish_receipt_path("fin-diag").exists());
    }

    #[tokio::test]
    async fn republish_is_idempotent() {
        let (_dir, layout) = fixture(true);
        let store = MemoryStore::new();
        let first = publish_methodology(&layout, &store, "fin-diag", &PublishOptions::default())
            .await
            .unwrap();
        let stage_count = store.count("stages").await.unwrap();

        let second = publish_methodology(&layout, &store, "fin-diag", &PublishOptions::default())
            .await
            .unwrap();

        for (collection, stats) in &second.entities {
            assert_eq!(stats.inserted, 0, "collection {collection} re-inserted");
            assert_eq!(
                stats.updated,
                first.entities[collection].inserted,
                "collection {collection} count drifted"
            );
        }
        for (collection, stats) in &second.edges {
            assert_eq!(stats.inserted, 0, "edges {collection} re-inserted");
        }
        assert_eq!(store.count("stages").await.unwrap(), stage_count);
        // the stub was created on the first run only
        assert_eq!(second.warnings.len(), 0);
    }

    #[tokio::test]
    async fn dangling_term_creates_exactly_one_stub_with_warning() {
        let (_dir, layout) = fixture(true);
        let store = MemoryStore::new();
        let report = publish_methodology(&layout, &store, "fin-diag", &PublishOptions::default())
            .await
            .unwrap();

        let stub = store
            .get_document("glossary_terms", "term_ebitda")
            .await
            .unwrap()
            .expect("stub must exist");
        assert_eq!(stub["status"], "needs_definition");
        assert_eq!(stub["name"], "EBITDA");
        assert_eq!(store.count("glossary_terms").await.unwrap(), 1);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("term_ebitda"));
    }

    #[tokio::test]
    async fn existing_term_is_not_stubbed() {
        let (_dir, layout) = fixture(true);
        let store = MemoryStore::new();
        store.ensure_collections().await.unwrap();
        store
            .insert_document(
                "glossary_terms",
                json!({"_key": "term_ebitda", "name": "EBITDA", "definition": "real", "status": "active"}),
            )
            .await
            .unwrap();

        let report = publish_methodology(&layout, &store, "fin-diag", &PublishOptions::default())
            .await
            .unwrap();
        assert!(report.warnings.is_empty());
        let term = store
            .get_document("glossary_terms", "term_ebitda")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(term["status"], "active");
    }
}
