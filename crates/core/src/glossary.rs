use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use anyhow::{bail, Result};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Matching form for term names and aliases: lowercase, `ё→е`, collapsed
/// whitespace.
pub fn normalize_text(s: &str) -> String {
    let lowered = s.trim().to_lowercase().replace('ё', "е");
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stable `_key`/`term_id`: normalized text with non-word runs collapsed
/// to underscores and a `term_` prefix enforced. Cyrillic survives, the
/// glossary is keyed in its source language.
pub fn normalize_term_id(term_id: &str) -> String {
    let normalized = normalize_text(term_id);
    let re = regex::Regex::new(r"[^\w\-:]+").expect("valid term id pattern");
    let underscored = re.replace_all(&normalized, "_");
    let collapse = regex::Regex::new(r"_+").expect("valid collapse pattern");
    let collapsed = collapse.replace_all(&underscored, "_");
    let trimmed = collapsed.trim_matches('_');
    if trimmed.starts_with("term_") {
        trimmed.to_string()
    } else {
        format!("term_{trimmed}")
    }
}

pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn read_terms_file(path: &Path) -> Vec<Value> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable glossary file");
            return Vec::new();
        }
    };
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let data: Option<Value> = match ext {
        "yaml" | "yml" => serde_yaml::from_str(&content).ok(),
        "json" => serde_json::from_str(&content).ok(),
        _ => None,
    };

    let source_file = path.display().to_string();
    let tag = |mut item: Value| -> Option<Value> {
        let obj = item.as_object_mut()?;
        obj.insert("_source_file".to_string(), json!(source_file));
        Some(item)
    };

    match data {
        Some(Value::Object(_)) => data.and_then(tag).into_iter().collect(),
        Some(Value::Array(items)) => items.into_iter().filter_map(tag).collect(),
        _ => Vec::new(),
    }
}

/// Read raw glossary terms from a directory tree of YAML/JSON files, each
/// holding a single term or a list. Every term gets `_source_file` for
/// lineage.
pub fn load_raw_terms(glossary_dir: &Path) -> Result<Vec<Value>> {
    if !glossary_dir.is_dir() {
        bail!("Glossary dir not found: {}", glossary_dir.display());
    }

    let mut terms = Vec::new();
    let mut stack = vec![glossary_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries: Vec<_> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        entries.sort();
        for path in entries {
            if path.is_dir() {
                stack.push(path);
            } else if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml") | Some("json")
            ) {
                terms.extend(read_terms_file(&path));
            }
        }
    }
    Ok(terms)
}

fn first_string(raw: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| {
        raw.get(*k)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
    })
}

fn string_list(raw: &Value, keys: &[&str]) -> Vec<String> {
    for key in keys {
        match raw.get(*key) {
            Some(Value::Array(items)) => {
                return items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            Some(Value::String(s)) => {
                return s
                    .split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect();
            }
            _ => {}
        }
    }
    Vec::new()
}

/// Build the canonical `glossary_terms` document from a loosely-shaped raw
/// term. Field aliases mirror what real glossary files carry.
pub fn make_term_doc(raw: &Value, source: &Value, now: &str) -> Result<Value> {
    let term_id = first_string(raw, &["term_id", "id", "_key", "slug", "term", "name", "title"])
        .ok_or_else(|| anyhow::anyhow!("Cannot determine term_id from: {raw}"))?;
    let term_id = normalize_term_id(&term_id);

    let name = first_string(raw, &["name", "title"]).unwrap_or_else(|| term_id.clone());
    let definition =
        first_string(raw, &["definition", "desc", "description"]).unwrap_or_default();
    let aliases = string_list(raw, &["aliases", "synonyms"]);
    let tags = string_list(raw, &["tags", "domain"]);
    let version = first_string(raw, &["version"]).unwrap_or_else(|| "1.0".to_string());
    let status = first_string(raw, &["status"]).unwrap_or_else(|| "active".to_string());

    let content_text = [
        name.trim().to_string(),
        definition.trim().to_string(),
        aliases.join(" "),
        tags.join(" "),
    ]
    .join("\n")
    .trim()
    .to_string();

    Ok(json!({
        "_key": term_id,
        "term_id": term_id,
        "name": name,
        "definition": definition,
        "aliases": aliases,
        "tags": tags,
        "status": status,
        "version": version,
        "entity_type": "term",
        "content_text": content_text,
        "content_hash": content_hash(&content_text),
        "source": source,
        "created_at": now,
        "updated_at": now,
    }))
}

/// Pure reducer over a term batch: de-duplicate by `_key`, union aliases
/// and tags (sorted), prefer the first non-empty definition. Input order
/// decides which duplicate wins the scalar fields.
pub fn reduce_terms(docs: Vec<Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    let mut index: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

    for doc in docs {
        let key = match doc.get("_key").and_then(|v| v.as_str()) {
            Some(k) => k.to_string(),
            None => continue,
        };
        match index.get(&key) {
            None => {
                index.insert(key, out.len());
                out.push(doc);
            }
            Some(&pos) => {
                let existing = &mut out[pos];
                for field in ["aliases", "tags"] {
                    let mut merged: BTreeSet<String> = existing
                        .get(field)
                        .and_then(|v| v.as_array())
                        .map(|a| {
                            a.iter()
                                .filter_map(|v| v.as_str())
                                .map(String::from)
                                .collect()
                        })
                        .unwrap_or_default();
                    if let Some(additional) = doc.get(field).and_then(|v| v.as_array()) {
                        merged.extend(additional.iter().filter_map(|v| v.as_str()).map(String::from));
                    }
                    existing[field] = json!(merged.into_iter().collect::<Vec<_>>());
                }
                let existing_def = existing
                    .get("definition")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let new_def = doc.get("definition").and_then(|v| v.as_str()).unwrap_or("");
                if existing_def.is_empty() && !new_def.is_empty() {
                    existing["definition"] = json!(new_def);
                }
            }
        }
    }
    out
}

/// Term-id index for the QA glossary check. Accepts a directory of term
/// files, or a single YAML/JSON index file.
pub fn load_term_index(path: &Path) -> Result<HashSet<String>> {
    if path.is_dir() {
        let raw = load_raw_terms(path)?;
        return Ok(raw
            .iter()
            .filter_map(|t| {
                first_string(t, &["term_id", "id", "_key", "slug", "term", "name", "title"])
            })
            .map(|id| normalize_term_id(&id))
            .collect());
    }
    if !path.exists() {
        bail!("Glossary index not found: {}", path.display());
    }

    let content = std::fs::read_to_string(path)?;
    let data: Value = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content)?,
        _ => serde_yaml::from_str(&content)?,
    };

    let mut ids = HashSet::new();
    if let Some(list) = data.get("term_ids").and_then(|v| v.as_array()) {
        ids.extend(list.iter().filter_map(|v| v.as_str()).map(String::from));
    }
    if let Some(terms) = data.get("terms").and_then(|v| v.as_array()) {
        ids.extend(
            terms
                .iter()
                .filter_map(|t| t.get("term_id"))
                .filter_map(|v| v.as_str())
                .map(String::from),
        );
    }
    if let Some(items) = data.as_array() {
        ids.extend(
            items
                .iter()
                .filter_map(|t| t.get("term_id"))
                .filter_map(|v| v.as_str())
                .map(String::from),
        );
    }
    if let Some(id) = data.get("term_id").and_then(|v| v.as_str()) {
        ids.insert(id.to_string());
    }
    Ok(ids)
}
