use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde_json::{json, Value};

use super::{Issue, IssueSeverity};
use crate::layout::Layout;
use crate::outline::{normalize_name, MethodologyType};

fn structure_list<'a>(compiled: &'a Value, key: &str) -> Vec<&'a Value> {
    compiled
        .get("structure")
        .and_then(|s| s.get(key))
        .and_then(|v| v.as_array())
        .map(|a| a.iter().collect())
        .unwrap_or_default()
}

fn str_field<'a>(item: &'a Value, key: &str) -> &'a str {
    item.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

/// Validate the compiled document against the JSON Schema. Every schema
/// error is a BLOCKER; a missing file is one too.
pub fn precheck_schema(compiled_path: &Path, schema: &Value) -> Vec<Issue> {
    if !compiled_path.exists() {
        return vec![Issue::new(
            "ISSUE-001",
            IssueSeverity::Blocker,
            "files",
            "Compiled YAML not found (compiler output missing).",
            json!({"path": compiled_path.display().to_string()}),
            "Run the compiler to produce data/methodologies/<id>.yaml",
        )];
    }

    let content = match std::fs::read_to_string(compiled_path) {
        Ok(c) => c,
        Err(e) => {
            return vec![Issue::new(
                "ISSUE-002",
                IssueSeverity::Blocker,
                "files",
                format!("Failed to read compiled YAML: {e}"),
                json!({"path": compiled_path.display().to_string()}),
                "Check file permissions and re-run the compiler.",
            )];
        }
    };
    let data: Value = match serde_yaml::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            return vec![Issue::new(
                "ISSUE-003",
                IssueSeverity::Blocker,
                "files",
                format!("Compiled YAML is not parseable: {e}"),
                json!({"path": compiled_path.display().to_string()}),
                "Regenerate the compiled YAML.",
            )];
        }
    };

    let validator = match jsonschema::options()
        .with_draft(jsonschema::Draft::Draft202012)
        .build(schema)
    {
        Ok(v) => v,
        Err(e) => {
            return vec![Issue::new(
                "SCHEMA-000",
                IssueSeverity::Blocker,
                "schema",
                format!("Schema itself failed to compile: {e}"),
                json!({"path": compiled_path.display().to_string()}),
                "Fix schemas/methodology_compiled.schema.json",
            )];
        }
    };

    validator
        .iter_errors(&data)
        .enumerate()
        .map(|(idx, error)| {
            Issue::new(
                format!("SCHEMA-{:03}", idx + 1),
                IssueSeverity::Blocker,
                "schema",
                error.to_string(),
                json!({
                    "path": compiled_path.display().to_string(),
                    "pointer": error.instance_path().to_string(),
                }),
                "Fix compiler output or schema mismatch.",
            )
        })
        .collect()
}

/// ID format and uniqueness per entity kind: malformed is MAJOR, duplicate
/// is BLOCKER.
pub fn precheck_ids(compiled: &Value) -> Vec<Issue> {
    let kinds: &[(&str, &str, &str)] = &[
        ("stage", "stages", r"^stage_\d{3}$"),
        ("tool", "tools", r"^tool_\d{3}$"),
        ("ind", "indicators", r"^ind_\d{3}$"),
        ("rule", "rules", r"^rule_\d{3}$"),
    ];

    let mut issues = Vec::new();
    for (kind, list_key, pattern) in kinds {
        let re = regex::Regex::new(pattern).expect("valid id pattern");
        let mut seen: HashSet<String> = HashSet::new();
        for (i, item) in structure_list(compiled, list_key).iter().enumerate() {
            let id = str_field(item, "id").to_string();
            if !re.is_match(&id) {
                issues.push(Issue::new(
                    format!("ID-{}-{:03}", kind.to_uppercase(), i + 1),
                    IssueSeverity::Major,
                    "ids",
                    format!("Invalid {kind} id: '{id}'"),
                    json!({"pointer": format!("/structure/{list_key}/{i}")}),
                    "Ensure ids follow the stable pattern assigned by the compiler.",
                ));
            }
            if !seen.insert(id.clone()) {
                issues.push(Issue::new(
                    format!("ID-DUP-{}-{:03}", kind.to_uppercase(), i + 1),
                    IssueSeverity::Blocker,
                    "ids",
                    format!("Duplicate {kind} id: '{id}'"),
                    json!({"pointer": format!("/structure/{list_key}/{i}")}),
                    "Ensure IDs are unique (compiler normalization).",
                ));
            }
        }
    }
    issues
}

/// README must exist and the stage file count must match the stage list.
pub fn precheck_docs_consistency(layout: &Layout, book_id: &str, compiled: &Value) -> Vec<Issue> {
    let base = layout.methodology_docs_dir(book_id);
    let mut issues = Vec::new();

    if !base.join("README.md").exists() {
        issues.push(Issue::new(
            "DOCS-001",
            IssueSeverity::Blocker,
            "docs",
            "README.md not found for methodology docs.",
            json!({"path": base.join("README.md").display().to_string()}),
            "Run the compiler to generate docs/methodologies/<id>/README.md",
        ));
        return issues;
    }

    let stages = structure_list(compiled, "stages");
    if stages.is_empty() {
        return issues;
    }

    let stage_dir = base.join("stages");
    if !stage_dir.exists() {
        issues.push(Issue::new(
            "DOCS-002",
            IssueSeverity::Blocker,
            "docs",
            "Stages directory missing.",
            json!({"path": stage_dir.display().to_string()}),
            "Run the compiler to generate stage docs.",
        ));
        return issues;
    }

    let pattern = stage_dir.join("stage_*.md");
    let file_count = glob::glob(&pattern.to_string_lossy())
        .map(|paths| paths.filter_map(|p| p.ok()).count())
        .unwrap_or(0);
    if file_count != stages.len() {
        issues.push(Issue::new(
            "DOCS-003",
            IssueSeverity::Major,
            "docs",
            format!(
                "Stages docs count mismatch: yaml={} files={file_count}",
                stages.len()
            ),
            json!({"path": stage_dir.display().to_string()}),
            "Re-run the compiler; ensure stage ids and file naming stay stable.",
        ));
    }
    issues
}

/// Duplicate indicator names (normalized) are BLOCKERs: they would
/// collapse into one graph vertex.
pub fn precheck_duplicate_indicators(compiled: &Value) -> Vec<Issue> {
    let mut seen: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, ind) in structure_list(compiled, "indicators").iter().enumerate() {
        let name = str_field(ind, "name").trim();
        if name.is_empty() {
            continue;
        }
        seen.entry(normalize_name(name)).or_default().push(idx);
    }

    let mut groups: Vec<(String, Vec<usize>)> =
        seen.into_iter().filter(|(_, v)| v.len() > 1).collect();
    groups.sort_by_key(|(_, v)| v[0]);

    groups
        .into_iter()
        .map(|(norm_name, indices)| {
            let ids: Vec<String> = indices.iter().map(|i| format!("ind_{:03}", i + 1)).collect();
            Issue::new(
                format!("DUP-IND-{:03}", indices[0] + 1),
                IssueSeverity::Blocker,
                "duplicates",
                format!(
                    "Duplicate indicator name '{norm_name}' found at {} locations: {}",
                    indices.len(),
                    ids.join(", ")
                ),
                json!({
                    "pointer": format!("/structure/indicators/{} and {}", indices[0], indices[1]),
                    "snippet": format!("Normalized name: '{norm_name}' appears {} times", indices.len()),
                }),
                "Merge duplicate indicators or rename to distinguish contexts.",
            )
        })
        .collect()
}

/// Stage order sanity: non-integer order (MAJOR), order=1 appearing past
/// the first stage (BLOCKER, broken renumbering), duplicate orders (MAJOR).
pub fn precheck_stage_order(compiled: &Value) -> Vec<Issue> {
    let mut issues = Vec::new();
    let mut seen_orders: HashMap<i64, Vec<usize>> = HashMap::new();

    for (idx, stage) in structure_list(compiled, "stages").iter().enumerate() {
        let order = match stage.get("order") {
            None | Some(Value::Null) => continue,
            Some(v) => v,
        };
        let order = match order.as_i64() {
            Some(o) => o,
            None => {
                issues.push(Issue::new(
                    format!("ORDER-TYPE-{:03}", idx + 1),
                    IssueSeverity::Major,
                    "stage_order",
                    format!("Stage {} has non-integer order: {order}", idx + 1),
                    json!({"pointer": format!("/structure/stages/{idx}/order")}),
                    "Ensure order is integer type.",
                ));
                continue;
            }
        };

        seen_orders.entry(order).or_default().push(idx);

        if order == 1 && idx > 0 {
            issues.push(Issue::new(
                format!("ORDER-RESET-{:03}", idx + 1),
                IssueSeverity::Blocker,
                "stage_order",
                format!(
                    "Stage {} has order=1 but is not the first stage (broken numbering)",
                    idx + 1
                ),
                json!({
                    "pointer": format!("/structure/stages/{idx}/order"),
                    "snippet": format!(
                        "stage_{:03} order: {order}, order_display: '{}'",
                        idx + 1,
                        str_field(stage, "order_display")
                    ),
                }),
                "Renumber stages sequentially or fix the source order mapping.",
            ));
        }
    }

    let mut duplicate_orders: Vec<(i64, Vec<usize>)> = seen_orders
        .into_iter()
        .filter(|(_, v)| v.len() > 1)
        .collect();
    duplicate_orders.sort_by_key(|(order, _)| *order);

    for (order, indices) in duplicate_orders {
        let ids: Vec<String> = indices.iter().map(|i| format!("stage_{:03}", i + 1)).collect();
        issues.push(Issue::new(
            format!("ORDER-DUP-{order:03}"),
            IssueSeverity::Major,
            "stage_order",
            format!(
                "Duplicate order={order} found at {} stages: {}",
                indices.len(),
                ids.join(", ")
            ),
            json!({"pointer": format!("/structure/stages order={order}")}),
            "Ensure each stage has a unique order value.",
        ));
    }
    issues
}

/// Duplicate stage titles after normalization: copy-paste artifacts the
/// reasoning layer should never have to find.
pub fn precheck_duplicate_stage_titles(compiled: &Value) -> Vec<Issue> {
    let mut seen: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, stage) in structure_list(compiled, "stages").iter().enumerate() {
        let title = str_field(stage, "title").trim();
        if title.is_empty() {
            continue;
        }
        seen.entry(normalize_name(title)).or_default().push(idx);
    }

    let mut groups: Vec<(String, Vec<usize>)> =
        seen.into_iter().filter(|(_, v)| v.len() > 1).collect();
    groups.sort_by_key(|(_, v)| v[0]);

    groups
        .into_iter()
        .map(|(norm_title, indices)| {
            let ids: Vec<String> = indices.iter().map(|i| format!("stage_{:03}", i + 1)).collect();
            Issue::new(
                format!("DUP-STAGE-{:03}", indices[0] + 1),
                IssueSeverity::Major,
                "duplicates",
                format!(
                    "Duplicate stage title '{norm_title}' found at {} locations: {}",
                    indices.len(),
                    ids.join(", ")
                ),
                json!({
                    "pointer": format!("/structure/stages/{} and {}", indices[0], indices[1]),
                    "snippet": format!("Title: '{norm_title}' appears {} times", indices.len()),
                }),
                "Merge duplicate stages or rename to distinguish contexts.",
            )
        })
        .collect()
}

/// Every stage must be reachable from the README, by id or by title.
/// Coverage below 50% is a BLOCKER, below 80% a MAJOR.
pub fn precheck_readme_coverage(layout: &Layout, book_id: &str, compiled: &Value) -> Vec<Issue> {
    let readme_path = layout.methodology_docs_dir(book_id).join("README.md");
    if !readme_path.exists() {
        return Vec::new(); // missing README is DOCS-001 territory
    }
    let stages = structure_list(compiled, "stages");
    if stages.is_empty() {
        return Vec::new();
    }
    let readme_content = match std::fs::read_to_string(&readme_path) {
        Ok(c) => c.to_lowercase(),
        Err(_) => return Vec::new(),
    };

    let total = stages.len();
    let mut found = 0usize;
    let mut missing: Vec<String> = Vec::new();

    for (idx, stage) in stages.iter().enumerate() {
        let stage_id = {
            let id = str_field(stage, "id");
            if id.is_empty() {
                format!("stage_{:03}", idx + 1)
            } else {
                id.to_string()
            }
        };
        let title = str_field(stage, "title").trim().to_lowercase();
        if readme_content.contains(&stage_id.to_lowercase())
            || (!title.is_empty() && readme_content.contains(&title))
        {
            found += 1;
        } else {
            missing.push(stage_id);
        }
    }

    let coverage = found as f64 / total as f64;
    let preview = if missing.len() > 5 {
        format!("{}...", missing[..5].join(", "))
    } else {
        missing.join(", ")
    };

    if coverage < 0.5 {
        vec![Issue::new(
            "README-COV-001",
            IssueSeverity::Blocker,
            "docs",
            format!(
                "README.md covers only {found}/{total} ({:.0}%) stages",
                coverage * 100.0
            ),
            json!({
                "path": readme_path.display().to_string(),
                "snippet": format!("Missing stages: {preview}"),
            }),
            "Re-run the compiler to generate a complete README.",
        )]
    } else if coverage < 0.8 {
        vec![Issue::new(
            "README-COV-002",
            IssueSeverity::Major,
            "docs",
            format!(
                "README.md incomplete: {found}/{total} ({:.0}%) stages documented",
                coverage * 100.0
            ),
            json!({
                "path": readme_path.display().to_string(),
                "snippet": format!("Missing {} stages", missing.len()),
            }),
            "Complete README generation to include all stages.",
        )]
    } else {
        Vec::new()
    }
}

/// Every referenced glossary term must exist in the loaded index. Returns
/// the issues plus the coverage ratio.
pub fn precheck_glossary(
    compiled: &Value,
    glossary_terms: Option<&HashSet<String>>,
) -> (Vec<Issue>, f64) {
    let Some(terms) = glossary_terms else {
        return (Vec::new(), 1.0);
    };

    let found_terms = compiled
        .get("glossary_references")
        .and_then(|g| g.get("found_terms"))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let mut issues = Vec::new();
    let mut total = 0usize;
    let mut ok = 0usize;

    for (idx, ft) in found_terms.iter().enumerate() {
        let term_id = str_field(ft, "term_id");
        if term_id.is_empty() {
            continue;
        }
        total += 1;
        if terms.contains(term_id) {
            ok += 1;
        } else {
            issues.push(Issue::new(
                format!("GLOSS-{:03}", idx + 1),
                IssueSeverity::Blocker,
                "glossary",
                format!("Glossary term_id not found: '{term_id}'"),
                json!({"pointer": format!("/glossary_references/found_terms/{idx}/term_id")}),
                "Add the term to the glossary or replace with an existing term_id.",
            ));
        }
    }

    let coverage = if total == 0 { 1.0 } else { ok as f64 / total as f64 };
    (issues, coverage)
}

/// Formula syntax sanity: control characters, parenthesis balance and a
/// weak definition heuristic. Returns issues plus the pass ratio over
/// non-empty formulas.
pub fn precheck_formulas(compiled: &Value) -> (Vec<Issue>, f64) {
    let forbidden =
        regex::Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F]").expect("valid control char pattern");
    let ratio_words = regex::Regex::new(r"\b(ratio|margin|roi|roa|roe|turnover)\b")
        .expect("valid heuristic pattern");

    let mut issues = Vec::new();
    let mut checked = 0usize;
    let mut passed = 0usize;

    for (idx, ind) in structure_list(compiled, "indicators").iter().enumerate() {
        let formula = str_field(ind, "formula").trim().to_string();
        if formula.is_empty() {
            continue;
        }
        checked += 1;
        let snippet: String = formula.chars().take(120).collect();

        if forbidden.is_match(&formula) {
            issues.push(Issue::new(
                format!("FORM-{:03}", idx + 1),
                IssueSeverity::Major,
                "formula",
                "Formula contains control/garbage characters.",
                json!({
                    "pointer": format!("/structure/indicators/{idx}/formula"),
                    "snippet": snippet,
                }),
                "Clean extraction / normalize formula text.",
            ));
            continue;
        }

        let mut balance = 0i32;
        let mut balanced = true;
        for c in formula.chars() {
            match c {
                '(' => balance += 1,
                ')' => {
                    balance -= 1;
                    if balance < 0 {
                        balanced = false;
                        break;
                    }
                }
                _ => {}
            }
        }
        if !balanced || balance != 0 {
            issues.push(Issue::new(
                format!("FORM-PAREN-{:03}", idx + 1),
                IssueSeverity::Major,
                "formula",
                "Unbalanced parentheses in formula.",
                json!({
                    "pointer": format!("/structure/indicators/{idx}/formula"),
                    "snippet": snippet,
                }),
                "Fix parentheses or extraction errors.",
            ));
            continue;
        }

        if ratio_words.is_match(&formula.to_lowercase()) && !formula.contains('=') {
            issues.push(Issue::new(
                format!("FORM-EQ-{:03}", idx + 1),
                IssueSeverity::Minor,
                "formula",
                "Formula looks like a definition but '=' is missing.",
                json!({
                    "pointer": format!("/structure/indicators/{idx}/formula"),
                    "snippet": snippet,
                }),
                "If it is a definition, write it as 'X = ...'. Otherwise ignore.",
            ));
        }
        passed += 1;
    }

    let ratio = if checked == 0 { 1.0 } else { passed as f64 / checked as f64 };
    (issues, ratio)
}

/// Empty-formula coverage for formula-bearing methodology types. The 100%
/// case dominates: either the BLOCKER or the MAJOR fires, never both.
pub fn precheck_empty_formulas(compiled: &Value, threshold: f64) -> Vec<Issue> {
    let indicators = structure_list(compiled, "indicators");
    if indicators.is_empty() {
        return Vec::new();
    }

    let methodology_type = compiled
        .get("classification")
        .and_then(|c| c.get("methodology_type"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let expects_formulas = methodology_type
        .parse::<MethodologyType>()
        .map(|t| t.expects_formulas())
        .unwrap_or(false);
    if !expects_formulas {
        return Vec::new();
    }

    let total = indicators.len();
    let empty = indicators
        .iter()
        .filter(|i| str_field(i, "formula").trim().is_empty())
        .count();
    let empty_ratio = empty as f64 / total as f64;

    if empty_ratio >= 1.0 {
        vec![Issue::new(
            "EMPTY-FORM-001",
            IssueSeverity::Blocker,
            "completeness",
            format!(
                "All {total} indicators have empty formulas (methodology_type={methodology_type})"
            ),
            json!({
                "pointer": "/structure/indicators/*/formula",
                "snippet": format!("{empty}/{total} indicators with empty formula"),
            }),
            "Extract formulas from the source or reclassify as 'planning' if formulas do not apply.",
        )]
    } else if empty_ratio > threshold {
        vec![Issue::new(
            "EMPTY-FORM-002",
            IssueSeverity::Major,
            "completeness",
            format!(
                "{empty}/{total} ({:.0}%) indicators have empty formulas (threshold={:.0}%)",
                empty_ratio * 100.0,
                threshold * 100.0
            ),
            json!({
                "pointer": "/structure/indicators/*/formula",
                "snippet": format!("{empty} indicators without formulas"),
            }),
            "Extract formulas or keep only indicators with clear definitions.",
        )]
    } else {
        Vec::new()
    }
}
