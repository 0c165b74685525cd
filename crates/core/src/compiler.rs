use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::compiled::{
    stable_id, CompiledClassification, CompiledIndicator, CompiledMetadata, CompiledMethodology,
    CompiledRule, CompiledSource, CompiledStage, CompiledStructure, CompiledTool, ToolType,
};
use crate::layout::Layout;
use crate::outline::Outline;
use crate::slug::safe_slug;
use crate::template::DocTemplate;

const FALLBACK_README: &str = "# {{ title }}\n\n\
## Тип методологии\n- **methodology_type:** {{ methodology_type }}\n\n\
## Этапы\n{{ stage_list }}\n\
## Разделы\n- Этапы: `./stages/`\n- Инструменты: `./tools/`\n- Показатели: `./indicators/`\n- Правила: `./rules/`\n";

const FALLBACK_STAGE: &str =
    "# {{ title }}\n\n## Описание\n{{ description }}\n\n## Порядок\n{{ order_display }}\n";

const FALLBACK_TOOL: &str =
    "# {{ title }}\n\n## Тип\n{{ type }}\n\n## Описание\n{{ description }}\n";

const FALLBACK_INDICATOR: &str =
    "# {{ name }}\n\n## Описание\n{{ description }}\n{{ formula_section }}";

const FALLBACK_RULE: &str = "# Rule {{ id }}\n\n## Условие\n{{ condition }}\n\n\
## Действие\n{{ action }}\n\n## Важность\n{{ severity }}\n";

#[derive(Debug, Clone, Default, Deserialize)]
struct SourcesMetadata {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    book_title: Option<String>,
}

#[derive(Debug)]
pub struct CompileOutput {
    pub methodology: CompiledMethodology,
    pub yaml_path: PathBuf,
    pub docs_dir: PathBuf,
}

/// Deterministic compiler: normalizes an outline into the canonical YAML
/// and renders the markdown docs tree. Assigns IDs and fills templates;
/// never invents content.
pub fn compile_methodology(layout: &Layout, book_id: &str) -> Result<CompileOutput> {
    let outline_path = layout.find_outline(book_id)?;
    let outline = Outline::load(&outline_path)?;
    let sources_meta = load_sources_metadata(layout, book_id);

    let methodology = normalize(
        &outline,
        book_id,
        &outline_path,
        sources_meta.as_ref(),
        layout,
    );

    let yaml_path = layout.methodology_yaml_path(book_id);
    methodology.save(&yaml_path)?;

    let docs_dir = render_docs(layout, &methodology)?;

    tracing::info!(
        book_id,
        stages = methodology.structure.stages.len(),
        tools = methodology.structure.tools.len(),
        indicators = methodology.structure.indicators.len(),
        rules = methodology.structure.rules.len(),
        "Compiled methodology"
    );

    Ok(CompileOutput {
        methodology,
        yaml_path,
        docs_dir,
    })
}

fn load_sources_metadata(layout: &Layout, book_id: &str) -> Option<SourcesMetadata> {
    let path = layout.source_metadata_path(book_id);
    if !path.exists() {
        return None;
    }
    let content = std::fs::read_to_string(&path).ok()?;
    serde_json::from_str(&content).ok()
}

fn normalize(
    outline: &Outline,
    book_id: &str,
    outline_path: &Path,
    sources_meta: Option<&SourcesMetadata>,
    layout: &Layout,
) -> CompiledMethodology {
    let methodology_type = outline
        .classification
        .methodology_type
        .as_deref()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "analysis".to_string());

    let title = sources_meta
        .and_then(|m| {
            m.title
                .clone()
                .or_else(|| m.name.clone())
                .or_else(|| m.book_title.clone())
        })
        .unwrap_or_else(|| book_id.to_string());

    let stages = outline
        .structure
        .stages
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let idx = i + 1;
            let order = s.order_as_int();
            let order_display = match order {
                Some(o) if o != idx as i64 => format!("{idx} (source order: {o})"),
                _ => idx.to_string(),
            };
            CompiledStage {
                id: stable_id("stage", idx),
                title: s
                    .title
                    .as_deref()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .unwrap_or_else(|| format!("Stage {idx}")),
                description: s.description.as_deref().unwrap_or("").trim().to_string(),
                order,
                order_display,
            }
        })
        .collect();

    let tools = outline
        .structure
        .tools
        .iter()
        .enumerate()
        .map(|(i, t)| {
            let idx = i + 1;
            CompiledTool {
                id: stable_id("tool", idx),
                title: t
                    .title
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .unwrap_or_else(|| format!("Tool {idx}")),
                tool_type: ToolType::normalize(t.tool_type.as_deref()),
                description: t.description.as_deref().unwrap_or("").trim().to_string(),
            }
        })
        .collect();

    let indicators = outline
        .structure
        .indicators
        .iter()
        .enumerate()
        .map(|(i, ind)| {
            let idx = i + 1;
            let name = ind.display_name().trim().to_string();
            CompiledIndicator {
                id: stable_id("ind", idx),
                name: if name.is_empty() {
                    format!("Indicator {idx}")
                } else {
                    name
                },
                description: ind.description.as_deref().unwrap_or("").trim().to_string(),
                formula: ind.formula.as_deref().unwrap_or("").trim().to_string(),
            }
        })
        .collect();

    let rules = outline
        .structure
        .rules
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let idx = i + 1;
            CompiledRule {
                id: stable_id("rule", idx),
                condition: r.condition.as_deref().unwrap_or("").trim().to_string(),
                action: r.action.as_deref().unwrap_or("").trim().to_string(),
                // lowercased passthrough: the Gate is the vocabulary enforcer
                severity: r
                    .severity
                    .as_deref()
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| "medium".to_string()),
            }
        })
        .collect();

    let outline_rel = outline_path
        .strip_prefix(layout.root())
        .unwrap_or(outline_path)
        .to_string_lossy()
        .to_string();
    let sources_metadata = sources_meta.map(|_| format!("sources/{book_id}/metadata.json"));

    CompiledMethodology {
        metadata: CompiledMetadata {
            id: book_id.to_string(),
            title,
            created_at: chrono::Utc::now().to_rfc3339(),
            source: CompiledSource {
                work_outline: outline_rel,
                sources_metadata,
            },
            outline_metadata: outline.metadata.clone(),
        },
        classification: CompiledClassification { methodology_type },
        structure: CompiledStructure {
            stages,
            tools,
            indicators,
            rules,
        },
        glossary_references: None,
    }
}

fn render_docs(layout: &Layout, methodology: &CompiledMethodology) -> Result<PathBuf> {
    let templates_dir = layout.templates_dir();
    let readme_tpl = DocTemplate::load_or_fallback(&templates_dir, "readme.md", FALLBACK_README);
    let stage_tpl = DocTemplate::load_or_fallback(&templates_dir, "stage.md", FALLBACK_STAGE);
    let tool_tpl = DocTemplate::load_or_fallback(&templates_dir, "tool.md", FALLBACK_TOOL);
    let indicator_tpl =
        DocTemplate::load_or_fallback(&templates_dir, "indicator.md", FALLBACK_INDICATOR);
    let rule_tpl = DocTemplate::load_or_fallback(&templates_dir, "rule.md", FALLBACK_RULE);

    let base = layout.methodology_docs_dir(&methodology.metadata.id);

    let stage_list = methodology
        .structure
        .stages
        .iter()
        .enumerate()
        .map(|(i, s)| format!("{}. **{}** — {}\n", i + 1, s.title, s.description))
        .collect::<String>();

    let mut ctx: HashMap<&str, String> = HashMap::new();
    ctx.insert("title", methodology.metadata.title.clone());
    ctx.insert(
        "methodology_type",
        methodology.classification.methodology_type.clone(),
    );
    ctx.insert("stage_list", stage_list);
    write_doc(&base.join("README.md"), &readme_tpl, &ctx)?;

    for stage in &methodology.structure.stages {
        let mut ctx: HashMap<&str, String> = HashMap::new();
        ctx.insert("title", stage.title.clone());
        ctx.insert("description", stage.description.clone());
        ctx.insert("order_display", stage.order_display.clone());
        let fname = format!("{}_{}.md", stage.id, safe_slug(&stage.title));
        write_doc(&base.join("stages").join(fname), &stage_tpl, &ctx)?;
    }

    for tool in &methodology.structure.tools {
        let mut ctx: HashMap<&str, String> = HashMap::new();
        ctx.insert("title", tool.title.clone());
        ctx.insert("type", tool.tool_type.to_string());
        ctx.insert("description", tool.description.clone());
        let fname = format!("{}_{}.md", tool.id, safe_slug(&tool.title));
        write_doc(&base.join("tools").join(fname), &tool_tpl, &ctx)?;
    }

    for indicator in &methodology.structure.indicators {
        let mut ctx: HashMap<&str, String> = HashMap::new();
        ctx.insert("name", indicator.name.clone());
        ctx.insert("description", indicator.description.clone());
        let formula_section = if indicator.formula.is_empty() {
            String::new()
        } else {
            format!("\n## Формула\n`{}`\n", indicator.formula)
        };
        ctx.insert("formula_section", formula_section);
        let fname = format!("{}_{}.md", indicator.id, safe_slug(&indicator.name));
        write_doc(&base.join("indicators").join(fname), &indicator_tpl, &ctx)?;
    }

    for rule in &methodology.structure.rules {
        let mut ctx: HashMap<&str, String> = HashMap::new();
        ctx.insert("id", rule.id.clone());
        ctx.insert("condition", rule.condition.clone());
        ctx.insert("action", rule.action.clone());
        ctx.insert("severity", rule.severity.clone());
        let fname = format!("{}.md", rule.id);
        write_doc(&base.join("rules").join(fname), &rule_tpl, &ctx)?;
    }

    Ok(base)
}

fn write_doc(path: &Path, template: &DocTemplate, ctx: &HashMap<&str, String>) -> Result<()> {
    let rendered = match template.render(ctx) {
        Ok(text) => text,
        Err(e) => bail!("Template error for {}: {e}", path.display()),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, rendered).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
