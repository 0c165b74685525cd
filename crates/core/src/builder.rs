use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::outline::{
    normalize_name, Classification, Outline, OutlineIndicator, OutlineRule, OutlineStage,
    OutlineTool, Structure,
};
use finkb_llm::{strip_code_fence, ChatClient};

const MAX_CHAPTER_CHARS: usize = 8000;

const ANALYSIS_SYSTEM_PROMPT: &str = "\
You extract the skeleton of a financial/management methodology from a book chapter.

Return ONLY a JSON object with:
- methodology_type: one of \"diagnostic\", \"planning\", \"analysis\", \"optimization\", \"standard\" (or null if unclear)
- stages: [{title, description, order}] — concrete process steps described in the text
- tools: [{title, type, description}] — tables, templates, checklists, calculators, documents, charts
- indicators: [{name, description, formula}] — metrics; formula only if the text states one
- rules: [{condition, action, severity}] — if/then guidance; severity one of \"critical\", \"warning\", \"info\", \"low\"

Extract only what the chapter actually contains. Do not invent entities.
Output ONLY valid JSON, no additional text.";

#[derive(Debug, Clone)]
pub struct Chapter {
    pub title: String,
    pub text: String,
}

/// Per-chapter extraction result as returned by the model.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChapterAnalysis {
    #[serde(default)]
    pub methodology_type: Option<String>,
    #[serde(default)]
    pub stages: Vec<OutlineStage>,
    #[serde(default)]
    pub tools: Vec<OutlineTool>,
    #[serde(default)]
    pub indicators: Vec<OutlineIndicator>,
    #[serde(default)]
    pub rules: Vec<OutlineRule>,
}

fn is_heading(block: &Value) -> bool {
    matches!(
        block.get("type").and_then(|v| v.as_str()),
        Some("heading") | Some("header") | Some("h1") | Some("title")
    )
}

/// Group extracted blocks into chapters: an explicit `chapter` field wins,
/// otherwise heading blocks open a new chapter.
pub fn extract_chapters(blocks_path: &Path) -> Result<Vec<Chapter>> {
    let content = std::fs::read_to_string(blocks_path)
        .with_context(|| format!("Failed to read blocks: {}", blocks_path.display()))?;

    let mut chapters: Vec<Chapter> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut current: Option<usize> = None;

    let push_text = |chapters: &mut Vec<Chapter>, idx: usize, text: &str| {
        let chapter = &mut chapters[idx];
        if chapter.text.len() < MAX_CHAPTER_CHARS {
            if !chapter.text.is_empty() {
                chapter.text.push('\n');
            }
            let remaining = MAX_CHAPTER_CHARS - chapter.text.len();
            chapter
                .text
                .extend(text.chars().take(remaining));
        }
    };

    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let block: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(line = lineno + 1, error = %e, "Skipping malformed block");
                continue;
            }
        };
        let text = block.get("text").and_then(|v| v.as_str()).unwrap_or("");
        if text.trim().is_empty() {
            continue;
        }

        if let Some(name) = block.get("chapter").and_then(|v| v.as_str()) {
            let idx = *index.entry(name.to_string()).or_insert_with(|| {
                chapters.push(Chapter {
                    title: name.to_string(),
                    text: String::new(),
                });
                chapters.len() - 1
            });
            current = Some(idx);
            push_text(&mut chapters, idx, text);
            continue;
        }

        if is_heading(&block) {
            chapters.push(Chapter {
                title: text.trim().to_string(),
                text: String::new(),
            });
            current = Some(chapters.len() - 1);
            continue;
        }

        let idx = match current {
            Some(idx) => idx,
            None => {
                chapters.push(Chapter {
                    title: "Introduction".to_string(),
                    text: String::new(),
                });
                current = Some(chapters.len() - 1);
                chapters.len() - 1
            }
        };
        push_text(&mut chapters, idx, text);
    }

    Ok(chapters)
}

fn map_severity(raw: Option<&str>) -> Option<String> {
    let value = raw?.trim().to_lowercase();
    let mapped = match value.as_str() {
        "high" => "critical",
        "medium" => "warning",
        "low" => "info",
        other => other,
    };
    Some(mapped.to_string())
}

/// Pure reduction of per-chapter analyses into one outline: concatenate,
/// de-duplicate by normalized key keeping the richer variant, map legacy
/// severities and renumber stage orders 1..N.
pub fn reduce_analyses(analyses: &[ChapterAnalysis]) -> Outline {
    let mut stages: Vec<OutlineStage> = Vec::new();
    let mut stage_index: HashMap<String, usize> = HashMap::new();
    let mut tools: Vec<OutlineTool> = Vec::new();
    let mut tool_seen: HashSet<String> = HashSet::new();
    let mut indicators: Vec<OutlineIndicator> = Vec::new();
    let mut indicator_index: HashMap<String, usize> = HashMap::new();
    let mut rules: Vec<OutlineRule> = Vec::new();
    let mut rule_seen: HashSet<String> = HashSet::new();
    let mut methodology_type: Option<String> = None;

    for analysis in analyses {
        if methodology_type.is_none() {
            methodology_type = analysis
                .methodology_type
                .as_deref()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty());
        }

        for stage in &analysis.stages {
            let title = stage.title.as_deref().unwrap_or("").trim();
            let description = stage.description.as_deref().unwrap_or("").trim();
            if title.is_empty() || description.is_empty() {
                continue;
            }
            let key = normalize_name(title);
            match stage_index.get(&key) {
                None => {
                    stage_index.insert(key, stages.len());
                    stages.push(stage.clone());
                }
                Some(&pos) => {
                    let existing_len = stages[pos]
                        .description
                        .as_deref()
                        .map(str::len)
                        .unwrap_or(0);
                    if description.len() > existing_len {
                        stages[pos].description = stage.description.clone();
                    }
                }
            }
        }

        for tool in &analysis.tools {
            let title = tool.title.as_deref().unwrap_or("").trim();
            if title.is_empty() {
                continue;
            }
            if tool_seen.insert(normalize_name(title)) {
                tools.push(tool.clone());
            }
        }

        for indicator in &analysis.indicators {
            let name = indicator.display_name().trim();
            let description = indicator.description.as_deref().unwrap_or("").trim();
            if name.is_empty() || description.is_empty() {
                continue;
            }
            let key = normalize_name(name);
            match indicator_index.get(&key) {
                None => {
                    indicator_index.insert(key, indicators.len());
                    let mut indicator = indicator.clone();
                    indicator.formula = indicator
                        .formula
                        .as_deref()
                        .map(str::trim)
                        .filter(|f| !f.is_empty())
                        .map(String::from);
                    indicators.push(indicator);
                }
                Some(&pos) => {
                    let existing = &mut indicators[pos];
                    if existing.formula.is_none() {
                        existing.formula = indicator
                            .formula
                            .as_deref()
                            .map(str::trim)
                            .filter(|f| !f.is_empty())
                            .map(String::from);
                    }
                    let existing_len =
                        existing.description.as_deref().map(str::len).unwrap_or(0);
                    if description.len() > existing_len {
                        existing.description = indicator.description.clone();
                    }
                }
            }
        }

        for rule in &analysis.rules {
            let condition = rule.condition.as_deref().unwrap_or("").trim();
            let action = rule.action.as_deref().unwrap_or("").trim();
            if condition.is_empty() && action.is_empty() {
                continue;
            }
            let key = format!("{}|{}", normalize_name(condition), normalize_name(action));
            if rule_seen.insert(key) {
                let mut rule = rule.clone();
                rule.severity = map_severity(rule.severity.as_deref());
                rules.push(rule);
            }
        }
    }

    // renumbering keeps the merged sequence gap-free
    for (i, stage) in stages.iter_mut().enumerate() {
        stage.order = Some(serde_yaml::Value::Number(((i + 1) as i64).into()));
    }

    Outline {
        metadata: serde_yaml::Value::Null,
        classification: Classification { methodology_type },
        structure: Structure {
            stages,
            tools,
            indicators,
            rules,
        },
    }
}

/// Builds an outline from extracted blocks with one model call per
/// chapter. Chapters whose analysis fails to parse are skipped.
pub struct OutlineBuilder<'a> {
    chat: &'a dyn ChatClient,
}

impl<'a> OutlineBuilder<'a> {
    pub fn new(chat: &'a dyn ChatClient) -> Self {
        Self { chat }
    }

    async fn analyze_chapter(&self, chapter: &Chapter) -> Option<ChapterAnalysis> {
        let user_prompt = format!("Chapter: {}\n\n{}", chapter.title, chapter.text);
        let response = match self.chat.complete(Some(ANALYSIS_SYSTEM_PROMPT), &user_prompt).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(chapter = %chapter.title, error = %e, "Chapter analysis call failed");
                return None;
            }
        };
        match serde_json::from_str(strip_code_fence(&response)) {
            Ok(analysis) => Some(analysis),
            Err(e) => {
                tracing::warn!(chapter = %chapter.title, error = %e, "Unparseable chapter analysis");
                None
            }
        }
    }

    pub async fn build_outline(&self, blocks_path: &Path) -> Result<Outline> {
        let chapters = extract_chapters(blocks_path)?;
        if chapters.is_empty() {
            anyhow::bail!("No chapters found in {}", blocks_path.display());
        }
        tracing::info!(chapters = chapters.len(), "Analyzing chapters");

        let mut analyses = Vec::new();
        for chapter in &chapters {
            if let Some(analysis) = self.analyze_chapter(chapter).await {
                analyses.push(analysis);
            }
        }
        if analyses.is_empty() {
            anyhow::bail!("All {} chapter analyses failed", chapters.len());
        }

        let mut outline = reduce_analyses(&analyses);
        outline.metadata = serde_yaml::to_value(serde_json::json!({
            "chapters_total": chapters.len(),
            "chapters_analyzed": analyses.len(),
        }))
        .unwrap_or(serde_yaml::Value::Null);
        Ok(outline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use finkb_llm::LlmError;

    fn analysis(json: &str) -> ChapterAnalysis {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn reducer_dedups_stages_preferring_longer_description() {
        let a = analysis(
            r#"{"stages": [{"title": "Diagnose", "description": "short", "order": 1}]}"#,
        );
        let b = analysis(
            r#"{"stages": [{"title": "diagnose", "description": "a much longer explanation", "order": 1},
                          {"title": "Plan", "description": "make the plan", "order": 2}]}"#,
        );
        let outline = reduce_analyses(&[a, b]);
        assert_eq!(outline.structure.stages.len(), 2);
        assert_eq!(
            outline.structure.stages[0].description.as_deref(),
            Some("a much longer explanation")
        );
    }

    #[test]
    fn reducer_renumbers_orders_sequentially() {
        let a = analysis(
            r#"{"stages": [{"title": "A", "description": "first thing", "order": 4},
                          {"title": "B", "description": "second thing", "order": 9}]}"#,
        );
        let outline = reduce_analyses(&[a]);
        assert_eq!(outline.structure.stages[0].order_as_int(), Some(1));
        assert_eq!(outline.structure.stages[1].order_as_int(), Some(2));
    }

    #[test]
    fn reducer_maps_legacy_severities() {
        let a = analysis(
            r#"{"rules": [{"condition": "c1", "action": "a1", "severity": "high"},
                          {"condition": "c2", "action": "a2", "severity": "medium"},
                          {"condition": "c3", "action": "a3", "severity": "info"}]}"#,
        );
        let outline = reduce_analyses(&[a]);
        let severities: Vec<&str> = outline
            .structure
            .rules
            .iter()
            .map(|r| r.severity.as_deref().unwrap())
            .collect();
        assert_eq!(severities, vec!["critical", "warning", "info"]);
    }

    #[test]
    fn reducer_merges_indicator_formula_from_duplicate() {
        let a = analysis(
            r#"{"indicators": [{"name": "EBITDA", "description": "profit measure"}]}"#,
        );
        let b = analysis(
            r#"{"indicators": [{"name": "ebitda", "description": "short", "formula": "E = R - C"}]}"#,
        );
        let outline = reduce_analyses(&[a, b]);
        assert_eq!(outline.structure.indicators.len(), 1);
        assert_eq!(
            outline.structure.indicators[0].formula.as_deref(),
            Some("E = R - C")
        );
    }

    #[test]
    fn reducer_drops_blank_entries() {
        let a = analysis(
            r#"{"stages": [{"title": "", "description": "x"}, {"title": "Ok", "description": ""}],
                "indicators": [{"name": "N", "description": ""}]}"#,
        );
        let outline = reduce_analyses(&[a]);
        assert!(outline.structure.stages.is_empty());
        assert!(outline.structure.indicators.is_empty());
    }

    #[test]
    fn chapters_group_by_heading_and_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.jsonl");
        std::fs::write(
            &path,
            r#"{"type": "heading", "text": "Глава 1"}
{"type": "paragraph", "text": "Первый текст."}
{"type": "paragraph", "text": "Ещё текст."}
{"type": "heading", "text": "Глава 2"}
{"type": "paragraph", "text": "Второй текст."}
{"text": "С явной главой.", "chapter": "Глава 2"}
"#,
        )
        .unwrap();

        let chapters = extract_chapters(&path).unwrap();
        assert_eq!(chapters.len(), 3); // two headings + explicit group
        assert_eq!(chapters[0].title, "Глава 1");
        assert!(chapters[0].text.contains("Первый текст."));
        assert!(chapters[2].text.contains("С явной главой."));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.jsonl");
        std::fs::write(
            &path,
            "{\"type\": \"heading\", \"text\": \"A\"}\nnot json at all\n{\"text\": \"body\"}\n",
        )
        .unwrap();
        let chapters = extract_chapters(&path).unwrap();
        assert_eq!(chapters.len(), 1);
        assert!(chapters[0].text.contains("body"));
    }

    struct Scripted(&'static str);

    #[async_trait]
    impl ChatClient for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _system: Option<&str>, _user: &str) -> Result<String, LlmError> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn builds_outline_from_scripted_analysis() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.jsonl");
        std::fs::write(
            &path,
            "{\"type\": \"heading\", \"text\": \"Ch1\"}\n{\"text\": \"content\"}\n",
        )
        .unwrap();

        let chat = Scripted(
            r#"```json
{"methodology_type": "Diagnostic",
 "stages": [{"title": "Assess", "description": "collect the baseline numbers", "order": 1}],
 "indicators": [{"name": "Margin", "description": "profit share", "formula": "m = p / r"}],
 "rules": [{"condition": "m < 0.1", "action": "review pricing", "severity": "high"}]}
```"#,
        );
        let builder = OutlineBuilder::new(&chat);
        let outline = builder.build_outline(&path).await.unwrap();

        assert_eq!(
            outline.classification.methodology_type.as_deref(),
            Some("diagnostic")
        );
        assert_eq!(outline.structure.stages.len(), 1);
        assert_eq!(
            outline.structure.rules[0].severity.as_deref(),
            Some("critical")
        );
    }

    #[tokio::test]
    async fn unparseable_chapters_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.jsonl");
        std::fs::write(&path, "{\"type\": \"heading\", \"text\": \"Ch1\"}\n{\"text\": \"x\"}\n")
            .unwrap();

        let chat = Scripted("sorry, no JSON today");
        let builder = OutlineBuilder::new(&chat);
        assert!(builder.build_outline(&path).await.is_err());
    }
}
