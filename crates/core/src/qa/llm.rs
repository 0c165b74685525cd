use serde_json::{json, Value};

use super::{Issue, IssueSeverity};
use finkb_llm::{strip_code_fence, ChatClient};

/// Grounding contract for the reasoning layer. The model may only judge
/// the provided artifacts; its output is never merged back into them.
pub const SYSTEM_PROMPT: &str = "\
You are a QA reviewer for compiled financial methodologies. You do quality assurance only.

Hard rules:
- Do NOT add new stages/tools/indicators/rules.
- Do NOT rewrite the methodology content.
- Do NOT use external knowledge.
- Evaluate only based on the provided artifacts.
- Output must be strictly grounded in evidence (file path + pointer/quote snippet <= 25 words).

Your tasks:
1) Logical coherence: detect contradictions, duplication, broken flow across stages.
2) Glossary validation: identify terms not present in glossary or inconsistent usage.
3) Formula sanity: check formulas for obvious semantic or structural errors.
4) Completeness: whether the methodology is actionable (stages + at least some indicators/tools/rules where appropriate).

Return a JSON object with:
- issues: array of {severity: \"BLOCKER\"|\"MAJOR\"|\"MINOR\", category: string, message: string, evidence: {path: string, pointer: string, snippet?: string}, fix_hint: string}
- strengths: array of strings (brief positive observations)

Severity:
- BLOCKER: must fix before publish
- MAJOR: important, likely reduces usability or correctness
- MINOR: formatting or small clarity issues

Output ONLY valid JSON, no additional text.";

const MAX_STAGES: usize = 5;
const MAX_INDICATORS: usize = 10;
const MAX_README_CHARS: usize = 2000;

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string())
}

fn truncated_list(compiled: &Value, key: &str, limit: usize) -> Value {
    compiled
        .get("structure")
        .and_then(|s| s.get(key))
        .and_then(|v| v.as_array())
        .map(|a| Value::Array(a.iter().take(limit).cloned().collect()))
        .unwrap_or(Value::Array(Vec::new()))
}

pub fn build_user_prompt(compiled: &Value, outline: &Value, readme: &str) -> String {
    let structure = compiled.get("structure").cloned().unwrap_or(Value::Null);
    let count = |key: &str| {
        structure
            .get(key)
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0)
    };

    let metadata = compiled.get("metadata").cloned().unwrap_or(Value::Null);
    let readme_head: String = readme.chars().take(MAX_README_CHARS).collect();
    let readme_ellipsis = if readme.chars().count() > MAX_README_CHARS {
        "..."
    } else {
        ""
    };

    format!(
        "Artifacts for QA review:\n\n\
## 1) Compiled YAML\n\n\
**Metadata:**\n{metadata}\n\n\
**Structure summary:**\n- Stages: {n_stages}\n- Tools: {n_tools}\n- Indicators: {n_indicators}\n- Rules: {n_rules}\n\n\
**Stages (first {max_stages} for context):**\n{stages}\n\n\
**Tools:**\n{tools}\n\n\
**Indicators (first {max_indicators}):**\n{indicators}\n\n\
**Rules:**\n{rules}\n\n\
## 2) Outline metadata\n\n{outline_meta}\n\n\
**Classification:**\n{outline_class}\n\n\
## 3) README.md (docs)\n\n```markdown\n{readme_head}{readme_ellipsis}\n```\n\n\
## Your task:\n\n\
Analyze the artifacts for logical coherence, completeness, formula sanity \
and consistency between the compiled YAML and the outline intent. \
Output ONLY valid JSON with `issues` and `strengths`.",
        metadata = pretty(&metadata),
        n_stages = count("stages"),
        n_tools = count("tools"),
        n_indicators = count("indicators"),
        n_rules = count("rules"),
        max_stages = MAX_STAGES,
        stages = pretty(&truncated_list(compiled, "stages", MAX_STAGES)),
        tools = pretty(&truncated_list(compiled, "tools", usize::MAX)),
        max_indicators = MAX_INDICATORS,
        indicators = pretty(&truncated_list(compiled, "indicators", MAX_INDICATORS)),
        rules = pretty(&truncated_list(compiled, "rules", usize::MAX)),
        outline_meta = pretty(&outline.get("metadata").cloned().unwrap_or(Value::Null)),
        outline_class = pretty(&outline.get("classification").cloned().unwrap_or(Value::Null)),
    )
}

fn parse_response(text: &str) -> Option<(Vec<Issue>, Vec<String>)> {
    let parsed: Value = serde_json::from_str(strip_code_fence(text)).ok()?;

    let issues = parsed
        .get("issues")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .enumerate()
                .map(|(idx, item)| {
                    let severity = item
                        .get("severity")
                        .and_then(|v| v.as_str())
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(IssueSeverity::Minor);
                    Issue::new(
                        format!("LLM-{:03}", idx + 1),
                        severity,
                        item.get("category").and_then(|v| v.as_str()).unwrap_or("reasoning"),
                        item.get("message").and_then(|v| v.as_str()).unwrap_or(""),
                        item.get("evidence").cloned().unwrap_or(json!({})),
                        item.get("fix_hint").and_then(|v| v.as_str()).unwrap_or(""),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    let strengths = parsed
        .get("strengths")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|s| s.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    Some((issues, strengths))
}

/// One call to the reasoning model. Any failure (transport, parse) is
/// logged and swallowed: the deterministic layer alone decides then.
pub async fn review(
    chat: &dyn ChatClient,
    compiled: &Value,
    outline: &Value,
    readme: &str,
) -> (Vec<Issue>, Vec<String>) {
    let user_prompt = build_user_prompt(compiled, outline, readme);
    match chat.complete(Some(SYSTEM_PROMPT), &user_prompt).await {
        Ok(text) => match parse_response(&text) {
            Some(result) => result,
            None => {
                tracing::warn!("LLM reasoning returned unparseable output, skipping");
                (Vec::new(), Vec::new())
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "LLM reasoning failed, skipping");
            (Vec::new(), Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use finkb_llm::LlmError;

    struct Scripted(String);

    #[async_trait]
    impl ChatClient for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            _system: Option<&str>,
            _user: &str,
        ) -> Result<String, LlmError> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    #[async_trait]
    impl ChatClient for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn complete(
            &self,
            _system: Option<&str>,
            _user: &str,
        ) -> Result<String, LlmError> {
            Err(LlmError::Transport("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn parses_fenced_json_response() {
        let response = r#"```json
{"issues": [{"severity": "MAJOR", "category": "coherence", "message": "Stage 2 contradicts stage 1", "evidence": {"path": "data/methodologies/b.yaml", "pointer": "/structure/stages/1"}, "fix_hint": "reorder"}], "strengths": ["clear stage flow"]}
```"#;
        let chat = Scripted(response.to_string());
        let (issues, strengths) =
            review(&chat, &json!({}), &json!({}), "").await;
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].id, "LLM-001");
        assert_eq!(issues[0].severity, IssueSeverity::Major);
        assert_eq!(strengths, vec!["clear stage flow".to_string()]);
    }

    #[tokio::test]
    async fn unparseable_output_is_silently_skipped() {
        let chat = Scripted("I think everything is fine!".to_string());
        let (issues, strengths) = review(&chat, &json!({}), &json!({}), "").await;
        assert!(issues.is_empty());
        assert!(strengths.is_empty());
    }

    #[tokio::test]
    async fn transport_failure_is_silently_skipped() {
        let (issues, strengths) = review(&Failing, &json!({}), &json!({}), "").await;
        assert!(issues.is_empty());
        assert!(strengths.is_empty());
    }

    #[test]
    fn prompt_truncates_readme_and_lists() {
        let compiled = json!({
            "metadata": {"id": "b1"},
            "structure": {
                "stages": (0..8).map(|i| json!({"id": format!("stage_{:03}", i + 1)})).collect::<Vec<_>>(),
                "tools": [],
                "indicators": [],
                "rules": [],
            }
        });
        let readme = "x".repeat(3000);
        let prompt = build_user_prompt(&compiled, &json!({}), &readme);
        assert!(prompt.contains("- Stages: 8"));
        assert!(prompt.contains("stage_005"));
        assert!(!prompt.contains("stage_006"));
        assert!(prompt.contains(&"x".repeat(2000)));
        assert!(!prompt.contains(&"x".repeat(2001)));
    }

    #[test]
    fn unknown_severity_defaults_to_minor() {
        let response = r#"{"issues": [{"severity": "CATASTROPHIC", "message": "m"}], "strengths": []}"#;
        let (issues, _) = parse_response(response).unwrap();
        assert_eq!(issues[0].severity, IssueSeverity::Minor);
    }
}
