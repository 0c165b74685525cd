use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Missing template variable: {0}")]
    MissingVariable(String),
}

/// Jinja-style `{{ var }}` template with strict-undefined semantics: a
/// variable the context does not provide is an error, never an empty
/// string. List sections are pre-rendered by the caller and passed in as
/// ordinary variables.
pub struct DocTemplate {
    template: String,
    variables: Vec<String>,
}

impl DocTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        let template = template.into();
        let re = regex::Regex::new(r"\{\{\s*(\w+)\s*\}\}").expect("valid placeholder pattern");
        let mut variables: Vec<String> = re
            .captures_iter(&template)
            .map(|cap| cap[1].to_string())
            .collect();
        variables.sort();
        variables.dedup();
        Self { template, variables }
    }

    /// Load `name` from the templates directory when it exists, otherwise
    /// use the built-in fallback.
    pub fn load_or_fallback(templates_dir: &Path, name: &str, fallback: &str) -> Self {
        let path = templates_dir.join(name);
        if path.exists() {
            if let Ok(content) = std::fs::read_to_string(&path) {
                return Self::new(content);
            }
        }
        Self::new(fallback)
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn render(&self, context: &HashMap<&str, String>) -> Result<String, TemplateError> {
        for key in &self.variables {
            if !context.contains_key(key.as_str()) {
                return Err(TemplateError::MissingVariable(key.clone()));
            }
        }

        let mut content = self.template.clone();
        for (key, value) in context {
            // tolerate both {{key}} and {{ key }} spellings
            content = content.replace(&format!("{{{{{key}}}}}"), value);
            content = content.replace(&format!("{{{{ {key} }}}}"), value);
        }
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&'static str, &str)]) -> HashMap<&'static str, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn renders_spaced_and_tight_placeholders() {
        let t = DocTemplate::new("# {{ title }}\n\n{{body}}");
        let out = t.render(&ctx(&[("title", "Margin"), ("body", "text")])).unwrap();
        assert_eq!(out, "# Margin\n\ntext");
    }

    #[test]
    fn missing_variable_is_an_error() {
        let t = DocTemplate::new("# {{ title }}");
        let err = t.render(&ctx(&[])).unwrap_err();
        assert!(matches!(err, TemplateError::MissingVariable(v) if v == "title"));
    }

    #[test]
    fn extra_context_keys_are_ignored() {
        let t = DocTemplate::new("{{ a }}");
        let out = t.render(&ctx(&[("a", "1"), ("b", "2")])).unwrap();
        assert_eq!(out, "1");
    }

    #[test]
    fn repeated_variable_is_replaced_everywhere() {
        let t = DocTemplate::new("{{ x }} and {{ x }}");
        let out = t.render(&ctx(&[("x", "y")])).unwrap();
        assert_eq!(out, "y and y");
    }

    #[test]
    fn collects_variables_once() {
        let t = DocTemplate::new("{{ a }} {{ b }} {{ a }}");
        assert_eq!(t.variables(), &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn falls_back_when_template_dir_missing() {
        let dir = tempfile::tempdir().unwrap();
        let t = DocTemplate::load_or_fallback(
            &dir.path().join("nope"),
            "readme.md",
            "fallback {{ v }}",
        );
        let out = t.render(&ctx(&[("v", "ok")])).unwrap();
        assert_eq!(out, "fallback ok");
    }

    #[test]
    fn prefers_on_disk_template() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("readme.md"), "custom {{ v }}").unwrap();
        let t = DocTemplate::load_or_fallback(dir.path(), "readme.md", "fallback {{ v }}");
        let out = t.render(&ctx(&[("v", "ok")])).unwrap();
        assert_eq!(out, "custom ok");
    }
}
