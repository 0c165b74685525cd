pub mod gigachat;
pub mod requesty;

mod error;

pub use error::LlmError;
pub use gigachat::GigaChatClient;
pub use requesty::RequestyClient;

use async_trait::async_trait;

/// A single-turn chat completion client. The pipeline never streams; the
/// outline builder and the QA reasoning layer each make one call and parse
/// the full response.
#[async_trait]
pub trait ChatClient: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, system: Option<&str>, user: &str) -> Result<String, LlmError>;
}

/// Tries the primary client first, falling back on any error.
pub struct FallbackClient {
    primary: Box<dyn ChatClient>,
    fallback: Box<dyn ChatClient>,
}

impl FallbackClient {
    pub fn new(primary: Box<dyn ChatClient>, fallback: Box<dyn ChatClient>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl ChatClient for FallbackClient {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn complete(&self, system: Option<&str>, user: &str) -> Result<String, LlmError> {
        match self.primary.complete(system, user).await {
            Ok(text) => Ok(text),
            Err(e) => {
                tracing::warn!(
                    provider = self.primary.name(),
                    error = %e,
                    "Primary LLM failed, switching to {}",
                    self.fallback.name()
                );
                self.fallback.complete(system, user).await
            }
        }
    }
}

/// Build a chat client from config and the available credentials.
///
/// GigaChat is used as primary when requested and credentialed; the
/// Requesty router is the fallback (and the default when GigaChat is off).
pub fn create_client(config: &finkb_config::LlmConfig) -> anyhow::Result<Box<dyn ChatClient>> {
    let requesty = config
        .requesty_api_key()
        .map(|key| RequestyClient::new(key, config));

    if config.use_gigachat {
        if let Some(credentials) = config.gigachat_credentials() {
            let giga = GigaChatClient::new(credentials, config);
            return Ok(match requesty {
                Some(r) => Box::new(FallbackClient::new(Box::new(giga), Box::new(r))),
                None => Box::new(giga),
            });
        }
        tracing::warn!("GIGACHAT_CREDENTIALS not set, falling back to Requesty router");
    }

    match requesty {
        Some(r) => Ok(Box::new(r)),
        None => anyhow::bail!(
            "No LLM credentials available (set REQUESTY_API_KEY or GIGACHAT_CREDENTIALS)"
        ),
    }
}

/// Strip a markdown code fence from a model response, if present.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let body = &trimmed[start + 7..];
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
    }
    if let Some(start) = trimmed.find("```") {
        let body = &trimmed[start + 3..];
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

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

    struct Failing;

    #[async_trait]
    impl ChatClient for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn complete(&self, _system: Option<&str>, _user: &str) -> Result<String, LlmError> {
            Err(LlmError::Http {
                status: 503,
                body: "unavailable".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn fallback_uses_secondary_on_error() {
        let client = FallbackClient::new(Box::new(Failing), Box::new(Scripted("ok")));
        let out = client.complete(None, "hi").await.unwrap();
        assert_eq!(out, "ok");
    }

    #[tokio::test]
    async fn fallback_prefers_primary() {
        let client = FallbackClient::new(Box::new(Scripted("primary")), Box::new(Scripted("secondary")));
        let out = client.complete(None, "hi").await.unwrap();
        assert_eq!(out, "primary");
    }

    #[test]
    fn strips_json_fence() {
        let raw = "Here you go:\n```json\n{\"a\": 1}\n```\n";
        assert_eq!(strip_code_fence(raw), "{\"a\": 1}");
    }

    #[test]
    fn strips_bare_fence() {
        let raw = "```\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fence(raw), "{\"a\": 1}");
    }

    #[test]
    fn passes_through_unfenced() {
        assert_eq!(strip_code_fence("  {\"a\": 1} "), "{\"a\": 1}");
    }
}
