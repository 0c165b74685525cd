use async_trait::async_trait;
use serde_json::json;

use crate::{ChatClient, LlmError};

/// Requesty AI router client. The router speaks the Anthropic messages
/// format regardless of the routed model.
pub struct RequestyClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: Option<f32>,
}

impl RequestyClient {
    pub fn new(api_key: String, config: &finkb_config::LlmConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            base_url: config.requesty_base_url.clone(),
            api_key,
            model: config.requesty_model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }
}

#[async_trait]
impl ChatClient for RequestyClient {
    fn name(&self) -> &str {
        "requesty"
    }

    async fn complete(&self, system: Option<&str>, user: &str) -> Result<String, LlmError> {
        // The router rejects a separate system role for some models; prepend it.
        let content = match system {
            Some(s) => format!("{s}\n\n{user}"),
            None => user.to_string(),
        };

        let mut body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": content}],
            "max_tokens": self.max_tokens,
        });
        if let Some(temp) = self.temperature {
            body["temperature"] = json!(temp);
        }

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let data: serde_json::Value = resp.json().await?;
        data.get("content")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("text"))
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| LlmError::MalformedResponse("no content[0].text".to_string()))
    }
}
