use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use crate::{ChatClient, LlmError};

const DEFAULT_MODEL: &str = "GigaChat";
const SCOPE: &str = "GIGACHAT_API_PERS";

struct Token {
    access_token: String,
    expires_at: i64,
}

/// GigaChat client: OAuth client-credentials token exchange followed by
/// chat completions. The token is cached until shortly before expiry.
pub struct GigaChatClient {
    client: reqwest::Client,
    base_url: String,
    auth_url: String,
    credentials: String,
    token: Mutex<Option<Token>>,
}

impl GigaChatClient {
    pub fn new(credentials: String, config: &finkb_config::LlmConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            base_url: config.gigachat_base_url.clone(),
            auth_url: config.gigachat_auth_url.clone(),
            credentials,
            token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String, LlmError> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            // 30 s of slack so a token never expires mid-request
            if token.expires_at > now + 30_000 {
                return Ok(token.access_token.clone());
            }
        }

        let resp = self
            .client
            .post(&self.auth_url)
            .header("Authorization", format!("Basic {}", self.credentials))
            .header("RqUID", uuid::Uuid::new_v4().to_string())
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(format!("scope={SCOPE}"))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Auth(format!("token exchange failed ({status}): {body}")));
        }

        let data: serde_json::Value = resp.json().await?;
        let access_token = data
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| LlmError::Auth("token response missing access_token".to_string()))?
            .to_string();
        let expires_at = data.get("expires_at").and_then(|v| v.as_i64()).unwrap_or(0);

        *guard = Some(Token {
            access_token: access_token.clone(),
            expires_at,
        });
        Ok(access_token)
    }
}

#[async_trait]
impl ChatClient for GigaChatClient {
    fn name(&self) -> &str {
        "gigachat"
    }

    async fn complete(&self, system: Option<&str>, user: &str) -> Result<String, LlmError> {
        let token = self.access_token().await?;

        // GigaChat takes a single flattened prompt
        let prompt = match system {
            Some(s) => format!("{s}\n\n{user}"),
            None => user.to_string(),
        };

        let body = json!({
            "model": DEFAULT_MODEL,
            "messages": [{"role": "user", "content": prompt}],
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&token)
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
        data.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| LlmError::MalformedResponse("no choices[0].message.content".to_string()))
    }
}
