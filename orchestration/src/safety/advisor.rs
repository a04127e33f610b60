//! Advisory-model capability.
//!
//! The language-model provider is an external collaborator consumed
//! through the [`AdvisoryModel`] trait; [`HttpAdvisor`] talks to an
//! OpenAI-compatible chat-completions endpoint with a bounded timeout.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

/// Upper bound on any advisory-model round trip.
pub const ADVISOR_TIMEOUT: Duration = Duration::from_secs(60);

/// Structured reply from the advisory model.
#[derive(Debug, Clone)]
pub struct AdvisorReply {
    pub content: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Narrow capability over the advisory model.
#[async_trait]
pub trait AdvisoryModel: Send + Sync {
    async fn query(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> anyhow::Result<AdvisorReply>;
}

/// HTTP chat-completions client for the advisory model.
pub struct HttpAdvisor {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
}

impl HttpAdvisor {
    pub fn new(url: &str, api_key: &str, model: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(ADVISOR_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl AdvisoryModel for HttpAdvisor {
    async fn query(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> anyhow::Result<AdvisorReply> {
        let mut messages = Vec::new();
        if let Some(system) = system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": prompt}));

        let response = self
            .client
            .post(format!("{}/chat/completions", self.url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "temperature": 0.0,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Ok(AdvisorReply {
                content: String::new(),
                success: false,
                error: Some(format!("advisory model returned {status}: {body}")),
            });
        }

        let body: serde_json::Value = response.json().await?;
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        debug!(model = %self.model, chars = content.len(), "Advisory model replied");

        Ok(AdvisorReply {
            content,
            success: true,
            error: None,
        })
    }
}
