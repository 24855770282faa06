use crate::config::ProviderConfig;
use crate::error::{MentorError, Result};
use crate::providers::{CompletionRequest, CompletionResponse, Provider, ProviderInfo, Usage};
use async_trait::async_trait;
use reqwest::Client;
use serde_json;

/// OpenAI-compatible chat completions endpoint (OpenRouter by default).
pub struct OpenRouterProvider {
    api_key: Option<String>,
    base_url: String,
    client: Client,
    default_model: String,
}

impl OpenRouterProvider {
    const DEFAULT_MODEL: &'static str = "google/gemini-flash-1.5";

    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://openrouter.ai/api/v1".to_string());

        Ok(Self {
            api_key: config.api_key.clone(),
            base_url,
            client: super::http_client(config)?,
            default_model: config
                .default_model
                .clone()
                .unwrap_or_else(|| Self::DEFAULT_MODEL.to_string()),
        })
    }

    fn request_body(request: &CompletionRequest) -> serde_json::Value {
        serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature.unwrap_or(0.7),
            "max_tokens": request.max_tokens,
            "stream": false,
        })
    }

    fn parse_response(data: &serde_json::Value, model: String) -> CompletionResponse {
        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();

        let finish_reason = data["choices"][0]["finish_reason"]
            .as_str()
            .map(|s| s.to_string());

        let usage = data.get("usage").map(|usage| Usage {
            prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
            total_tokens: usage["total_tokens"].as_u64().unwrap_or(0) as u32,
        });

        CompletionResponse {
            id: data["id"].as_str().unwrap_or("unknown").to_string(),
            model,
            content,
            finish_reason,
            usage,
        }
    }
}

#[async_trait]
impl Provider for OpenRouterProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "openrouter".to_string(),
            display_name: "OpenRouter".to_string(),
            default_model: self.default_model.clone(),
        }
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let api_key = self.api_key.as_ref().ok_or_else(|| {
            MentorError::Authentication("OpenRouter API key not configured".to_string())
        })?;

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&Self::request_body(&request))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(MentorError::ApiRequest(format!(
                "OpenRouter API error {}: {}",
                status, error_text
            )));
        }

        let data: serde_json::Value = response.json().await?;
        Ok(Self::parse_response(&data, request.model))
    }
}
