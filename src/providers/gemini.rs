use crate::config::ProviderConfig;
use crate::error::{MentorError, Result};
use crate::providers::{
    CompletionRequest, CompletionResponse, Message, Provider, ProviderInfo, Role, Usage,
};
use async_trait::async_trait;
use reqwest::Client;
use serde_json;

/// Gemini `generateContent` over an API key.
pub struct GeminiProvider {
    api_key: Option<String>,
    base_url: String,
    client: Client,
    default_model: String,
}

impl GeminiProvider {
    const DEFAULT_MODEL: &'static str = "gemini-1.5-flash";

    pub fn new(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            api_key: config.api_key.clone(),
            base_url: config.base_url.clone().unwrap_or_else(|| {
                "https://generativelanguage.googleapis.com/v1beta".to_string()
            }),
            client: super::http_client(config)?,
            default_model: config
                .default_model
                .clone()
                .unwrap_or_else(|| Self::DEFAULT_MODEL.to_string()),
        })
    }

    /// Gemini has no system role in `contents`; system text goes to `systemInstruction`.
    fn request_body(request: &CompletionRequest) -> serde_json::Value {
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();

        let contents: Vec<serde_json::Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(Self::convert_message)
            .collect();

        let mut body = serde_json::json!({
            "contents": contents,
            "generationConfig": {
                "temperature": request.temperature.unwrap_or(0.7),
                "maxOutputTokens": request.max_tokens,
            }
        });

        if !system.is_empty() {
            body["systemInstruction"] = serde_json::json!({
                "parts": [{"text": system.join("\n")}]
            });
        }

        body
    }

    fn convert_message(msg: &Message) -> serde_json::Value {
        serde_json::json!({
            "role": match msg.role {
                Role::Assistant => "model",
                _ => "user",
            },
            "parts": [{"text": msg.content}]
        })
    }

    fn model_path(model: &str) -> String {
        if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{}", model)
        }
    }

    fn parse_response(data: &serde_json::Value, model: String) -> CompletionResponse {
        // Multi-part candidates are concatenated.
        let content = data["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let finish_reason = data["candidates"][0]["finishReason"]
            .as_str()
            .map(|s| s.to_string());

        let usage = data.get("usageMetadata").map(|usage| Usage {
            prompt_tokens: usage["promptTokenCount"].as_u64().unwrap_or(0) as u32,
            completion_tokens: usage["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
            total_tokens: usage["totalTokenCount"].as_u64().unwrap_or(0) as u32,
        });

        CompletionResponse {
            id: data["responseId"].as_str().unwrap_or("unknown").to_string(),
            model,
            content,
            finish_reason,
            usage,
        }
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "gemini".to_string(),
            display_name: "Google Gemini".to_string(),
            default_model: self.default_model.clone(),
        }
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let api_key = self.api_key.as_ref().ok_or_else(|| {
            MentorError::Authentication("Gemini API key not configured".to_string())
        })?;

        let url = format!(
            "{}/{}:generateContent",
            self.base_url,
            Self::model_path(&request.model)
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .header("Content-Type", "application/json")
            .json(&Self::request_body(&request))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(MentorError::ApiRequest(format!(
                "Gemini API error {}: {}",
                status, error_text
            )));
        }

        let data: serde_json::Value = response.json().await?;
        Ok(Self::parse_response(&data, request.model))
    }
}
