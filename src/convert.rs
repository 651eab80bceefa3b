// src/convert.rs
use std::time::Duration;

use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use crate::{
    config::GeminiConfig,
    data_url::DataUrl,
    error::{Error, Result},
};

const NO_TEXT: &str = "<no text>";

/// Turns a captured photo into its stylized version.
pub trait ImageConverter: Send + Sync {
    fn convert(&self, image: &DataUrl) -> Result<DataUrl>;
}

// --- Wire types (Gemini generateContent) ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    pub generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<Part>>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<&'static str>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    pub prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
pub struct Candidate {
    pub content: Option<Content>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    pub block_reason: Option<String>,
}

pub fn build_request(image: &DataUrl, prompt: &str) -> GenerateContentRequest {
    GenerateContentRequest {
        contents: vec![Content {
            parts: Some(vec![
                Part {
                    inline_data: Some(InlineData {
                        mime_type: image.mime().to_string(),
                        data: image.payload().to_string(),
                    }),
                    text: None,
                },
                Part {
                    inline_data: None,
                    text: Some(prompt.to_string()),
                },
            ]),
        }],
        generation_config: GenerationConfig {
            response_modalities: vec!["IMAGE", "TEXT"],
        },
    }
}

/// Picks the first image part out of the first candidate. Without one the
/// accompanying text becomes the error message. A response with no candidate
/// parts at all is malformed.
pub fn extract_image(response: GenerateContentResponse) -> Result<DataUrl> {
    let Some(parts) = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .and_then(|c| c.parts)
    else {
        let reason = response
            .prompt_feedback
            .and_then(|f| f.block_reason)
            .map(|r| format!(" (blocked: {})", r))
            .unwrap_or_default();
        return Err(Error::Conversion(format!("Invalid response from model{}", reason)));
    };

    if let Some(inline) = parts
        .iter()
        .filter_map(|p| p.inline_data.as_ref())
        .find(|d| !d.data.is_empty())
    {
        return Ok(DataUrl::new(&inline.mime_type, &inline.data));
    }

    let explanation = parts
        .into_iter()
        .find_map(|p| p.text)
        .unwrap_or_else(|| NO_TEXT.to_string());
    Err(Error::ModelOutput(explanation))
}

/// Client for the hosted image model. Built once at startup and shared.
pub struct GeminiClient {
    agent: ureq::Agent,
    url: String,
    api_key: Option<String>,
    prompt: String,
}

impl GeminiClient {
    pub fn new(config: &GeminiConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build();
        Self {
            agent,
            url: format!(
                "{}/models/{}:generateContent",
                config.endpoint.trim_end_matches('/'),
                config.model
            ),
            api_key: config.api_key.clone(),
            prompt: config.prompt.clone(),
        }
    }

    fn send(&self, image: &DataUrl) -> Result<GenerateContentResponse> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            Error::Conversion("No API key configured (set GEMINI_API_KEY).".to_string())
        })?;

        info!("Sending {} ({} base64 chars) to {}", image.mime(), image.payload().len(), self.url);
        let response = self
            .agent
            .post(&self.url)
            .set("Content-Type", "application/json")
            .set("x-goog-api-key", api_key)
            .send_json(build_request(image, &self.prompt))?;

        let body = response
            .into_string()
            .map_err(|e| Error::Conversion(format!("Failed to read response: {}", e)))?;
        debug!("Model response: {}", body.chars().take(500).collect::<String>());

        serde_json::from_str(&body)
            .map_err(|e| Error::Conversion(format!("Failed to parse response: {}", e)))
    }
}

impl ImageConverter for GeminiClient {
    fn convert(&self, image: &DataUrl) -> Result<DataUrl> {
        let result = self.send(image).and_then(extract_image);
        match &result {
            Ok(out) => info!("Model returned {} ({} base64 chars)", out.mime(), out.payload().len()),
            Err(e) => error!("Error while converting image: {:?}", e),
        }
        result
    }
}
