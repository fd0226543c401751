use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::gateway::{AiGateway, AiGatewayError, AiGatewayFuture, AiRequest, AiResponse};
use super::prompts::EMPTY_RESPONSE_FALLBACK;
use crate::config::ConfigError;
use crate::config_env::{optional_trimmed_env, parse_u32_env, parse_u64_env, require_env};
use crate::models::{InlineImage, MessageRole};

const DEFAULT_API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_RETRY_BASE_BACKOFF_MS: u64 = 250;

const DEFAULT_PRIMARY_MODEL: &str = "gemini-2.0-flash";
const DEFAULT_FALLBACK_MODEL: &str = "gemini-1.5-flash";
const DEFAULT_IMAGE_MODEL: &str = "gemini-2.0-flash-preview-image-generation";

#[derive(Debug, Clone)]
pub struct GeminiModelRoute {
    pub primary_model: String,
    pub fallback_model: Option<String>,
    pub image_model: String,
}

impl GeminiModelRoute {
    fn candidate_models(&self, image_output: bool) -> Vec<&str> {
        if image_output {
            return if self.image_model.is_empty() {
                Vec::new()
            } else {
                vec![self.image_model.as_str()]
            };
        }

        let mut candidates = Vec::new();
        if !self.primary_model.is_empty() {
            candidates.push(self.primary_model.as_str());
        }

        if let Some(fallback_model) = self.fallback_model.as_deref()
            && !fallback_model.is_empty()
            && fallback_model != self.primary_model
        {
            candidates.push(fallback_model);
        }

        candidates
    }
}

impl Default for GeminiModelRoute {
    fn default() -> Self {
        Self {
            primary_model: DEFAULT_PRIMARY_MODEL.to_string(),
            fallback_model: Some(DEFAULT_FALLBACK_MODEL.to_string()),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeminiGatewayConfig {
    pub api_base_url: String,
    pub api_key: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_backoff_ms: u64,
    pub model_route: GeminiModelRoute,
}

impl GeminiGatewayConfig {
    pub fn new(api_base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            api_key: api_key.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_backoff_ms: DEFAULT_RETRY_BASE_BACKOFF_MS,
            model_route: GeminiModelRoute::default(),
        }
    }

    pub fn from_env() -> Result<Self, GeminiConfigError> {
        let api_key = require_env("GEMINI_API_KEY")?;
        let api_base_url = optional_trimmed_env("GEMINI_API_BASE_URL")
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());

        let config = Self {
            api_base_url,
            api_key,
            timeout_ms: parse_u64_env("GEMINI_TIMEOUT_MS", DEFAULT_TIMEOUT_MS)?,
            max_retries: parse_u32_env("GEMINI_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            retry_base_backoff_ms: parse_u64_env(
                "GEMINI_RETRY_BASE_BACKOFF_MS",
                DEFAULT_RETRY_BASE_BACKOFF_MS,
            )?,
            model_route: parse_model_route(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GeminiConfigError> {
        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://")
        {
            return Err(GeminiConfigError::InvalidConfiguration(
                "GEMINI_API_BASE_URL must start with http:// or https://".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(GeminiConfigError::InvalidConfiguration(
                "GEMINI_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    fn endpoint_for(&self, model: &str) -> String {
        format!(
            "{}/{model}:generateContent",
            self.api_base_url.trim_end_matches('/')
        )
    }
}

#[derive(Debug, Error)]
pub enum GeminiConfigError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("failed to build Gemini http client: {0}")]
    HttpClient(String),
}

#[derive(Clone)]
pub struct GeminiGateway {
    client: reqwest::Client,
    config: GeminiGatewayConfig,
}

impl GeminiGateway {
    pub fn new(config: GeminiGatewayConfig) -> Result<Self, GeminiConfigError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|err| GeminiConfigError::HttpClient(err.to_string()))?;

        Ok(Self { client, config })
    }

    async fn generate_for_model(
        &self,
        model: &str,
        request: &AiRequest,
    ) -> Result<AiResponse, ModelAttemptError> {
        let mut attempt = 0_u32;

        loop {
            match self.send_once(model, request).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    if err.retryable && attempt < self.config.max_retries {
                        let backoff_ms = self
                            .config
                            .retry_base_backoff_ms
                            .saturating_mul(2_u64.saturating_pow(attempt));
                        debug!(model, attempt, backoff_ms, error = %err.error, "retrying gemini request");
                        sleep(Duration::from_millis(backoff_ms)).await;
                        attempt = attempt.saturating_add(1);
                        continue;
                    }

                    return Err(ModelAttemptError {
                        error: err.error,
                        fallback_allowed: err.fallback_allowed,
                    });
                }
            }
        }
    }

    async fn send_once(
        &self,
        model: &str,
        request: &AiRequest,
    ) -> Result<AiResponse, SendAttemptError> {
        let response = self
            .client
            .post(self.config.endpoint_for(model))
            .header("x-goog-api-key", &self.config.api_key)
            .json(&request_body(request))
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    SendAttemptError::retryable(AiGatewayError::Timeout, true)
                } else {
                    SendAttemptError::retryable(
                        AiGatewayError::ProviderFailure("request_unavailable".to_string()),
                        true,
                    )
                }
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|_| {
            SendAttemptError::non_retryable(
                AiGatewayError::InvalidProviderPayload("response_body_read_failed".to_string()),
                true,
            )
        })?;

        if !status.is_success() {
            let provider_code = parse_provider_error_code(&body);
            return Err(SendAttemptError {
                error: AiGatewayError::ProviderFailure(format!(
                    "status={} code={provider_code}",
                    status.as_u16()
                )),
                retryable: is_retryable_status(status),
                fallback_allowed: status != StatusCode::UNAUTHORIZED
                    && status != StatusCode::FORBIDDEN,
            });
        }

        let parsed: GenerateContentResponse = serde_json::from_str(&body).map_err(|_| {
            SendAttemptError::non_retryable(
                AiGatewayError::InvalidProviderPayload("response_json_parse_failed".to_string()),
                true,
            )
        })?;

        parse_candidate(model, parsed).map_err(|err| SendAttemptError::non_retryable(err, true))
    }
}

impl AiGateway for GeminiGateway {
    fn generate<'a>(&'a self, request: AiRequest) -> AiGatewayFuture<'a> {
        Box::pin(async move {
            let candidate_models = self.config.model_route.candidate_models(request.image_output);

            for (index, model) in candidate_models.iter().enumerate() {
                match self.generate_for_model(model, &request).await {
                    Ok(response) => return Ok(response),
                    Err(model_err) => {
                        let has_more_candidates = index + 1 < candidate_models.len();
                        if has_more_candidates && model_err.fallback_allowed {
                            warn!(model, error = %model_err.error, "gemini model failed, trying fallback");
                            continue;
                        }
                        return Err(model_err.error);
                    }
                }
            }

            Err(AiGatewayError::ProviderFailure(
                "no_gemini_model_candidates".to_string(),
            ))
        })
    }
}

fn request_body(request: &AiRequest) -> Value {
    let mut contents = request
        .prior_turns
        .iter()
        .filter(|turn| !turn.text.trim().is_empty())
        .map(|turn| {
            let role = match turn.role {
                MessageRole::User => "user",
                MessageRole::Ai => "model",
            };
            json!({ "role": role, "parts": [{ "text": turn.text }] })
        })
        .collect::<Vec<_>>();

    let mut parts = vec![json!({ "text": request.text })];
    if let Some(image) = &request.image {
        parts.push(json!({
            "inlineData": {
                "mimeType": image.mime_type,
                "data": BASE64.encode(&image.data),
            }
        }));
    }
    contents.push(json!({ "role": "user", "parts": parts }));

    let mut body = json!({
        "systemInstruction": { "parts": [{ "text": request.system_instruction }] },
        "contents": contents,
    });
    if request.image_output {
        body["generationConfig"] = json!({ "responseModalities": ["TEXT", "IMAGE"] });
    }
    body
}

fn parse_candidate(
    model: &str,
    parsed: GenerateContentResponse,
) -> Result<AiResponse, AiGatewayError> {
    let parts = parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .map(|content| content.parts)
        .unwrap_or_default();

    let mut text = String::new();
    let mut image = None;
    for part in parts {
        if let Some(fragment) = part.text {
            text.push_str(&fragment);
        }
        if image.is_none()
            && let Some(inline) = part.inline_data
        {
            let data = BASE64.decode(inline.data.as_bytes()).map_err(|_| {
                AiGatewayError::InvalidProviderPayload("inline_data_not_base64".to_string())
            })?;
            image = Some(InlineImage::new(inline.mime_type, data));
        }
    }

    let text = text.trim();
    Ok(AiResponse {
        model: parsed.model_version.unwrap_or_else(|| model.to_string()),
        text: if text.is_empty() {
            EMPTY_RESPONSE_FALLBACK.to_string()
        } else {
            text.to_string()
        },
        image,
    })
}

#[derive(Debug)]
struct SendAttemptError {
    error: AiGatewayError,
    retryable: bool,
    fallback_allowed: bool,
}

impl SendAttemptError {
    fn retryable(error: AiGatewayError, fallback_allowed: bool) -> Self {
        Self {
            error,
            retryable: true,
            fallback_allowed,
        }
    }

    fn non_retryable(error: AiGatewayError, fallback_allowed: bool) -> Self {
        Self {
            error,
            retryable: false,
            fallback_allowed,
        }
    }
}

#[derive(Debug)]
struct ModelAttemptError {
    error: AiGatewayError,
    fallback_allowed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    text: Option<String>,
    inline_data: Option<GeminiInlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

fn parse_model_route() -> GeminiModelRoute {
    GeminiModelRoute {
        primary_model: optional_trimmed_env("GEMINI_MODEL_PRIMARY")
            .unwrap_or_else(|| DEFAULT_PRIMARY_MODEL.to_string()),
        fallback_model: optional_trimmed_env("GEMINI_MODEL_FALLBACK")
            .or_else(|| Some(DEFAULT_FALLBACK_MODEL.to_string())),
        image_model: optional_trimmed_env("GEMINI_IMAGE_MODEL")
            .unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string()),
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn parse_provider_error_code(body: &str) -> String {
    #[derive(Deserialize)]
    struct ProviderErrorEnvelope {
        error: Option<ProviderErrorDetails>,
    }

    #[derive(Deserialize)]
    struct ProviderErrorDetails {
        status: Option<String>,
        code: Option<Value>,
    }

    let Some(details) = serde_json::from_str::<ProviderErrorEnvelope>(body)
        .ok()
        .and_then(|envelope| envelope.error)
    else {
        return "unknown".to_string();
    };

    if let Some(status) = details.status.filter(|status| !status.is_empty()) {
        return status;
    }
    match details.code {
        Some(Value::String(code)) => code,
        Some(Value::Number(code)) => code.to_string(),
        _ => "unknown".to_string(),
    }
}
