//! Image model backed by the REST backend (Automatic1111 / sd-webui).
//!
//! Unlike the graph backend there is no job state to track: one POST returns
//! base64-encoded images directly, so this adapter is a single call with
//! response validation and decoding.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{AbortStage, ProviderError, Result};
use crate::model::ImageModel;
use crate::types::{
    combine_headers, parse_size, CallWarning, ImageCall, ImageResponse, ProviderOptions,
    ResponseMetadata,
};

/// Default endpoint of a local Automatic1111 instance.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:7860";

/// Generation settings for the REST backend. A closed option bag with the
/// backend's own field names; there is no passthrough for unknown keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Automatic1111Settings {
    pub negative_prompt: Option<String>,
    pub styles: Option<Vec<String>>,
    pub steps: Option<u32>,
    pub cfg_scale: Option<f64>,
    pub sampler_name: Option<String>,
    pub denoising_strength: Option<f64>,
    /// Verify the model appears in the backend's model list before
    /// generating.
    pub check_model_exists: bool,
}

#[derive(Serialize)]
struct Txt2ImgBody<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    negative_prompt: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    styles: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sampler_name: Option<&'a str>,
    n_iter: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cfg_scale: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    denoising_strength: Option<f64>,
    width: u32,
    height: u32,
    override_settings: OverrideSettings<'a>,
}

#[derive(Serialize)]
struct OverrideSettings<'a> {
    sd_model_checkpoint: &'a str,
}

#[derive(Deserialize)]
struct Txt2ImgResponse {
    images: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    detail: Vec<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    msg: String,
}

/// One entry of the backend's model list.
#[derive(Debug, Clone, Deserialize)]
pub struct SdModel {
    pub model_name: String,
    pub title: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub config: Option<String>,
}

/// Image model that calls the Automatic1111 txt2img REST endpoint.
///
/// # Example
/// ```no_run
/// use sd_provider::{Automatic1111ImageModel, ImageCall, ImageModel};
///
/// # async fn example() -> sd_provider::Result<()> {
/// let model = Automatic1111ImageModel::new("dreamshaper_8")
///     .with_base_url("http://127.0.0.1:7860");
///
/// let response = model.generate(ImageCall::new("a lighthouse at dusk")).await?;
/// assert!(!response.images[0].is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Automatic1111ImageModel {
    model_id: String,
    http: Client,
    base_url: String,
    headers: BTreeMap<String, String>,
    defaults: Automatic1111Settings,
}

impl Automatic1111ImageModel {
    /// Create a model for the given identifier against the default local
    /// endpoint.
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            http: Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            headers: BTreeMap::new(),
            defaults: Automatic1111Settings::default(),
        }
    }

    /// Point the model at a different endpoint. Trailing slashes are
    /// stripped.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Authenticate with a bearer token.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.headers
            .insert("Authorization".to_string(), format!("Bearer {}", api_key.into()));
        self
    }

    /// Add a header sent with every request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set default generation settings applied to every call.
    pub fn with_defaults(mut self, defaults: Automatic1111Settings) -> Self {
        self.defaults = defaults;
        self
    }

    /// Use a custom `reqwest::Client`.
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    /// Returns the configured endpoint URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn apply_headers(
        &self,
        mut request: RequestBuilder,
        headers: &BTreeMap<String, String>,
    ) -> RequestBuilder {
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }

    /// List models available on the backend.
    pub async fn models(&self) -> Result<Vec<SdModel>> {
        self.fetch_models(&self.headers).await
    }

    async fn fetch_models(&self, headers: &BTreeMap<String, String>) -> Result<Vec<SdModel>> {
        let url = format!("{}/sdapi/v1/sd-models/", self.base_url);
        let resp = self
            .apply_headers(self.http.get(&url), headers)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| {
                ProviderError::network(
                    format!(
                        "Cannot connect to backend at {} - is the service running?",
                        self.base_url
                    ),
                    e,
                )
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ProviderError::Api {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("").to_string(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        resp.json()
            .await
            .map_err(|e| ProviderError::network("Failed to parse model list", e))
    }

    /// Extract the backend's structured error message, falling back to a
    /// body excerpt when the shape does not match.
    fn error_message(body: &str) -> String {
        if let Ok(parsed) = serde_json::from_str::<ApiErrorBody>(body) {
            if let Some(detail) = parsed.detail.first() {
                return detail.msg.clone();
            }
        }
        let excerpt: String = body.chars().take(200).collect();
        excerpt
    }

    /// Decode one base64 image, stripping any `data:image/...;base64,`
    /// prefix first.
    fn decode_image(encoded: &str) -> Result<Vec<u8>> {
        let data = if encoded.starts_with("data:") {
            match encoded.split_once(',') {
                Some((_, rest)) => rest,
                None => encoded,
            }
        } else {
            encoded
        };
        BASE64
            .decode(data)
            .map_err(|e| ProviderError::InvalidResponse(format!("Invalid base64 image data: {}", e)))
    }
}

#[async_trait]
impl ImageModel for Automatic1111ImageModel {
    fn provider(&self) -> &str {
        "automatic1111"
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn max_images_per_call(&self) -> u32 {
        1
    }

    async fn generate(&self, call: ImageCall) -> Result<ImageResponse> {
        let mut warnings = Vec::new();
        if call.aspect_ratio.is_some() {
            warnings.push(CallWarning::UnsupportedSetting {
                setting: "aspectRatio".to_string(),
                details: "This model does not support the `aspectRatio` option. Use `size` instead."
                    .to_string(),
            });
        }

        let overrides = match &call.options {
            ProviderOptions::Automatic1111(settings) => settings.clone(),
            _ => Automatic1111Settings::default(),
        };
        let settings = Automatic1111Settings {
            negative_prompt: overrides
                .negative_prompt
                .or_else(|| self.defaults.negative_prompt.clone()),
            styles: overrides.styles.or_else(|| self.defaults.styles.clone()),
            steps: overrides.steps.or(self.defaults.steps),
            cfg_scale: overrides.cfg_scale.or(self.defaults.cfg_scale),
            sampler_name: overrides
                .sampler_name
                .or_else(|| self.defaults.sampler_name.clone()),
            denoising_strength: overrides
                .denoising_strength
                .or(self.defaults.denoising_strength),
            check_model_exists: overrides.check_model_exists || self.defaults.check_model_exists,
        };
        let headers = combine_headers(&self.headers, &call.headers);

        if settings.check_model_exists {
            if call.cancel.is_cancelled() {
                return Err(ProviderError::aborted(AbortStage::BeforeSubmission));
            }
            let models = self.fetch_models(&headers).await?;
            if !models.iter().any(|m| m.model_name == self.model_id) {
                return Err(ProviderError::ModelNotFound {
                    model_id: self.model_id.clone(),
                });
            }
        }

        if call.cancel.is_cancelled() {
            return Err(ProviderError::aborted(AbortStage::BeforeSubmission));
        }

        let (width, height) = call
            .size
            .as_deref()
            .and_then(parse_size)
            .unwrap_or((512, 512));

        let body = Txt2ImgBody {
            prompt: &call.prompt,
            negative_prompt: settings.negative_prompt.as_deref(),
            styles: settings.styles.as_deref(),
            seed: call.seed,
            sampler_name: settings.sampler_name.as_deref(),
            n_iter: call.n.max(1),
            steps: settings.steps,
            cfg_scale: settings.cfg_scale,
            denoising_strength: settings.denoising_strength,
            width,
            height,
            override_settings: OverrideSettings {
                sd_model_checkpoint: &self.model_id,
            },
        };

        let url = format!("{}/sdapi/v1/txt2img/", self.base_url);
        let resp = self
            .apply_headers(self.http.post(&url), &headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ProviderError::network(
                    format!(
                        "Cannot connect to backend at {} - is the service running?",
                        self.base_url
                    ),
                    e,
                )
            })?;

        let status = resp.status();
        let response_headers: BTreeMap<String, String> = resp
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();

        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("").to_string(),
                body: Self::error_message(&body_text),
            });
        }

        let parsed: Txt2ImgResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::network("Failed to parse txt2img response", e))?;

        let encoded = parsed
            .images
            .ok_or_else(|| ProviderError::InvalidResponse("Response missing images".into()))?;

        let images = encoded
            .iter()
            .map(|image| Self::decode_image(image))
            .collect::<Result<Vec<_>>>()?;

        Ok(ImageResponse {
            images,
            warnings,
            metadata: ResponseMetadata {
                model_id: self.model_id.clone(),
                timestamp: Utc::now(),
                headers: response_headers,
            },
        })
    }
}
