//! Image model backed by the graph/workflow backend (ComfyUI).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;

use crate::checkpoint::resolve_checkpoint;
use crate::error::{AbortStage, ProviderError, Result};
use crate::job::{JobRunner, MAX_POLL_ATTEMPTS, POLL_INTERVAL};
use crate::model::ImageModel;
use crate::types::{
    combine_headers, parse_size, CallWarning, ImageCall, ImageResponse, ProviderOptions,
    ResponseMetadata,
};
use crate::workflow::GenerationRequest;

/// Default endpoint of a local ComfyUI instance.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8188";

fn normalize(endpoint: String) -> String {
    endpoint.trim_end_matches('/').to_string()
}

/// Generation settings for the graph backend. A closed option bag: every
/// supported knob is a named field, there is no passthrough for unknown keys.
/// Per-call settings override the model's defaults field by field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComfyUiSettings {
    /// Negative prompt (default empty).
    pub negative_prompt: Option<String>,
    /// Seed used when the call itself carries none.
    pub seed: Option<i64>,
    /// Sampling steps (backend default 20).
    pub steps: Option<u32>,
    /// Classifier-free guidance scale (backend default 7).
    pub cfg_scale: Option<f64>,
    /// Sampler algorithm (backend default "euler").
    pub sampler: Option<String>,
    /// Noise scheduler (backend default "normal").
    pub scheduler: Option<String>,
    /// Output width; overrides the size-class default.
    pub width: Option<u32>,
    /// Output height; overrides the size-class default.
    pub height: Option<u32>,
    /// Denoising strength (backend default 1).
    pub denoising_strength: Option<f64>,
    /// Verify the checkpoint exists on the backend before submitting.
    pub check_model_exists: bool,
}

impl ComfyUiSettings {
    /// Layer `overrides` on top of `self`. Set fields in `overrides` win.
    pub fn merged_with(&self, overrides: &ComfyUiSettings) -> ComfyUiSettings {
        ComfyUiSettings {
            negative_prompt: overrides
                .negative_prompt
                .clone()
                .or_else(|| self.negative_prompt.clone()),
            seed: overrides.seed.or(self.seed),
            steps: overrides.steps.or(self.steps),
            cfg_scale: overrides.cfg_scale.or(self.cfg_scale),
            sampler: overrides.sampler.clone().or_else(|| self.sampler.clone()),
            scheduler: overrides
                .scheduler
                .clone()
                .or_else(|| self.scheduler.clone()),
            width: overrides.width.or(self.width),
            height: overrides.height.or(self.height),
            denoising_strength: overrides.denoising_strength.or(self.denoising_strength),
            check_model_exists: overrides.check_model_exists || self.check_model_exists,
        }
    }
}

/// Image model that executes generation as a directed graph of typed nodes
/// on a ComfyUI server: build workflow, submit, poll, download.
///
/// # Example
/// ```no_run
/// use sd_provider::{ComfyUiImageModel, ImageCall, ImageModel};
///
/// # async fn example() -> sd_provider::Result<()> {
/// let model = ComfyUiImageModel::new("dreamshaper-8")
///     .with_base_url("http://127.0.0.1:8188")
///     .with_client_id("my-app");
///
/// let response = model.generate(ImageCall::new("a sunset over mountains")).await?;
/// assert_eq!(response.images.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ComfyUiImageModel {
    model_id: String,
    http: Client,
    base_url: String,
    client_id: String,
    headers: BTreeMap<String, String>,
    defaults: ComfyUiSettings,
    poll_interval: Duration,
    max_poll_attempts: u32,
}

impl ComfyUiImageModel {
    /// Create a model for the given identifier against the default local
    /// endpoint.
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            http: Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client_id: "sd-provider".to_string(),
            headers: BTreeMap::new(),
            defaults: ComfyUiSettings::default(),
            poll_interval: POLL_INTERVAL,
            max_poll_attempts: MAX_POLL_ATTEMPTS,
        }
    }

    /// Point the model at a different endpoint. Trailing slashes are
    /// stripped.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = normalize(base_url.into());
        self
    }

    /// Set the client ID sent with every submission.
    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
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
    pub fn with_defaults(mut self, defaults: ComfyUiSettings) -> Self {
        self.defaults = defaults;
        self
    }

    /// Use a custom `reqwest::Client` (for connection pooling, timeouts, TLS).
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    /// Override the inter-poll delay (default 500 ms).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Override the poll attempt ceiling (default 60).
    pub fn with_max_poll_attempts(mut self, attempts: u32) -> Self {
        self.max_poll_attempts = attempts;
        self
    }

    /// Returns the configured endpoint URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the configured client ID.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// List checkpoint filenames available on the backend.
    pub async fn checkpoints(&self) -> Result<Vec<String>> {
        self.fetch_checkpoints(&self.headers).await
    }

    async fn fetch_checkpoints(&self, headers: &BTreeMap<String, String>) -> Result<Vec<String>> {
        let url = format!("{}/models/checkpoints", self.base_url);
        let mut request = self.http.get(&url).timeout(Duration::from_secs(10));
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let resp = request.send().await.map_err(|e| {
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
            .map_err(|e| ProviderError::network("Failed to parse checkpoint list", e))
    }

    /// Fold call parameters and merged settings into a generation request.
    fn build_request(
        &self,
        call: &ImageCall,
        settings: &ComfyUiSettings,
        checkpoint: &str,
    ) -> GenerationRequest {
        let mut request =
            GenerationRequest::new(&call.prompt, checkpoint).batch_size(call.n.max(1));

        if let Some(negative) = &settings.negative_prompt {
            request = request.negative(negative.clone());
        }
        // Explicit call seed wins over the settings seed; unset falls back
        // to a random draw at build time.
        if let Some(seed) = call.seed.or(settings.seed) {
            request = request.seed(seed);
        }
        if let Some(steps) = settings.steps {
            request = request.steps(steps);
        }
        if let Some(cfg) = settings.cfg_scale {
            request = request.cfg_scale(cfg);
        }
        if let Some(sampler) = &settings.sampler {
            request = request.sampler(sampler.clone());
        }
        if let Some(scheduler) = &settings.scheduler {
            request = request.scheduler(scheduler.clone());
        }
        if let Some(denoise) = settings.denoising_strength {
            request = request.denoise(denoise);
        }

        let explicit = call.size.as_deref().and_then(parse_size);
        let width = explicit
            .map(|(w, _)| w)
            .or(settings.width)
            .unwrap_or(request.width);
        let height = explicit
            .map(|(_, h)| h)
            .or(settings.height)
            .unwrap_or(request.height);
        request.size(width, height)
    }
}

#[async_trait]
impl ImageModel for ComfyUiImageModel {
    fn provider(&self) -> &str {
        "comfyui"
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn max_images_per_call(&self) -> u32 {
        4
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
            ProviderOptions::ComfyUi(settings) => settings.clone(),
            _ => ComfyUiSettings::default(),
        };
        let settings = self.defaults.merged_with(&overrides);
        let headers = combine_headers(&self.headers, &call.headers);
        let checkpoint = resolve_checkpoint(&self.model_id);

        if settings.check_model_exists {
            if call.cancel.is_cancelled() {
                return Err(ProviderError::aborted(AbortStage::BeforeSubmission));
            }
            let available = self.fetch_checkpoints(&headers).await?;
            if !available.iter().any(|name| name == &checkpoint) {
                return Err(ProviderError::ModelNotFound {
                    model_id: self.model_id.clone(),
                });
            }
        }

        let request = self.build_request(&call, &settings, &checkpoint);
        let (workflow, _seed) = request.build();

        let runner = JobRunner {
            http: &self.http,
            base_url: &self.base_url,
            client_id: &self.client_id,
            headers: &headers,
            poll_interval: self.poll_interval,
            max_poll_attempts: self.max_poll_attempts,
        };
        let images = runner.run(&workflow, &call.cancel).await?;

        Ok(ImageResponse {
            images,
            warnings,
            metadata: ResponseMetadata {
                model_id: self.model_id.clone(),
                timestamp: Utc::now(),
                headers: BTreeMap::new(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_endpoint() {
        let model = ComfyUiImageModel::new("test").with_base_url("http://localhost:8188/");
        assert_eq!(model.base_url(), "http://localhost:8188");

        let model = ComfyUiImageModel::new("test").with_base_url("http://host:8188///");
        assert_eq!(model.base_url(), "http://host:8188");
    }

    #[test]
    fn test_builder_defaults() {
        let model = ComfyUiImageModel::new("sdxl-base");
        assert_eq!(model.base_url(), DEFAULT_BASE_URL);
        assert_eq!(model.client_id(), "sd-provider");
        assert_eq!(model.model_id(), "sdxl-base");
        assert_eq!(model.max_images_per_call(), 4);
        assert_eq!(model.poll_interval, POLL_INTERVAL);
        assert_eq!(model.max_poll_attempts, MAX_POLL_ATTEMPTS);
    }

    #[test]
    fn test_api_key_becomes_bearer_header() {
        let model = ComfyUiImageModel::new("test").with_api_key("secret");
        assert_eq!(
            model.headers.get("Authorization").map(String::as_str),
            Some("Bearer secret")
        );
    }

    #[test]
    fn test_settings_merge_overrides_win() {
        let defaults = ComfyUiSettings {
            steps: Some(20),
            sampler: Some("euler".to_string()),
            ..Default::default()
        };
        let overrides = ComfyUiSettings {
            steps: Some(30),
            cfg_scale: Some(8.0),
            ..Default::default()
        };

        let merged = defaults.merged_with(&overrides);
        assert_eq!(merged.steps, Some(30));
        assert_eq!(merged.sampler.as_deref(), Some("euler"));
        assert_eq!(merged.cfg_scale, Some(8.0));
    }

    #[test]
    fn test_settings_merge_check_model_exists_sticky() {
        let defaults = ComfyUiSettings {
            check_model_exists: true,
            ..Default::default()
        };
        let merged = defaults.merged_with(&ComfyUiSettings::default());
        assert!(merged.check_model_exists);
    }

    #[test]
    fn test_call_seed_beats_settings_seed() {
        let model = ComfyUiImageModel::new("test");
        let call = ImageCall::new("prompt").seed(99);
        let settings = ComfyUiSettings {
            seed: Some(7),
            ..Default::default()
        };
        let request = model.build_request(&call, &settings, "test.safetensors");
        assert_eq!(request.seed, Some(99));
    }

    #[test]
    fn test_settings_seed_used_when_call_has_none() {
        let model = ComfyUiImageModel::new("test");
        let call = ImageCall::new("prompt");
        let settings = ComfyUiSettings {
            seed: Some(7),
            ..Default::default()
        };
        let request = model.build_request(&call, &settings, "test.safetensors");
        assert_eq!(request.seed, Some(7));
    }

    #[test]
    fn test_size_string_beats_settings_and_size_class() {
        let model = ComfyUiImageModel::new("sdxl-base");
        let call = ImageCall::new("prompt").size("768x768");
        let settings = ComfyUiSettings {
            width: Some(640),
            height: Some(640),
            ..Default::default()
        };
        let request = model.build_request(&call, &settings, "sdxl_base.safetensors");
        assert_eq!((request.width, request.height), (768, 768));
    }

    #[test]
    fn test_settings_dimensions_beat_size_class_default() {
        let model = ComfyUiImageModel::new("sdxl-base");
        let call = ImageCall::new("prompt");
        let settings = ComfyUiSettings {
            width: Some(640),
            ..Default::default()
        };
        let request = model.build_request(&call, &settings, "sdxl_base.safetensors");
        // Height keeps the XL class default.
        assert_eq!((request.width, request.height), (640, 1024));
    }

    #[test]
    fn test_batch_size_from_call_count() {
        let model = ComfyUiImageModel::new("test");
        let call = ImageCall::new("prompt").count(3);
        let request = model.build_request(&call, &ComfyUiSettings::default(), "t.safetensors");
        assert_eq!(request.batch_size, 3);
    }
}
