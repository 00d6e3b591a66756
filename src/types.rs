use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::automatic1111::Automatic1111Settings;
use crate::comfyui::ComfyUiSettings;

/// Reference to one output image as named by the backend, before its bytes
/// are fetched. Order of a descriptor sequence is preserved end-to-end.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ArtifactRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Provider-specific settings carried by a call. Models ignore variants
/// belonging to another provider.
#[derive(Debug, Clone, Default)]
pub enum ProviderOptions {
    #[default]
    None,
    ComfyUi(ComfyUiSettings),
    Automatic1111(Automatic1111Settings),
}

/// One uniform image generation call.
///
/// # Example
/// ```
/// use sd_provider::ImageCall;
///
/// let call = ImageCall::new("a sunset over mountains")
///     .count(2)
///     .size("768x768")
///     .seed(42);
/// assert_eq!(call.n, 2);
/// ```
#[derive(Debug, Clone)]
pub struct ImageCall {
    pub prompt: String,
    pub n: u32,
    /// Explicit output size as `"WIDTHxHEIGHT"`.
    pub size: Option<String>,
    /// Aspect-ratio hint. Not supported by either backend; carrying one
    /// produces an `unsupported-setting` warning.
    pub aspect_ratio: Option<String>,
    pub seed: Option<i64>,
    pub options: ProviderOptions,
    /// Extra headers merged over the model's configured headers.
    pub headers: BTreeMap<String, String>,
    /// Cancellation signal observed at every suspension point.
    pub cancel: CancellationToken,
}

impl ImageCall {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            n: 1,
            size: None,
            aspect_ratio: None,
            seed: None,
            options: ProviderOptions::None,
            headers: BTreeMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Set the number of images to generate.
    pub fn count(mut self, n: u32) -> Self {
        self.n = n;
        self
    }

    /// Set the output size as a `"WIDTHxHEIGHT"` string.
    pub fn size(mut self, size: impl Into<String>) -> Self {
        self.size = Some(size.into());
        self
    }

    /// Set an aspect-ratio hint (unsupported by these backends; warns).
    pub fn aspect_ratio(mut self, ratio: impl Into<String>) -> Self {
        self.aspect_ratio = Some(ratio.into());
        self
    }

    /// Set a specific seed.
    pub fn seed(mut self, seed: i64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Attach provider-specific settings for this call.
    pub fn options(mut self, options: ProviderOptions) -> Self {
        self.options = options;
        self
    }

    /// Add an extra request header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Thread a caller-owned cancellation token through the call.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

/// Non-fatal diagnostic attached to a generation response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallWarning {
    UnsupportedSetting { setting: String, details: String },
}

/// Metadata describing one generation response.
#[derive(Debug, Clone)]
pub struct ResponseMetadata {
    pub model_id: String,
    pub timestamp: DateTime<Utc>,
    pub headers: BTreeMap<String, String>,
}

/// Result of one generation call: raw image bytes in generation order,
/// warnings, and response metadata.
#[derive(Debug, Clone)]
pub struct ImageResponse {
    pub images: Vec<Vec<u8>>,
    pub warnings: Vec<CallWarning>,
    pub metadata: ResponseMetadata,
}

/// Parse a `"WIDTHxHEIGHT"` size string. Returns `None` for malformed input.
pub fn parse_size(size: &str) -> Option<(u32, u32)> {
    let (w, h) = size.split_once('x')?;
    let width = w.trim().parse().ok()?;
    let height = h.trim().parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

/// Merge configured headers with per-call headers. Call headers win.
pub(crate) fn combine_headers(
    base: &BTreeMap<String, String>,
    extra: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = base.clone();
    for (name, value) in extra {
        merged.insert(name.clone(), value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512x512"), Some((512, 512)));
        assert_eq!(parse_size("768x768"), Some((768, 768)));
        assert_eq!(parse_size("1024x768"), Some((1024, 768)));
    }

    #[test]
    fn test_parse_size_malformed() {
        assert_eq!(parse_size("512"), None);
        assert_eq!(parse_size("x512"), None);
        assert_eq!(parse_size("512x"), None);
        assert_eq!(parse_size("axb"), None);
        assert_eq!(parse_size("0x512"), None);
    }

    #[test]
    fn test_call_defaults() {
        let call = ImageCall::new("test prompt");
        assert_eq!(call.n, 1);
        assert!(call.size.is_none());
        assert!(call.seed.is_none());
        assert!(call.headers.is_empty());
        assert!(!call.cancel.is_cancelled());
    }

    #[test]
    fn test_call_builder() {
        let call = ImageCall::new("test")
            .count(4)
            .size("1024x1024")
            .seed(7)
            .header("X-Request-Id", "abc");
        assert_eq!(call.n, 4);
        assert_eq!(call.size.as_deref(), Some("1024x1024"));
        assert_eq!(call.seed, Some(7));
        assert_eq!(
            call.headers.get("X-Request-Id").map(String::as_str),
            Some("abc")
        );
    }

    #[test]
    fn test_combine_headers_call_wins() {
        let mut base = BTreeMap::new();
        base.insert("Authorization".to_string(), "Bearer one".to_string());
        base.insert("X-A".to_string(), "1".to_string());
        let mut extra = BTreeMap::new();
        extra.insert("Authorization".to_string(), "Bearer two".to_string());

        let merged = combine_headers(&base, &extra);
        assert_eq!(
            merged.get("Authorization").map(String::as_str),
            Some("Bearer two")
        );
        assert_eq!(merged.get("X-A").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_artifact_ref_from_history_json() {
        let artifact: ArtifactRef = serde_json::from_str(
            r#"{"filename": "ComfyUI_00001_.png", "subfolder": "", "type": "output"}"#,
        )
        .unwrap();
        assert_eq!(artifact.filename, "ComfyUI_00001_.png");
        assert_eq!(artifact.kind, "output");
    }
}
