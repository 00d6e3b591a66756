use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ImageCall, ImageResponse};

/// Uniform image-model interface satisfied by every backend adapter.
///
/// A call takes a prompt, image count, size string, optional hints, and a
/// cancellation signal; it returns ordered raw image bytes, warnings, and
/// response metadata.
#[async_trait]
pub trait ImageModel: Send + Sync {
    /// Provider name (e.g. "comfyui", "automatic1111").
    fn provider(&self) -> &str;

    /// Model identifier this instance was created with.
    fn model_id(&self) -> &str;

    /// Upper bound on images per generation call.
    fn max_images_per_call(&self) -> u32;

    /// Run one generation call to completion or well-defined failure.
    async fn generate(&self, call: ImageCall) -> Result<ImageResponse>;
}
