//! # sd-provider
//!
//! One uniform async image-model interface over two Stable Diffusion
//! backends:
//!
//! - **ComfyUI** — generation runs as a directed graph of typed nodes. The
//!   adapter builds a fixed txt2img workflow, submits it, polls job status
//!   on a bounded 500 ms cadence, and downloads the resulting artifacts
//!   concurrently. Cancellation is honored at every suspension point via a
//!   [`CancellationToken`](tokio_util::sync::CancellationToken).
//! - **Automatic1111** — a single REST call returning base64-encoded images,
//!   validated and decoded.
//!
//! Both adapters implement the [`ImageModel`] trait and return ordered raw
//! image bytes plus warnings and response metadata.
//!
//! ## Quick Start
//!
//! ```no_run
//! use sd_provider::{ComfyUiImageModel, ComfyUiSettings, ImageCall, ImageModel};
//!
//! # async fn example() -> sd_provider::Result<()> {
//! let model = ComfyUiImageModel::new("dreamshaper-8")
//!     .with_base_url("http://127.0.0.1:8188")
//!     .with_defaults(ComfyUiSettings {
//!         steps: Some(25),
//!         ..Default::default()
//!     });
//!
//! let response = model
//!     .generate(ImageCall::new("a sunset over mountains").count(2).size("512x768"))
//!     .await?;
//!
//! for (i, image) in response.images.iter().enumerate() {
//!     std::fs::write(format!("out_{i}.png"), image).unwrap();
//! }
//! # Ok(())
//! # }
//! ```

pub mod automatic1111;
pub mod checkpoint;
pub mod comfyui;
pub mod error;
pub mod job;
pub mod model;
pub mod types;
pub mod workflow;

pub use automatic1111::{Automatic1111ImageModel, Automatic1111Settings};
pub use checkpoint::resolve_checkpoint;
pub use comfyui::{ComfyUiImageModel, ComfyUiSettings};
pub use error::{AbortStage, ProviderError, Result};
pub use job::{JobOutcome, MAX_POLL_ATTEMPTS, POLL_INTERVAL};
pub use model::ImageModel;
pub use types::{
    parse_size, ArtifactRef, CallWarning, ImageCall, ImageResponse, ProviderOptions,
    ResponseMetadata,
};
pub use workflow::{GenerationRequest, NodeRef, WorkflowGraph, WorkflowNode, SAVE_NODE_ID};
