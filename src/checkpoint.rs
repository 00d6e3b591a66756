//! Model-identifier to checkpoint-filename resolution.

/// File extensions recognized as already-resolved checkpoint filenames.
const MODEL_FILE_EXTENSIONS: [&str; 2] = [".safetensors", ".ckpt"];

/// Resolve a model identifier to the checkpoint filename the backend expects.
///
/// Identifiers that already carry a recognized model-file extension pass
/// through unchanged. Otherwise dashes become underscores and `.safetensors`
/// is appended (the common checkpoint naming convention).
///
/// # Example
/// ```
/// use sd_provider::checkpoint::resolve_checkpoint;
///
/// assert_eq!(resolve_checkpoint("sdxl-base"), "sdxl_base.safetensors");
/// assert_eq!(resolve_checkpoint("model.ckpt"), "model.ckpt");
/// ```
pub fn resolve_checkpoint(model_id: &str) -> String {
    if MODEL_FILE_EXTENSIONS
        .iter()
        .any(|ext| model_id.ends_with(ext))
    {
        return model_id.to_string();
    }
    format!("{}.safetensors", model_id.replace('-', "_"))
}

/// Default output dimensions for a checkpoint. XL-family models default to
/// 1024x1024, everything else to 512x512.
pub fn default_dimensions(checkpoint: &str) -> (u32, u32) {
    if checkpoint.to_lowercase().contains("xl") {
        (1024, 1024)
    } else {
        (512, 512)
    }
}
