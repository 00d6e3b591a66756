//! Generate images through the uniform interface against a local ComfyUI.
//!
//! Requires a running ComfyUI instance at http://127.0.0.1:8188
//! with at least one checkpoint installed.
//!
//! ```sh
//! cargo run --example simple_generation
//! ```

use sd_provider::{ComfyUiImageModel, ComfyUiSettings, ImageCall, ImageModel};

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let model = ComfyUiImageModel::new("dreamshaper-8")
        .with_base_url("http://127.0.0.1:8188")
        .with_defaults(ComfyUiSettings {
            negative_prompt: Some("lowres, blurry, bad anatomy".to_string()),
            steps: Some(25),
            cfg_scale: Some(7.5),
            check_model_exists: true,
            ..Default::default()
        });

    // List what the backend has installed
    let checkpoints = model.checkpoints().await?;
    if checkpoints.is_empty() {
        eprintln!("No checkpoints found — install a model first");
        return Ok(());
    }
    println!("Available checkpoints: {:?}", checkpoints);

    let response = model
        .generate(
            ImageCall::new("a beautiful sunset over mountains")
                .count(2)
                .size("512x768")
                .seed(12345),
        )
        .await?;

    println!("Generated {} image(s)", response.images.len());
    for warning in &response.warnings {
        println!("Warning: {:?}", warning);
    }
    for (i, image) in response.images.iter().enumerate() {
        let filename = format!("output_{i}.png");
        std::fs::write(&filename, image)?;
        println!("Saved: {} ({} bytes)", filename, image.len());
    }

    Ok(())
}
