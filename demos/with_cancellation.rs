//! Cancel an in-flight generation from another task.
//!
//! The cancellation token is observed before submission, before every poll
//! attempt, during the inter-poll wait, and before each download.
//!
//! ```sh
//! cargo run --example with_cancellation
//! ```

use std::time::Duration;

use sd_provider::{ComfyUiImageModel, ImageCall, ImageModel, ProviderError};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let model = ComfyUiImageModel::new("dreamshaper-8").with_base_url("http://127.0.0.1:8188");

    let token = CancellationToken::new();
    let canceller = token.clone();

    // Simulate a user hitting "stop" two seconds in.
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        println!("Requesting cancellation...");
        canceller.cancel();
    });

    let call = ImageCall::new("an intricate clockwork city, highly detailed")
        .count(1)
        .cancellation(token);

    match model.generate(call).await {
        Ok(response) => println!("Finished first: {} image(s)", response.images.len()),
        Err(ProviderError::Aborted { stage }) => println!("Aborted {}", stage),
        Err(e) => eprintln!("Generation failed: {}", e),
    }

    Ok(())
}
