use thiserror::Error;

/// Stage at which a generation call observed the cancellation signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortStage {
    BeforeSubmission,
    DuringPolling,
    BeforeDownload,
}

impl std::fmt::Display for AbortStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stage = match self {
            AbortStage::BeforeSubmission => "before workflow submission",
            AbortStage::DuringPolling => "during polling",
            AbortStage::BeforeDownload => "before image download",
        };
        f.write_str(stage)
    }
}

/// Errors returned by image generation calls.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The requested model is not present on the backend.
    #[error("Model \"{model_id}\" not found on the backend")]
    ModelNotFound { model_id: String },

    /// The backend returned a non-success HTTP status.
    #[error("Backend returned HTTP {status} {status_text}: {body}")]
    Api {
        status: u16,
        status_text: String,
        body: String,
    },

    /// Polling exhausted its attempt budget without the job producing output.
    #[error("Generation timed out after {attempts} attempts (~{elapsed_secs:.1}s)")]
    Timeout { attempts: u32, elapsed_secs: f64 },

    /// The caller's cancellation signal was observed.
    #[error("Generation aborted {stage}")]
    Aborted { stage: AbortStage },

    /// Transport-level failure, or a failed artifact download.
    #[error("Network error: {context}")]
    Network {
        context: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// A successful status code carried a body that failed schema expectations.
    #[error("{0}")]
    InvalidResponse(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProviderError {
    /// Construct an `Aborted` error for the given stage.
    pub fn aborted(stage: AbortStage) -> Self {
        ProviderError::Aborted { stage }
    }

    /// Construct a `Network` error from a transport failure.
    pub fn network(context: impl Into<String>, source: reqwest::Error) -> Self {
        ProviderError::Network {
            context: context.into(),
            source: Some(source),
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ProviderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_stage_display() {
        assert_eq!(
            AbortStage::BeforeSubmission.to_string(),
            "before workflow submission"
        );
        assert_eq!(AbortStage::DuringPolling.to_string(), "during polling");
        assert_eq!(
            AbortStage::BeforeDownload.to_string(),
            "before image download"
        );
    }

    #[test]
    fn test_timeout_message() {
        let err = ProviderError::Timeout {
            attempts: 60,
            elapsed_secs: 30.015482,
        };
        let msg = err.to_string();
        assert!(msg.contains("60 attempts"));
        // Elapsed time is rounded to one decimal place.
        assert!(msg.contains("~30.0s"), "unexpected message: {}", msg);
    }

    #[test]
    fn test_aborted_distinct_from_timeout() {
        let aborted = ProviderError::aborted(AbortStage::DuringPolling);
        assert!(matches!(aborted, ProviderError::Aborted { .. }));
        assert!(!matches!(aborted, ProviderError::Timeout { .. }));
    }

    #[test]
    fn test_model_not_found_names_model() {
        let err = ProviderError::ModelNotFound {
            model_id: "sdxl-base".to_string(),
        };
        assert!(err.to_string().contains("sdxl-base"));
    }
}
