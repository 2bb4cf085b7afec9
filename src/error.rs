//! Error taxonomy for detection requests.
//!
//! Every failure a caller can observe maps to exactly one variant. Adapters
//! (models, video containers) report `anyhow` errors; the orchestration layer
//! folds them into these kinds at the boundary so the transport can map each
//! one to a distinct status.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectError {
    /// The detector instance never finished construction (missing weights,
    /// backend not compiled in, ...).
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// Filename extension outside the allow-list. Raised before any I/O.
    #[error("unsupported format '{extension}'; supported: {supported}")]
    UnsupportedFormat {
        extension: String,
        supported: String,
    },

    /// Payload does not decode into valid pixel data.
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("video source unreadable: {0}")]
    SourceUnreadable(String),

    #[error("video sink unwritable: {0}")]
    SinkUnwritable(String),

    /// The model adapter failed on a structurally valid frame. Not retried.
    #[error("inference failed: {0}")]
    InferenceFailure(String),

    /// Scratch file housekeeping failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl DetectError {
    /// Stable machine-readable kind, used in logs and API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            DetectError::ModelUnavailable(_) => "model_unavailable",
            DetectError::UnsupportedFormat { .. } => "unsupported_format",
            DetectError::BadInput(_) => "bad_input",
            DetectError::SourceUnreadable(_) => "source_unreadable",
            DetectError::SinkUnwritable(_) => "sink_unwritable",
            DetectError::InferenceFailure(_) => "inference_failure",
            DetectError::Io(_) => "io",
        }
    }

    pub(crate) fn inference(err: anyhow::Error) -> Self {
        DetectError::InferenceFailure(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, DetectError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_are_distinct_and_readable() {
        let unavailable = DetectError::ModelUnavailable("weights missing".into());
        let bad = DetectError::BadInput("empty buffer".into());
        assert_eq!(unavailable.kind(), "model_unavailable");
        assert_eq!(bad.kind(), "bad_input");
        assert!(unavailable.to_string().contains("weights missing"));
        assert_ne!(unavailable.to_string(), bad.to_string());
    }

    #[test]
    fn inference_keeps_context_chain() {
        let err = anyhow::anyhow!("tensor shape mismatch").context("running model");
        let mapped = DetectError::inference(err);
        let text = mapped.to_string();
        assert!(text.contains("running model"));
        assert!(text.contains("tensor shape mismatch"));
    }
}
