// Inference runtime seam

use super::request::InferenceRequest;
use image::RgbImage;
use thiserror::Error;

/// Images produced by one runtime call and the seed actually used
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    pub images: Vec<RgbImage>,
    pub seed: u64,
}

/// Executes an assembled request (scheduling loop, UNet, VAE decode)
pub trait InferenceRuntime: Send + Sync {
    /// Name recorded in metadata and history
    fn model_name(&self) -> String;

    fn run(&self, request: InferenceRequest) -> Result<InferenceOutput, InferenceFailure>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ResourceExhausted,
    ModelMissing,
    EmptyPrompt,
    Other,
}

// Substring in the runtime message -> kind and user-facing text
const MESSAGE_TABLE: &[(&str, FailureKind, &str)] = &[
    (
        "out of memory",
        FailureKind::ResourceExhausted,
        "GPU memory is insufficient. Reduce the image size.",
    ),
    (
        "Pipeline not loaded",
        FailureKind::ModelMissing,
        "No model is loaded. Select a model first.",
    ),
    ("No prompt", FailureKind::EmptyPrompt, "Enter a prompt."),
];

/// Typed failure reported by an inference runtime
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Inference failed: {message}")]
pub struct InferenceFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl InferenceFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify a raw runtime message through the substring table
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = MESSAGE_TABLE
            .iter()
            .find(|(needle, _, _)| message.contains(needle))
            .map(|(_, kind, _)| *kind)
            .unwrap_or(FailureKind::Other);
        Self { kind, message }
    }

    pub fn empty_prompt() -> Self {
        Self::new(FailureKind::EmptyPrompt, "No prompt")
    }

    pub fn model_missing() -> Self {
        Self::new(FailureKind::ModelMissing, "Pipeline not loaded")
    }

    pub fn user_message(&self) -> String {
        MESSAGE_TABLE
            .iter()
            .find(|(_, kind, _)| *kind == self.kind)
            .map(|(_, _, text)| text.to_string())
            .unwrap_or_else(|| format!("Generation error: {}", self.message))
    }
}

impl From<crate::Error> for InferenceFailure {
    fn from(err: crate::Error) -> Self {
        match err {
            crate::Error::Inference(failure) => failure,
            other => InferenceFailure::from_message(other.to_string()),
        }
    }
}

impl From<candle_core::Error> for InferenceFailure {
    fn from(err: candle_core::Error) -> Self {
        InferenceFailure::from_message(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_table() {
        let oom = InferenceFailure::from_message("CUDA out of memory. Tried to allocate 2.00 GiB");
        assert_eq!(oom.kind, FailureKind::ResourceExhausted);
        assert_eq!(
            oom.user_message(),
            "GPU memory is insufficient. Reduce the image size."
        );

        let missing = InferenceFailure::from_message("Pipeline not loaded");
        assert_eq!(missing.kind, FailureKind::ModelMissing);
        assert_eq!(missing.user_message(), "No model is loaded. Select a model first.");

        assert_eq!(InferenceFailure::empty_prompt().user_message(), "Enter a prompt.");
    }

    #[test]
    fn test_unmatched_message_is_prefixed() {
        let failure = InferenceFailure::from_message("shape mismatch in unet");
        assert_eq!(failure.kind, FailureKind::Other);
        assert_eq!(failure.user_message(), "Generation error: shape mismatch in unet");
    }

    #[test]
    fn test_display() {
        let failure = InferenceFailure::from_message("CUDA out of memory");
        assert_eq!(failure.to_string(), "Inference failed: CUDA out of memory");
    }

    #[test]
    fn test_crate_error_round_trip() {
        let err: crate::Error = InferenceFailure::model_missing().into();
        assert_eq!(err.user_message(), "No model is loaded. Select a model first.");

        let failure: InferenceFailure = crate::Error::ModelLoading("weights gone".into()).into();
        assert_eq!(failure.kind, FailureKind::Other);
        assert!(failure.message.contains("weights gone"));
    }
}
