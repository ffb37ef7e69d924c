//! Error types for duet-daemon.
//!
//! Every failure carries an [`ErrorCode`] so callers can tell group-level
//! failures (the process group is unusable) from request-level failures (only
//! the current generation request is lost).

use std::fmt;

use crate::generation::PipelineStage;

/// Error codes surfaced to callers of the pipeline and coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Process-group rendezvous did not complete.
    /// Trigger: peers missing at the rendezvous deadline, bad handshake.
    GroupInit,

    /// Parameters or sequence cannot be laid out over the group.
    /// Trigger: world_size != ulysses_size * ring_size, heads not divisible.
    Sharding,

    /// Rank 0 did not receive every latent shard in time.
    GatherTimeout,

    /// A barrier or exchange round did not complete in time.
    BarrierTimeout,

    /// The parsed script does not name exactly two speakers.
    SpeakerCount,

    /// No voice profile configured for a speaker in the script.
    MissingVoice,

    /// Frame count, resolution or step count outside the supported range.
    UnsupportedParameter,

    /// Text-to-speech failed for a turn.
    Synthesis,

    /// Audio embedding extraction failed or broke its shape contract.
    Embedding,

    /// A portrait could not be decoded or is empty.
    InvalidImage,

    /// A compute kernel failed during denoising.
    Inference,

    /// Writing the output video failed.
    Encode,
}

impl ErrorCode {
    /// Returns the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::GroupInit => "GROUP_INIT",
            ErrorCode::Sharding => "SHARDING",
            ErrorCode::GatherTimeout => "GATHER_TIMEOUT",
            ErrorCode::BarrierTimeout => "BARRIER_TIMEOUT",
            ErrorCode::SpeakerCount => "SPEAKER_COUNT",
            ErrorCode::MissingVoice => "MISSING_VOICE",
            ErrorCode::UnsupportedParameter => "UNSUPPORTED_PARAMETER",
            ErrorCode::Synthesis => "SYNTHESIS",
            ErrorCode::Embedding => "EMBEDDING",
            ErrorCode::InvalidImage => "INVALID_IMAGE",
            ErrorCode::Inference => "INFERENCE",
            ErrorCode::Encode => "ENCODE",
        }
    }

    /// Returns a human-readable description of the error.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::GroupInit => "Process group rendezvous failed",
            ErrorCode::Sharding => "Model or sequence cannot be sharded over the process group",
            ErrorCode::GatherTimeout => "Latent shards were not gathered on rank 0 in time",
            ErrorCode::BarrierTimeout => "A collective round did not complete in time",
            ErrorCode::SpeakerCount => "The dialogue script must contain exactly two speakers",
            ErrorCode::MissingVoice => "A speaker has no voice profile",
            ErrorCode::UnsupportedParameter => "A generation parameter is outside the supported range",
            ErrorCode::Synthesis => "Speech synthesis failed",
            ErrorCode::Embedding => "Audio embedding extraction failed",
            ErrorCode::InvalidImage => "A portrait image is invalid",
            ErrorCode::Inference => "Model inference failed during denoising",
            ErrorCode::Encode => "Video encoding failed",
        }
    }

    /// Returns a recovery hint suggesting how to resolve this error.
    pub fn recovery_hint(&self) -> &'static str {
        match self {
            ErrorCode::GroupInit => {
                "Check that every rank uses the same MASTER_ADDR/MASTER_PORT and WORLD_SIZE, \
                 then restart all ranks together"
            }
            ErrorCode::Sharding => {
                "Launch ulysses_size * ring_size ranks and pick a ulysses_size that divides \
                 the number of attention heads"
            }
            ErrorCode::GatherTimeout => {
                "Retry the request; if it keeps failing, check the slowest rank or raise \
                 the gather timeout"
            }
            ErrorCode::BarrierTimeout => {
                "Retry the request; if it keeps failing, check rank health or raise \
                 the collective timeout"
            }
            ErrorCode::SpeakerCount => {
                "Write the script with two speakers, e.g. '(s1) hello (s2) hi there'"
            }
            ErrorCode::MissingVoice => "Configure a voice for both speaker 1 and speaker 2",
            ErrorCode::UnsupportedParameter => {
                "Use a frame count of the form 4k+1 within the supported range and a \
                 resolution whose sides are multiples of 16"
            }
            ErrorCode::Synthesis => "Check the voice key and make sure every turn has text",
            ErrorCode::Embedding => "Check the synthesized audio and the embedding extractor",
            ErrorCode::InvalidImage => "Provide two decodable, non-empty PNG or JPEG portraits",
            ErrorCode::Inference => "Retry the request; check model configuration and memory",
            ErrorCode::Encode => {
                "Check that ffmpeg is installed and the output directory is writable"
            }
        }
    }

    /// Returns true for group-level failures that leave the process unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorCode::GroupInit | ErrorCode::Sharding)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for pipeline and coordinator operations.
#[derive(Debug)]
pub struct TalkError {
    /// The error code identifying the type of error.
    pub code: ErrorCode,
    /// Human-readable error message with context.
    pub message: String,
    /// Pipeline stage that failed, when known.
    pub stage: Option<PipelineStage>,
    /// Optional underlying cause of the error.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TalkError {
    /// Creates a new TalkError with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            stage: None,
            source: None,
        }
    }

    /// Creates a new TalkError with an underlying cause.
    pub fn with_source(
        code: ErrorCode,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            stage: None,
            source: Some(Box::new(source)),
        }
    }

    /// Tags the error with the pipeline stage it surfaced from.
    ///
    /// The innermost stage wins: an error already tagged keeps its stage.
    pub fn in_stage(mut self, stage: PipelineStage) -> Self {
        if self.stage.is_none() {
            self.stage = Some(stage);
        }
        self
    }

    /// Returns true if the process group can no longer be used.
    pub fn is_fatal(&self) -> bool {
        self.code.is_fatal()
    }

    /// Creates a GROUP_INIT error.
    pub fn group_init(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::GroupInit,
            format!("Process group initialization failed: {}", reason.into()),
        )
    }

    /// Creates a SHARDING error.
    pub fn sharding(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::Sharding,
            format!("Sharding failed: {}", reason.into()),
        )
    }

    /// Creates a GATHER_TIMEOUT error.
    pub fn gather_timeout(missing: &[usize], timeout_ms: u128) -> Self {
        Self::new(
            ErrorCode::GatherTimeout,
            format!(
                "Gather timed out after {}ms waiting for ranks {:?}",
                timeout_ms, missing
            ),
        )
    }

    /// Creates a BARRIER_TIMEOUT error.
    pub fn barrier_timeout(operation: &str, missing: &[usize], timeout_ms: u128) -> Self {
        Self::new(
            ErrorCode::BarrierTimeout,
            format!(
                "{} timed out after {}ms waiting for ranks {:?}",
                operation, timeout_ms, missing
            ),
        )
    }

    /// Creates a SPEAKER_COUNT error.
    pub fn speaker_count(found: usize) -> Self {
        Self::new(
            ErrorCode::SpeakerCount,
            format!("Script names {} distinct speakers (expected 2)", found),
        )
    }

    /// Creates a MISSING_VOICE error.
    pub fn missing_voice(speaker: u8) -> Self {
        Self::new(
            ErrorCode::MissingVoice,
            format!("No voice profile for speaker {}", speaker),
        )
    }

    /// Creates an UNSUPPORTED_PARAMETER error.
    pub fn unsupported_parameter(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::UnsupportedParameter,
            format!("Unsupported parameter: {}", reason.into()),
        )
    }

    /// Creates a SYNTHESIS error.
    pub fn synthesis(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::Synthesis,
            format!("Synthesis failed: {}", reason.into()),
        )
    }

    /// Creates an EMBEDDING error.
    pub fn embedding(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::Embedding,
            format!("Embedding failed: {}", reason.into()),
        )
    }

    /// Creates an INVALID_IMAGE error.
    pub fn invalid_image(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InvalidImage,
            format!("Invalid image: {}", reason.into()),
        )
    }

    /// Creates an INFERENCE error.
    pub fn inference(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::Inference,
            format!("Inference failed: {}", reason.into()),
        )
    }

    /// Creates an ENCODE error.
    pub fn encode(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::Encode,
            format!("Encoding failed: {}", reason.into()),
        )
    }
}

impl fmt::Display for TalkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage {
            Some(stage) => write!(
                f,
                "[{}] {} stage: {}. Recovery: {}",
                self.code,
                stage.label(),
                self.message,
                self.code.recovery_hint()
            ),
            None => write!(
                f,
                "[{}] {}. Recovery: {}",
                self.code,
                self.message,
                self.code.recovery_hint()
            ),
        }
    }
}

impl std::error::Error for TalkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Result type alias using TalkError.
pub type Result<T> = std::result::Result<T, TalkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_as_str() {
        assert_eq!(ErrorCode::GroupInit.as_str(), "GROUP_INIT");
        assert_eq!(ErrorCode::Sharding.as_str(), "SHARDING");
        assert_eq!(ErrorCode::GatherTimeout.as_str(), "GATHER_TIMEOUT");
        assert_eq!(ErrorCode::SpeakerCount.as_str(), "SPEAKER_COUNT");
        assert_eq!(ErrorCode::UnsupportedParameter.as_str(), "UNSUPPORTED_PARAMETER");
        assert_eq!(ErrorCode::InvalidImage.as_str(), "INVALID_IMAGE");
    }

    #[test]
    fn only_group_level_codes_are_fatal() {
        assert!(ErrorCode::GroupInit.is_fatal());
        assert!(ErrorCode::Sharding.is_fatal());
        for code in [
            ErrorCode::GatherTimeout,
            ErrorCode::BarrierTimeout,
            ErrorCode::SpeakerCount,
            ErrorCode::MissingVoice,
            ErrorCode::UnsupportedParameter,
            ErrorCode::Synthesis,
            ErrorCode::Embedding,
            ErrorCode::InvalidImage,
            ErrorCode::Inference,
            ErrorCode::Encode,
        ] {
            assert!(!code.is_fatal(), "{} should be request-level", code);
        }
    }

    #[test]
    fn recovery_hints_not_empty() {
        assert!(!ErrorCode::GroupInit.recovery_hint().is_empty());
        assert!(!ErrorCode::GatherTimeout.recovery_hint().is_empty());
        assert!(!ErrorCode::Encode.recovery_hint().is_empty());
    }

    #[test]
    fn stage_tag_keeps_innermost() {
        let err = TalkError::synthesis("unknown voice")
            .in_stage(PipelineStage::Synthesize)
            .in_stage(PipelineStage::Inference);
        assert_eq!(err.stage, Some(PipelineStage::Synthesize));
        assert_eq!(err.code, ErrorCode::Synthesis);
        assert!(err.to_string().contains("synthesize stage"));
    }

    #[test]
    fn talk_error_display() {
        let err = TalkError::speaker_count(1);
        assert!(err.to_string().contains("SPEAKER_COUNT"));
        assert!(err.to_string().contains("Recovery:"));
    }
}
