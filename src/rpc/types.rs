//! JSON-RPC types for the job server protocol.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::TalkError;
use crate::types::{GenerationParams, JobPriority, JobStatus};

/// JSON-RPC version constant.
pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC request ID.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Integer(id)
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId::String(id)
    }
}

/// A JSON-RPC request wrapper.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub id: RequestId,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// A JSON-RPC error response.
#[derive(Debug, Serialize)]
pub struct JsonRpcErrorResponse {
    pub jsonrpc: &'static str,
    pub id: Option<RequestId>,
    pub error: JsonRpcError,
}

impl JsonRpcErrorResponse {
    pub fn new(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            error,
        }
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonRpcErrorData>,
}

/// Extended error data for application-specific errors.
#[derive(Debug, Serialize)]
pub struct JsonRpcErrorData {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl JsonRpcError {
    /// Creates a parse error (-32700).
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self {
            code: -32700,
            message: message.into(),
            data: None,
        }
    }

    /// Creates an invalid request error (-32600).
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
            data: None,
        }
    }

    /// Creates a method not found error (-32601).
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {}", method),
            data: None,
        }
    }

    /// Creates an invalid params error (-32602).
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
            data: None,
        }
    }

    /// Creates a queue full error (-32004).
    pub fn queue_full(current_size: usize) -> Self {
        Self {
            code: -32004,
            message: "Queue full".to_string(),
            data: Some(JsonRpcErrorData {
                error_code: "QUEUE_FULL".to_string(),
                details: Some(format!("Current queue: {}", current_size)),
            }),
        }
    }

    /// Creates a rejected job error (-32005) carrying the pipeline error code.
    pub fn rejected(error: &TalkError) -> Self {
        Self {
            code: -32005,
            message: error.code.description().to_string(),
            data: Some(JsonRpcErrorData {
                error_code: error.code.as_str().to_string(),
                details: Some(error.message.clone()),
            }),
        }
    }
}

/// Parameters for a generate request.
#[derive(Debug, Deserialize)]
pub struct GenerateParams {
    /// Dialogue script.
    pub script: String,
    /// Left portrait.
    pub portrait1: PathBuf,
    /// Right portrait.
    pub portrait2: PathBuf,
    /// Voice key for speaker 1.
    pub voice1: String,
    /// Voice key for speaker 2.
    pub voice2: String,
    /// Scene description.
    #[serde(default)]
    pub prompt: String,
    /// Numeric parameters; missing fields fall back to the server defaults.
    #[serde(default)]
    pub params: Option<GenerationParams>,
    /// Output video path; defaults to `<output_dir>/<run_id>.mp4`.
    #[serde(default)]
    pub output: Option<PathBuf>,
    /// Queue priority.
    #[serde(default)]
    pub priority: Priority,
}

/// Priority level for generation requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

impl From<Priority> for JobPriority {
    fn from(priority: Priority) -> Self {
        match priority {
            Priority::High => JobPriority::High,
            Priority::Normal => JobPriority::Normal,
        }
    }
}

/// Response for a generate request.
#[derive(Debug, Serialize)]
pub struct GenerateResult {
    pub job_id: String,
    pub run_id: String,
    pub status: JobStatus,
    /// Queue position (0 = next to generate).
    pub position: usize,
    /// Where the video will be written.
    pub output: String,
}

/// Response for a status request.
#[derive(Debug, Serialize)]
pub struct StatusResult {
    /// Jobs waiting in the queue.
    pub queued: usize,
    /// Ranks in the process group.
    pub world_size: usize,
    pub ulysses_size: usize,
    pub ring_size: usize,
}

/// A JSON-RPC notification (no id field).
#[derive(Debug, Serialize)]
pub struct JsonRpcNotification<T: Serialize> {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    pub params: T,
}

impl<T: Serialize> JsonRpcNotification<T> {
    pub fn new(method: &'static str, params: T) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

/// Progress notification sent as denoising steps complete.
#[derive(Debug, Serialize)]
pub struct GenerationProgressParams {
    pub job_id: String,
    /// Progress percentage (capped at 99 until complete).
    pub percent: u8,
    pub steps_completed: u32,
    pub steps_total: u32,
    /// Estimated seconds remaining in the denoising loop.
    pub eta_sec: f32,
}

/// Notification sent when a video has been written.
#[derive(Debug, Serialize)]
pub struct GenerationCompleteParams {
    pub job_id: String,
    pub run_id: String,
    /// Path of the finished video.
    pub path: String,
    pub duration_sec: f32,
    pub generation_time_sec: f32,
}

/// Notification sent when a job fails.
#[derive(Debug, Serialize)]
pub struct GenerationErrorParams {
    pub job_id: String,
    pub run_id: String,
    pub code: String,
    pub message: String,
    /// Pipeline stage that failed, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn request_id_variants() {
        let id: RequestId = serde_json::from_str("7").unwrap();
        assert_eq!(id, RequestId::Integer(7));
        let id: RequestId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(id, RequestId::String("abc".to_string()));
    }

    #[test]
    fn generate_params_defaults() {
        let params: GenerateParams = serde_json::from_str(
            r#"{"script":"(s1) hi (s2) yo","portrait1":"a.png","portrait2":"b.png",
                "voice1":"alice","voice2":"bob"}"#,
        )
        .unwrap();
        assert!(params.params.is_none());
        assert!(params.output.is_none());
        assert_eq!(params.priority, Priority::Normal);
        assert_eq!(JobPriority::from(Priority::High), JobPriority::High);
    }

    #[test]
    fn rejected_carries_code() {
        let err = TalkError::new(ErrorCode::SpeakerCount, "found 3 speakers");
        let rpc = JsonRpcError::rejected(&err);
        let json = serde_json::to_string(&rpc).unwrap();
        assert!(json.contains("-32005"));
        assert!(json.contains("SPEAKER_COUNT"));
        assert!(json.contains("found 3 speakers"));
    }

    #[test]
    fn notification_has_no_id() {
        let n = JsonRpcNotification::new(
            "generation_error",
            GenerationErrorParams {
                job_id: "j".to_string(),
                run_id: "r".to_string(),
                code: "ENCODE".to_string(),
                message: "ffmpeg exited".to_string(),
                stage: None,
            },
        );
        let json = serde_json::to_string(&n).unwrap();
        assert!(!json.contains("\"id\""));
        assert!(!json.contains("stage"));
    }
}
