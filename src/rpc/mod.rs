//! JSON-RPC job server for `--serve` mode.
//!
//! Methods:
//! - `generate`: Queue a dialogue video
//! - `status`: Queue length and process group layout
//! - `ping`: Health check
//! - `shutdown`: Finish queued jobs and exit
//!
//! Notifications:
//! - `generation_progress`: Denoising progress
//! - `generation_complete`: Video written
//! - `generation_error`: Job failed, with error code and stage

pub mod methods;
pub mod server;
pub mod types;

pub use server::{run_server, send_notification, ServerState};
pub use types::{
    GenerateParams, GenerateResult, GenerationCompleteParams, GenerationErrorParams,
    GenerationProgressParams, JsonRpcError, JsonRpcErrorResponse,
    JsonRpcNotification, JsonRpcRequest, Priority, RequestId, StatusResult,
};
