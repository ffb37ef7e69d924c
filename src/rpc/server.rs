//! JSON-RPC server over stdin/stdout.
//!
//! Requests are answered in order on stdout. Jobs run on the queue processor
//! thread, which writes progress and result notifications to the same stream.

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::generation::{run_job, Pipeline, QueueProcessor};
use crate::types::GenerationJob;

use super::methods::{handle_request, notify_result, progress_observer};
use super::types::{JsonRpcError, JsonRpcErrorResponse, JsonRpcNotification, JsonRpcRequest};

/// State shared across all request handlers.
pub struct ServerState {
    /// Background job runner.
    pub processor: QueueProcessor,
    /// Runtime configuration.
    pub config: RuntimeConfig,
    /// Flag to signal server shutdown.
    shutdown: Arc<AtomicBool>,
}

impl ServerState {
    /// Creates new server state around an existing processor.
    pub fn new(config: RuntimeConfig, processor: QueueProcessor) -> Self {
        Self {
            processor,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Creates server state whose processor runs every job through `pipeline`.
    pub fn with_pipeline(config: RuntimeConfig, mut pipeline: Pipeline) -> Self {
        let processor = QueueProcessor::new(move |job: GenerationJob| {
            pipeline.set_observer(progress_observer(job.job_id.clone()));
            notify_result(&run_job(&mut pipeline, job));
        });
        Self::new(config, processor)
    }

    /// Signals the server to shut down.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Returns true if shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Runs the JSON-RPC server, reading from stdin and writing to stdout.
///
/// Returns after `shutdown` or end of input, once the job in progress (and
/// any still queued) has finished.
pub fn run_server(mut state: ServerState) -> Result<()> {
    let stdin = io::stdin();
    let reader = stdin.lock();

    info!("JSON-RPC server started, waiting for requests");

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!("Error reading stdin: {}", e);
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        if let Some(response) = process_request(&line, &mut state) {
            write_line(&response);
        }

        if state.is_shutdown() {
            info!("Server shutdown requested");
            break;
        }
    }

    state.processor.shutdown();
    info!("JSON-RPC server stopped");
    Ok(())
}

/// Processes a single JSON-RPC request line.
fn process_request(line: &str, state: &mut ServerState) -> Option<String> {
    let request: JsonRpcRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            let error = JsonRpcErrorResponse::new(
                None,
                JsonRpcError::parse_error(format!("Invalid JSON: {}", e)),
            );
            return Some(serde_json::to_string(&error).unwrap_or_default());
        }
    };

    if request.jsonrpc != "2.0" {
        let error = JsonRpcErrorResponse::new(
            Some(request.id),
            JsonRpcError::invalid_request("Invalid JSON-RPC version (expected 2.0)"),
        );
        return Some(serde_json::to_string(&error).unwrap_or_default());
    }

    let result = handle_request(&request.method, request.params.clone(), state);

    match result {
        Ok(response) => Some(
            serde_json::to_string(&serde_json::json!({
                "jsonrpc": "2.0",
                "id": request.id,
                "result": response
            }))
            .unwrap_or_default(),
        ),
        Err(error) => Some(
            serde_json::to_string(&JsonRpcErrorResponse::new(Some(request.id), error))
                .unwrap_or_default(),
        ),
    }
}

fn write_line(json: &str) {
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", json).ok();
    stdout.flush().ok();
}

/// Sends a JSON-RPC notification to stdout.
pub fn send_notification<T: serde::Serialize>(method: &'static str, params: T) {
    let notification = JsonRpcNotification::new(method, params);
    if let Ok(json) = serde_json::to_string(&notification) {
        write_line(&json);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> ServerState {
        let processor = QueueProcessor::new(|_job: GenerationJob| {});
        ServerState::new(RuntimeConfig::new(), processor)
    }

    #[test]
    fn server_state_new() {
        let state = test_state();
        assert_eq!(state.processor.queue_len(), 0);
        assert!(!state.is_shutdown());
    }

    #[test]
    fn server_state_shutdown() {
        let state = test_state();
        state.shutdown();
        assert!(state.is_shutdown());
    }

    #[test]
    fn process_invalid_json() {
        let mut state = test_state();
        let response = process_request("not json", &mut state);
        assert!(response.is_some());
        let response = response.unwrap();
        assert!(response.contains("-32700")); // Parse error
    }

    #[test]
    fn process_invalid_version() {
        let mut state = test_state();
        let request = r#"{"jsonrpc":"1.0","method":"test","id":1}"#;
        let response = process_request(request, &mut state);
        assert!(response.is_some());
        let response = response.unwrap();
        assert!(response.contains("-32600")); // Invalid request
    }

    #[test]
    fn process_unknown_method() {
        let mut state = test_state();
        let request = r#"{"jsonrpc":"2.0","method":"unknown","id":1}"#;
        let response = process_request(request, &mut state);
        assert!(response.is_some());
        let response = response.unwrap();
        assert!(response.contains("-32601")); // Method not found
    }

    #[test]
    fn process_ping_echoes_id() {
        let mut state = test_state();
        let request = r#"{"jsonrpc":"2.0","method":"ping","id":"abc"}"#;
        let response = process_request(request, &mut state).unwrap();
        let value: serde_json::Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["id"], "abc");
        assert_eq!(value["result"]["status"], "ok");
    }
}
