//! JSON-RPC method handlers.

use std::time::Instant;

use crate::dist::{StepEvent, StepObserver, StepPhase};
use crate::generation::JobResult;
use crate::types::{compute_run_id, DialogueInput, GenerationJob, JobStatus, VoiceProfile};

use super::server::{send_notification, ServerState};
use super::types::{
    GenerateParams, GenerateResult, GenerationCompleteParams, GenerationErrorParams,
    GenerationProgressParams, JsonRpcError, StatusResult,
};

/// Handles a JSON-RPC method call.
pub fn handle_request(
    method: &str,
    params: serde_json::Value,
    state: &mut ServerState,
) -> Result<serde_json::Value, JsonRpcError> {
    match method {
        "generate" => handle_generate(params, state),
        "status" => handle_status(state),
        "ping" => handle_ping(),
        "shutdown" => handle_shutdown(state),
        _ => Err(JsonRpcError::method_not_found(method)),
    }
}

/// Handles the ping method for health checks.
fn handle_ping() -> Result<serde_json::Value, JsonRpcError> {
    Ok(serde_json::json!({ "status": "ok" }))
}

/// Handles the shutdown method.
fn handle_shutdown(state: &mut ServerState) -> Result<serde_json::Value, JsonRpcError> {
    state.shutdown();
    Ok(serde_json::json!({ "status": "shutting_down" }))
}

fn handle_status(state: &mut ServerState) -> Result<serde_json::Value, JsonRpcError> {
    let parallel = &state.config.coordinator.parallel;
    to_value(StatusResult {
        queued: state.processor.queue_len(),
        world_size: state.config.launch.world_size,
        ulysses_size: parallel.ulysses_size,
        ring_size: parallel.ring_size,
    })
}

/// Handles the generate method.
///
/// Parameters are checked here so an out-of-range request is rejected before
/// it takes a queue slot. Speaker and voice checks run in the pipeline.
fn handle_generate(
    params: serde_json::Value,
    state: &mut ServerState,
) -> Result<serde_json::Value, JsonRpcError> {
    let params: GenerateParams = serde_json::from_value(params)
        .map_err(|e| JsonRpcError::invalid_params(format!("Invalid params: {}", e)))?;

    let sampling = params
        .params
        .clone()
        .unwrap_or_else(|| state.config.coordinator.sampling.clone());
    sampling.validate().map_err(|e| JsonRpcError::rejected(&e))?;

    if state.processor.is_full() {
        return Err(JsonRpcError::queue_full(state.processor.queue_len()));
    }

    let sample_rate = state.config.tts.sample_rate;
    let mut input = DialogueInput {
        script: params.script,
        portrait1: params.portrait1,
        portrait2: params.portrait2,
        voices: vec![
            VoiceProfile::new(1, params.voice1, sample_rate),
            VoiceProfile::new(2, params.voice2, sample_rate),
        ],
        prompt: params.prompt,
        params: sampling,
        output_path: Default::default(),
    };
    // The run id ignores the output path, so it can name the default file.
    let run_id = compute_run_id(&input);
    input.output_path = params
        .output
        .unwrap_or_else(|| state.config.effective_output_dir().join(format!("{}.mp4", run_id)));

    let job = GenerationJob::new(input, params.priority.into());
    let job_id = job.job_id.clone();
    let output = job.input.output_path.to_string_lossy().to_string();

    let position = state
        .processor
        .submit(job)
        .map_err(|e| JsonRpcError::queue_full(e.current_size))?;

    to_value(GenerateResult {
        job_id,
        run_id,
        status: JobStatus::Queued,
        position,
        output,
    })
}

fn to_value<T: serde::Serialize>(value: T) -> Result<serde_json::Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::invalid_request(e.to_string()))
}

/// Builds the observer that turns synchronized denoising steps into
/// `generation_progress` notifications, at most one per 5%.
pub fn progress_observer(job_id: String) -> StepObserver {
    let started = Instant::now();
    let mut last_percent = 0u8;
    Box::new(move |event: &StepEvent| {
        if event.phase != StepPhase::Synchronized || event.total == 0 {
            return;
        }
        let percent = ((event.step * 100 / event.total) as u8).min(99);
        let next_threshold = (last_percent / 5 + 1) * 5;
        if percent < next_threshold && event.step != event.total {
            return;
        }
        last_percent = (percent / 5) * 5;

        let elapsed = started.elapsed().as_secs_f32();
        let remaining = event.total.saturating_sub(event.step);
        let eta_sec = if event.step > 0 {
            remaining as f32 / event.step as f32 * elapsed
        } else {
            0.0
        };
        send_notification(
            "generation_progress",
            GenerationProgressParams {
                job_id: job_id.clone(),
                percent,
                steps_completed: event.step,
                steps_total: event.total,
                eta_sec,
            },
        );
    })
}

/// Emits the terminal notification for a finished job.
pub fn notify_result(result: &JobResult) {
    match result {
        JobResult::Complete {
            job_id,
            run_id,
            path,
            duration_sec,
            generation_time_sec,
        } => send_notification(
            "generation_complete",
            GenerationCompleteParams {
                job_id: job_id.clone(),
                run_id: run_id.clone(),
                path: path.clone(),
                duration_sec: *duration_sec,
                generation_time_sec: *generation_time_sec,
            },
        ),
        JobResult::Failed {
            job_id,
            run_id,
            error_code,
            error_message,
            stage,
        } => send_notification(
            "generation_error",
            GenerationErrorParams {
                job_id: job_id.clone(),
                run_id: run_id.clone(),
                code: error_code.clone(),
                message: error_message.clone(),
                stage: stage.clone(),
            },
        ),
    }
}
