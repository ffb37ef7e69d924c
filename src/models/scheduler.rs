//! Flow matching schedulers.
//!
//! Both schedulers update each latent token independently, so a rank can
//! step its own shard and get exactly the rows a single device would.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::latent::token_noise;

/// Scheduler type for the denoising loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerType {
    /// Euler ODE solver - fast, deterministic.
    #[default]
    Euler,
    /// PingPong SDE solver - re-noises every step.
    PingPong,
}

impl SchedulerType {
    /// Parses a scheduler type from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "euler" => Some(SchedulerType::Euler),
            "pingpong" | "ping_pong" | "ping-pong" => Some(SchedulerType::PingPong),
            _ => None,
        }
    }

    /// Returns the string name of this scheduler.
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerType::Euler => "euler",
            SchedulerType::PingPong => "pingpong",
        }
    }
}

/// Common scheduler trait for flow matching.
pub trait Scheduler {
    /// Returns the current timestep value (sigma * 1000).
    fn timestep(&self) -> f32;

    /// Returns the current sigma (noise level, 0.0 to ~1.0).
    fn sigma(&self) -> f32;

    /// Advances `latent` one step given the guided velocity.
    ///
    /// `row_offset` is the global index of the first row, used to key any
    /// per-token noise.
    fn step(&mut self, latent: &Array2<f32>, model_output: &Array2<f32>, row_offset: usize) -> Array2<f32>;

    /// Returns whether the scheduler has completed all steps.
    fn is_done(&self) -> bool;

    /// Returns the current step index.
    fn current_step(&self) -> usize;

    /// Returns the total number of steps.
    fn num_steps(&self) -> u32;

    /// Resets the scheduler to the initial state.
    fn reset(&mut self);

    /// Returns all sigmas for the schedule.
    fn sigmas(&self) -> &[f32];
}

/// Flow Matching Euler scheduler.
///
/// Uses shifted sigmas: `shift * sigma / (1 + (shift - 1) * sigma)`
#[derive(Debug, Clone)]
pub struct EulerScheduler {
    num_steps: u32,
    sigmas: Vec<f32>,
    timesteps: Vec<f32>,
    current_step: usize,
}

impl EulerScheduler {
    pub fn new(num_steps: u32, shift: f32) -> Self {
        let (sigmas, timesteps) = compute_flow_matching_schedule(num_steps, shift);
        Self {
            num_steps,
            sigmas,
            timesteps,
            current_step: 0,
        }
    }

    fn next_sigma(&self) -> f32 {
        self.sigmas
            .get(self.current_step + 1)
            .copied()
            .unwrap_or(0.0)
    }
}

impl Scheduler for EulerScheduler {
    fn timestep(&self) -> f32 {
        self.timesteps.get(self.current_step).copied().unwrap_or(0.0)
    }

    fn sigma(&self) -> f32 {
        self.sigmas.get(self.current_step).copied().unwrap_or(0.0)
    }

    fn step(&mut self, latent: &Array2<f32>, model_output: &Array2<f32>, _row_offset: usize) -> Array2<f32> {
        // Negative: sigma decreases.
        let dt = self.next_sigma() - self.sigma();
        let next = latent + &model_output.mapv(|v| v * dt);
        self.current_step += 1;
        next
    }

    fn is_done(&self) -> bool {
        self.current_step >= self.num_steps as usize
    }

    fn current_step(&self) -> usize {
        self.current_step
    }

    fn num_steps(&self) -> u32 {
        self.num_steps
    }

    fn reset(&mut self) {
        self.current_step = 0;
    }

    fn sigmas(&self) -> &[f32] {
        &self.sigmas
    }
}

/// Flow Matching PingPong scheduler.
///
/// Predicts the clean sample, then re-noises it to the next sigma with fresh
/// noise keyed by (seed, step, token).
#[derive(Debug, Clone)]
pub struct PingPongScheduler {
    num_steps: u32,
    sigmas: Vec<f32>,
    timesteps: Vec<f32>,
    current_step: usize,
    seed: u64,
}

impl PingPongScheduler {
    pub fn new(num_steps: u32, shift: f32, seed: u64) -> Self {
        let (sigmas, timesteps) = compute_flow_matching_schedule(num_steps, shift);
        Self {
            num_steps,
            sigmas,
            timesteps,
            current_step: 0,
            seed,
        }
    }

    fn next_sigma(&self) -> f32 {
        self.sigmas
            .get(self.current_step + 1)
            .copied()
            .unwrap_or(0.0)
    }
}

impl Scheduler for PingPongScheduler {
    fn timestep(&self) -> f32 {
        self.timesteps.get(self.current_step).copied().unwrap_or(0.0)
    }

    fn sigma(&self) -> f32 {
        self.sigmas.get(self.current_step).copied().unwrap_or(0.0)
    }

    fn step(&mut self, latent: &Array2<f32>, model_output: &Array2<f32>, row_offset: usize) -> Array2<f32> {
        let sigma = self.sigma();
        let sigma_next = self.next_sigma();
        let channels = latent.ncols();
        let noise_key = self.seed ^ ((self.current_step as u64 + 1).wrapping_mul(0x9e37_79b9_7f4a_7c15));

        // denoised = x - sigma * v; x' = (1 - sigma') * denoised + sigma' * noise
        let mut next = latent - &model_output.mapv(|v| v * sigma);
        for (i, mut row) in next.rows_mut().into_iter().enumerate() {
            let noise = token_noise(noise_key, row_offset + i, channels);
            for (x, n) in row.iter_mut().zip(noise) {
                *x = *x * (1.0 - sigma_next) + n * sigma_next;
            }
        }

        self.current_step += 1;
        next
    }

    fn is_done(&self) -> bool {
        self.current_step >= self.num_steps as usize
    }

    fn current_step(&self) -> usize {
        self.current_step
    }

    fn num_steps(&self) -> u32 {
        self.num_steps
    }

    fn reset(&mut self) {
        self.current_step = 0;
    }

    fn sigmas(&self) -> &[f32] {
        &self.sigmas
    }
}

/// Computes the flow matching sigma schedule with shifting.
///
/// Returns (sigmas, timesteps) where sigmas has num_steps + 1 elements (final is 0.0).
pub fn compute_flow_matching_schedule(num_steps: u32, shift: f32) -> (Vec<f32>, Vec<f32>) {
    let num_train_timesteps = 1000.0_f32;

    let mut sigmas: Vec<f32> = (0..num_steps)
        .map(|i| {
            let t = 1.0 - i as f32 / num_steps as f32;
            shift * t / (1.0 + (shift - 1.0) * t)
        })
        .collect();
    sigmas.push(0.0);

    let timesteps = sigmas
        .iter()
        .take(num_steps as usize)
        .map(|s| s * num_train_timesteps)
        .collect();

    (sigmas, timesteps)
}

/// Dynamic scheduler wrapper that can hold any scheduler type.
pub enum DynScheduler {
    Euler(EulerScheduler),
    PingPong(PingPongScheduler),
}

impl DynScheduler {
    pub fn timestep(&self) -> f32 {
        match self {
            DynScheduler::Euler(s) => s.timestep(),
            DynScheduler::PingPong(s) => s.timestep(),
        }
    }

    pub fn sigma(&self) -> f32 {
        match self {
            DynScheduler::Euler(s) => s.sigma(),
            DynScheduler::PingPong(s) => s.sigma(),
        }
    }

    pub fn step(&mut self, latent: &Array2<f32>, model_output: &Array2<f32>, row_offset: usize) -> Array2<f32> {
        match self {
            DynScheduler::Euler(s) => s.step(latent, model_output, row_offset),
            DynScheduler::PingPong(s) => s.step(latent, model_output, row_offset),
        }
    }

    pub fn is_done(&self) -> bool {
        match self {
            DynScheduler::Euler(s) => s.is_done(),
            DynScheduler::PingPong(s) => s.is_done(),
        }
    }

    pub fn current_step(&self) -> usize {
        match self {
            DynScheduler::Euler(s) => s.current_step(),
            DynScheduler::PingPong(s) => s.current_step(),
        }
    }

    pub fn num_steps(&self) -> u32 {
        match self {
            DynScheduler::Euler(s) => s.num_steps(),
            DynScheduler::PingPong(s) => s.num_steps(),
        }
    }

    pub fn reset(&mut self) {
        match self {
            DynScheduler::Euler(s) => s.reset(),
            DynScheduler::PingPong(s) => s.reset(),
        }
    }

    pub fn sigmas(&self) -> &[f32] {
        match self {
            DynScheduler::Euler(s) => s.sigmas(),
            DynScheduler::PingPong(s) => s.sigmas(),
        }
    }
}

/// Creates a scheduler of the specified type.
///
/// `seed` is only used by PingPong.
pub fn create_scheduler(scheduler_type: SchedulerType, num_steps: u32, shift: f32, seed: u64) -> DynScheduler {
    match scheduler_type {
        SchedulerType::Euler => DynScheduler::Euler(EulerScheduler::new(num_steps, shift)),
        SchedulerType::PingPong => DynScheduler::PingPong(PingPongScheduler::new(num_steps, shift, seed)),
    }
}
