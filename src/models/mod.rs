//! Reference model components for the denoising loop.
//!
//! - [`TextEncoder`]: prompt to pooled embedding
//! - [`DiffusionTransformer`]: velocity prediction over latent tokens
//! - [`scheduler`]: flow-matching samplers
//! - [`latent`]: token geometry and seeded noise
//! - [`apply_guidance`]: text/audio classifier-free guidance

mod dit;
mod guidance;
pub mod latent;
mod params;
pub mod scheduler;
mod text_encoder;

pub use dit::{Branch, Conditioning, DiffusionTransformer, DIT_PARAM_NAMES};
pub use guidance::apply_guidance;
pub use latent::{initial_noise, token_noise, LatentGeometry};
pub use params::{init_matrix, linear, linear_into, ParamSet};
pub use scheduler::{create_scheduler, DynScheduler, Scheduler, SchedulerType};
pub use text_encoder::TextEncoder;
