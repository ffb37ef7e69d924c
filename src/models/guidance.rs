//! Classifier-free guidance with separate text and audio scales.

use ndarray::{Array2, Zip};

/// `uncond + text_scale * (text - uncond) + audio_scale * (audio - uncond)`.
///
/// Scales are unrestricted; 0 removes a term.
pub fn apply_guidance(
    uncond: &Array2<f32>,
    text: &Array2<f32>,
    audio: &Array2<f32>,
    text_scale: f32,
    audio_scale: f32,
) -> Array2<f32> {
    let mut out = uncond.clone();
    Zip::from(&mut out)
        .and(text)
        .and(audio)
        .for_each(|u, &t, &a| {
            let base = *u;
            *u = base + text_scale * (t - base) + audio_scale * (a - base);
        });
    out
}
