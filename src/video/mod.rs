//! Video output: latent decoding and muxing.

mod assembler;
mod decoder;

pub use assembler::{frame_size, AudioTrack, FfmpegAssembler, VideoAssembler};
pub use decoder::FrameDecoder;
