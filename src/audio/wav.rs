//! WAV reading and writing using the hound crate.

use std::io::Cursor;
use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::error::{ErrorCode, Result, TalkError};

/// Mono output.
pub const CHANNELS: u16 = 1;

fn mono_spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: CHANNELS,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    }
}

/// Writes mono f32 samples to a WAV file.
pub fn write_wav(samples: &[f32], path: &Path, sample_rate: u32) -> Result<()> {
    let mut writer = WavWriter::create(path, mono_spec(sample_rate)).map_err(|e| {
        TalkError::with_source(
            ErrorCode::Encode,
            format!("Failed to create WAV file {}", path.display()),
            e,
        )
    })?;
    for sample in samples {
        writer
            .write_sample(*sample)
            .map_err(|e| TalkError::with_source(ErrorCode::Encode, "Failed to write sample", e))?;
    }
    writer
        .finalize()
        .map_err(|e| TalkError::with_source(ErrorCode::Encode, "Failed to finalize WAV file", e))?;
    Ok(())
}

/// Writes mono f32 samples to an in-memory WAV buffer.
pub fn write_wav_to_buffer(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    {
        let mut writer = WavWriter::new(Cursor::new(&mut buffer), mono_spec(sample_rate))
            .map_err(|e| TalkError::with_source(ErrorCode::Encode, "Failed to create WAV writer", e))?;
        for sample in samples {
            writer
                .write_sample(*sample)
                .map_err(|e| TalkError::with_source(ErrorCode::Encode, "Failed to write sample", e))?;
        }
        writer
            .finalize()
            .map_err(|e| TalkError::with_source(ErrorCode::Encode, "Failed to finalize WAV buffer", e))?;
    }
    Ok(buffer)
}

/// Reads a WAV file as mono f32 in `[-1, 1]`, averaging channels.
///
/// Returns the samples and the file's sample rate.
pub fn read_wav(path: &Path) -> Result<(Vec<f32>, u32)> {
    let reader = WavReader::open(path).map_err(|e| {
        TalkError::with_source(
            ErrorCode::Synthesis,
            format!("Cannot read WAV file {}", path.display()),
            e,
        )
    })?;
    let spec = reader.spec();
    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| TalkError::with_source(ErrorCode::Synthesis, "Corrupt WAV samples", e))?,
        SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| TalkError::with_source(ErrorCode::Synthesis, "Corrupt WAV samples", e))?
        }
    };

    let channels = spec.channels.max(1) as usize;
    let mono = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };
    Ok((mono, spec.sample_rate))
}

/// Calculates the duration of audio in seconds from sample count.
pub fn samples_to_duration(sample_count: usize, sample_rate: u32) -> f32 {
    sample_count as f32 / sample_rate as f32
}
