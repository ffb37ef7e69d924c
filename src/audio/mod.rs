//! Audio collaborators: speech synthesis, embedding extraction and WAV I/O.

pub mod embedding;
pub mod tts;
pub mod wav;

pub use embedding::{AudioEmbeddingExtractor, SpectralEmbeddingExtractor, EMBEDDING_SAMPLE_RATE};
pub use tts::{CommandSynthesizer, ToneSynthesizer, TtsAdapter};
pub use wav::{read_wav, samples_to_duration, write_wav, write_wav_to_buffer, CHANNELS};
