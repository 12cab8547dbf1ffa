//! Media pipeline: audio transcoding, reply chunking, streaming STT and TTS.

pub mod capture;
pub mod chunker;
pub mod stt;
pub mod transcoder;
pub mod tts_stream;
