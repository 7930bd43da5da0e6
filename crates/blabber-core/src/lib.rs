//! Blabber Core - Streaming Text-to-Speech Pipeline
//!
//! This crate turns chat messages into a continuous stream of Opus packets
//! for a voice connection. Text goes out to a remote synthesis endpoint and
//! the base64-in-JSON response is decoded while it is still arriving.
//!
//! # Architecture
//!
//! - [`SynthesisPool`]: fixed set of worker threads performing the calls
//! - [`FrameDecoder`]: incremental extraction and base64 decoding of audio
//! - [`Channel`]: single-reader pipe that serializes successive phrases
//! - [`AudioSource`]: pull-based adapter handing packets to playback
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use blabber_core::{AudioSource, PipelineConfig, SynthesisPool, SynthesisRequest};
//!
//! let config = PipelineConfig::default();
//! let pool = Arc::new(SynthesisPool::new(&config)?);
//! let source = AudioSource::new(pool, &config)?;
//!
//! source.submit(SynthesisRequest::new("Hello, world!"))?;
//! let packet = source.read();
//! ```

pub mod audio;
pub mod channel;
pub mod config;
pub mod error;
pub mod synthesis;

pub use audio::{
    AudioSource, ExtractRule, FrameDecoder, OggPacketizer, Packetizer, RawPacketizer, SourceState,
};
pub use channel::{Channel, ChannelReader, ChannelWriter, Fetched};
pub use config::{Credentials, PipelineConfig, VoiceDefaults};
pub use error::{Error, Result};
pub use synthesis::{
    encode_response, GoogleTokenSource, HttpSynthesizer, JobReport, MockSynthesizer, SsmlGender,
    StaticToken, Submission, SynthesisPool, SynthesisRequest, Synthesizer, TokenSource,
};
