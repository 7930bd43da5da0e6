//! Remote speech synthesis: requests, the network seam and the worker pool

mod auth;
mod client;
mod pool;
mod request;

pub use auth::{GoogleTokenSource, StaticToken, TokenSource, CLOUD_PLATFORM_SCOPE};
pub use client::{encode_response, HttpSynthesizer, MockSynthesizer, Synthesizer};
pub use pool::{Job, JobReport, Submission, SynthesisPool};
pub use request::{AudioEncoding, SsmlGender, SynthesisRequest};
