//! Remote synthesis calls
//!
//! [`Synthesizer`] is the seam between the worker pool and the network: it
//! starts one call and hands back the streamed response body.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::blocking::Client;
use reqwest::header::HeaderValue;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;

use crate::config::{Credentials, PipelineConfig};
use crate::error::{Error, Result};
use crate::synthesis::auth::{GoogleTokenSource, StaticToken, TokenSource, CLOUD_PLATFORM_SCOPE};
use crate::synthesis::SynthesisRequest;

/// Longest error body kept from a failed call
const MAX_ERROR_BODY: usize = 512;

/// Issues synthesis calls and returns the raw, still-streaming response body
pub trait Synthesizer: Send + Sync {
    /// Start a synthesis call for `request`
    fn synthesize(&self, request: &SynthesisRequest) -> Result<Box<dyn Read + Send>>;

    /// Name used in logs
    fn name(&self) -> &str;
}

enum Auth {
    None,
    Key(String),
    Token(Arc<dyn TokenSource>),
}

/// Synthesizer backed by a streaming HTTP/JSON endpoint
pub struct HttpSynthesizer {
    client: Client,
    endpoint: String,
    auth: Auth,
}

impl HttpSynthesizer {
    /// Build the HTTP client and load the configured credentials.
    ///
    /// Must not be called from inside an async runtime, and the synthesizer
    /// must not be dropped inside one.
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let auth = match &config.credentials {
            Credentials::Anonymous => Auth::None,
            Credentials::ApiKey(key) => Auth::Key(key.clone()),
            Credentials::BearerToken(token) => {
                HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|e| Error::Credentials(format!("invalid access token: {}", e)))?;
                Auth::Token(Arc::new(StaticToken::new(token.clone())))
            }
            refreshing => Auth::Token(Arc::new(GoogleTokenSource::new(
                refreshing,
                &[CLOUD_PLATFORM_SCOPE],
            )?)),
        };

        let client = Client::builder().timeout(config.request_timeout()).build()?;

        debug!(
            "Created HTTP synthesizer for {} ({:?})",
            config.endpoint, config.credentials
        );
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            auth,
        })
    }

    /// Take bearer tokens from `source` instead of the configured credentials
    pub fn with_token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.auth = Auth::Token(source);
        self
    }
}

impl Synthesizer for HttpSynthesizer {
    fn synthesize(&self, request: &SynthesisRequest) -> Result<Box<dyn Read + Send>> {
        let mut call = self.client.post(&self.endpoint).json(request);
        match &self.auth {
            Auth::None => {}
            Auth::Key(key) => call = call.query(&[("key", key.as_str())]),
            // Fetched per call so refreshed tokens take effect
            Auth::Token(source) => call = call.bearer_auth(source.token()?),
        }

        let response = call.send()?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(Error::Synthesis {
                status: status.as_u16(),
                message: message.chars().take(MAX_ERROR_BODY).collect(),
            });
        }

        Ok(Box::new(response))
    }

    fn name(&self) -> &str {
        &self.endpoint
    }
}

/// JSON body in the shape the synthesize endpoint answers with
pub fn encode_response(audio: &[u8]) -> Vec<u8> {
    format!(
        "{{\n  \"audioContent\": \"{}\"\n}}\n",
        STANDARD.encode(audio)
    )
    .into_bytes()
}

#[derive(Debug, Clone)]
enum MockResponse {
    Body(Vec<Vec<u8>>),
    Failure(u16),
    Panic,
}

/// Scripted synthesizer for tests and offline runs.
///
/// Responses are keyed by request text; unknown text answers with a 404.
#[derive(Debug, Clone, Default)]
pub struct MockSynthesizer {
    responses: HashMap<String, MockResponse>,
    chunk_delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl MockSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `text` with the given raw body chunks
    pub fn with_body(mut self, text: impl Into<String>, chunks: Vec<Vec<u8>>) -> Self {
        self.responses.insert(text.into(), MockResponse::Body(chunks));
        self
    }

    /// Answer `text` with `audio` wrapped in a JSON envelope, streamed in
    /// pieces of `piece` bytes
    pub fn with_audio(self, text: impl Into<String>, audio: &[u8], piece: usize) -> Self {
        let chunks = encode_response(audio)
            .chunks(piece.max(1))
            .map(<[u8]>::to_vec)
            .collect();
        self.with_body(text, chunks)
    }

    /// Fail calls for `text` with an HTTP status
    pub fn with_failure(mut self, text: impl Into<String>, status: u16) -> Self {
        self.responses
            .insert(text.into(), MockResponse::Failure(status));
        self
    }

    /// Panic inside the call for `text`
    pub fn with_panic(mut self, text: impl Into<String>) -> Self {
        self.responses.insert(text.into(), MockResponse::Panic);
        self
    }

    /// Sleep before handing out each body chunk
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Number of calls made so far (shared between clones)
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Synthesizer for MockSynthesizer {
    fn synthesize(&self, request: &SynthesisRequest) -> Result<Box<dyn Read + Send>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.responses.get(request.text()) {
            Some(MockResponse::Body(chunks)) => Ok(Box::new(ChunkedBody {
                chunks: chunks.iter().cloned().collect(),
                delay: self.chunk_delay,
            })),
            Some(MockResponse::Failure(status)) => Err(Error::Synthesis {
                status: *status,
                message: "scripted failure".to_string(),
            }),
            Some(MockResponse::Panic) => panic!("scripted panic for {:?}", request.text()),
            None => Err(Error::Synthesis {
                status: 404,
                message: format!("no scripted response for {:?}", request.text()),
            }),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Body that hands out at most one scripted chunk per read
struct ChunkedBody {
    chunks: VecDeque<Vec<u8>>,
    delay: Duration,
}

impl Read for ChunkedBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(mut chunk) = self.chunks.pop_front() else {
            return Ok(0);
        };
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.chunks.push_front(chunk.split_off(n));
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_body(mut body: Box<dyn Read + Send>) -> Vec<u8> {
        let mut out = Vec::new();
        body.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_mock_streams_scripted_audio() {
        let mock = MockSynthesizer::new().with_audio("hi", b"ABC", 3);
        let body = read_body(mock.synthesize(&SynthesisRequest::new("hi")).unwrap());
        assert_eq!(body, encode_response(b"ABC"));
        assert_eq!(mock.calls(), 1);
    }

    #[test]
    fn test_mock_unknown_text_fails() {
        let mock = MockSynthesizer::new().with_failure("bad", 500);
        assert!(matches!(
            mock.synthesize(&SynthesisRequest::new("bad")),
            Err(Error::Synthesis { status: 500, .. })
        ));
        assert!(matches!(
            mock.synthesize(&SynthesisRequest::new("other")),
            Err(Error::Synthesis { status: 404, .. })
        ));
        assert_eq!(mock.calls(), 2);
    }

    #[test]
    fn test_chunked_body_respects_buffer_size() {
        let mut body = ChunkedBody {
            chunks: VecDeque::from(vec![b"abcdef".to_vec()]),
            delay: Duration::ZERO,
        };
        let mut buf = [0u8; 4];
        assert_eq!(body.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(body.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(body.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_http_synthesizer_builds_with_token() {
        let config = PipelineConfig {
            credentials: Credentials::BearerToken("token".to_string()),
            ..Default::default()
        };
        let synthesizer = HttpSynthesizer::new(&config).unwrap();
        assert!(synthesizer.name().starts_with("https://"));
    }

    #[test]
    fn test_http_synthesizer_rejects_unreadable_key_file() {
        let config = PipelineConfig {
            credentials: Credentials::ServiceAccountFile("/nonexistent/key.json".into()),
            ..Default::default()
        };
        assert!(matches!(
            HttpSynthesizer::new(&config),
            Err(Error::Credentials(_))
        ));
    }

    #[test]
    fn test_http_synthesizer_rejects_bad_token() {
        let config = PipelineConfig {
            credentials: Credentials::BearerToken("bad\ntoken".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            HttpSynthesizer::new(&config),
            Err(Error::Credentials(_))
        ));
    }
}
