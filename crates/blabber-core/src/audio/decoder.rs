//! Incremental decoder for base64 audio embedded in a streamed JSON response.
//!
//! The synthesize endpoint answers with a JSON document whose audio payload is
//! one (very long) base64 string. The body arrives in arbitrary chunks, so the
//! decoder keeps just enough state to pick the payload bytes out of each chunk
//! and decodes them in whole 4-byte base64 groups, carrying the rest over.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Error, Result};

/// Which part of the response carries the audio.
///
/// Configured as `{ field = "audioContent" }` or `{ between_quotes = 3 }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractRule {
    /// Bytes strictly between the n-th and (n+1)-th `"` of the whole response
    BetweenQuotes(usize),
    /// String value of the named key
    Field(String),
}

impl Default for ExtractRule {
    fn default() -> Self {
        ExtractRule::Field("audioContent".to_string())
    }
}

/// Stateful decoder scoped to a single synthesis call
#[derive(Debug)]
pub struct FrameDecoder {
    extractor: Extractor,
    pending: Vec<u8>,
    decoded_total: usize,
}

impl FrameDecoder {
    pub fn new(rule: ExtractRule) -> Self {
        let extractor = match rule {
            ExtractRule::BetweenQuotes(target) => Extractor::Positional { target, quotes: 0 },
            ExtractRule::Field(name) => Extractor::Keyed(KeyedExtractor::new(name.into_bytes())),
        };
        Self {
            extractor,
            pending: Vec::new(),
            decoded_total: 0,
        }
    }

    /// Feed one raw chunk of the response, returning the audio decoded so far.
    ///
    /// The result may be empty when the chunk held no payload bytes or fewer
    /// than a full base64 group.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Bytes> {
        self.extractor.extract(chunk, &mut self.pending);

        let limit = (self.pending.len() / 4) * 4;
        if limit == 0 {
            return Ok(Bytes::new());
        }

        let decoded = STANDARD.decode(&self.pending[..limit])?;
        self.pending.drain(..limit);
        self.decoded_total += decoded.len();
        trace!(
            "Decoded {} audio bytes ({} base64 bytes carried over)",
            decoded.len(),
            self.pending.len()
        );
        Ok(Bytes::from(decoded))
    }

    /// Check that the response ended on a base64 group boundary
    pub fn finish(&self) -> Result<()> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(Error::Decode(format!(
                "response ended with {} undecoded base64 bytes",
                self.pending.len()
            )))
        }
    }

    /// Base64 bytes waiting for the rest of their group
    pub fn remainder_len(&self) -> usize {
        self.pending.len()
    }

    /// Audio bytes produced over the whole call
    pub fn decoded_total(&self) -> usize {
        self.decoded_total
    }
}

#[derive(Debug)]
enum Extractor {
    Positional { target: usize, quotes: usize },
    Keyed(KeyedExtractor),
}

impl Extractor {
    fn extract(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        match self {
            Extractor::Positional { target, quotes } => {
                for &byte in chunk {
                    if byte == b'"' {
                        *quotes += 1;
                    } else if *quotes == *target {
                        out.push(byte);
                    }
                }
            }
            Extractor::Keyed(keyed) => keyed.extract(chunk, out),
        }
    }
}

/// What the string currently being scanned may turn out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StringKind {
    /// Could be a key; its bytes are compared against the wanted field
    Candidate,
    /// Value of the wanted field; its bytes are emitted
    Payload,
}

/// Minimal streaming scanner that finds `"<field>": "<value>"` and emits the
/// value bytes. It does not validate JSON.
#[derive(Debug)]
struct KeyedExtractor {
    field: Vec<u8>,
    in_string: Option<StringKind>,
    escaped: bool,
    // Bytes of the current candidate string seen so far, capped at field length + 1
    candidate: Vec<u8>,
    key_matched: bool,
    expect_value: bool,
    done: bool,
}

impl KeyedExtractor {
    fn new(field: Vec<u8>) -> Self {
        Self {
            field,
            in_string: None,
            escaped: false,
            candidate: Vec::new(),
            key_matched: false,
            expect_value: false,
            done: false,
        }
    }

    fn extract(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        for &byte in chunk {
            if self.done {
                return;
            }
            match self.in_string {
                Some(kind) => self.string_byte(kind, byte, out),
                None => self.structural_byte(byte),
            }
        }
    }

    fn string_byte(&mut self, kind: StringKind, byte: u8, out: &mut Vec<u8>) {
        if self.escaped {
            self.escaped = false;
            self.push(kind, byte, out);
            return;
        }
        match byte {
            b'\\' => self.escaped = true,
            b'"' => {
                self.in_string = None;
                match kind {
                    StringKind::Payload => self.done = true,
                    StringKind::Candidate => {
                        self.key_matched = self.candidate == self.field;
                        self.candidate.clear();
                    }
                }
            }
            _ => self.push(kind, byte, out),
        }
    }

    fn push(&mut self, kind: StringKind, byte: u8, out: &mut Vec<u8>) {
        match kind {
            StringKind::Payload => out.push(byte),
            StringKind::Candidate => {
                if self.candidate.len() <= self.field.len() {
                    self.candidate.push(byte);
                }
            }
        }
    }

    fn structural_byte(&mut self, byte: u8) {
        match byte {
            b'"' => {
                self.in_string = Some(if self.expect_value {
                    StringKind::Payload
                } else {
                    StringKind::Candidate
                });
                self.expect_value = false;
                self.key_matched = false;
            }
            b':' => {
                self.expect_value = self.key_matched;
                self.key_matched = false;
            }
            b' ' | b'\t' | b'\r' | b'\n' => {}
            _ => {
                self.expect_value = false;
                self.key_matched = false;
            }
        }
    }
}
