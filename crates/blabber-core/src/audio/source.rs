//! Pull-based audio source for a playback engine.
//!
//! The playback side calls [`AudioSource::read`] on its own cadence and gets
//! one packet back, or an empty buffer when nothing is ready. Speech enters
//! through [`AudioSource::submit`]; every submitted phrase lands on the same
//! channel, so consecutive phrases play back to back without re-subscribing.

use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::packetizer::{OggPacketizer, Packetizer};
use crate::channel::{Channel, ChannelReader, Fetched};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::synthesis::{Submission, SynthesisPool, SynthesisRequest};

/// Playback state of an [`AudioSource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// Nothing played since creation or the last `clear`
    Idle,
    /// Packets are flowing
    Streaming,
    /// The last read found no writer and no buffered audio
    Drained,
}

struct Playback {
    reader: ChannelReader,
    packetizer: Box<dyn Packetizer>,
    state: SourceState,
}

pub struct AudioSource {
    pool: Arc<SynthesisPool>,
    channel: Mutex<Channel>,
    playback: Mutex<Playback>,
    max_text_chars: usize,
    read_timeout: Option<Duration>,
}

impl AudioSource {
    /// Source producing Opus packets from the Ogg stream of each phrase
    pub fn new(pool: Arc<SynthesisPool>, config: &PipelineConfig) -> Result<Self> {
        Self::with_packetizer(pool, config, Box::new(OggPacketizer::new()))
    }

    pub fn with_packetizer(
        pool: Arc<SynthesisPool>,
        config: &PipelineConfig,
        packetizer: Box<dyn Packetizer>,
    ) -> Result<Self> {
        let channel = Channel::new();
        let reader = channel.reader()?;
        Ok(Self {
            pool,
            channel: Mutex::new(channel),
            playback: Mutex::new(Playback {
                reader,
                packetizer,
                state: SourceState::Idle,
            }),
            max_text_chars: config.max_text_chars,
            read_timeout: config.read_timeout(),
        })
    }

    /// Next packet of audio, or an empty buffer when none is available.
    ///
    /// An empty result at end-of-stream is not final: the packetizer starts
    /// over and later submissions play through the same source. With a read
    /// timeout configured, the whole call returns within it even while a
    /// phrase trickles in too slowly to complete a packet.
    pub fn read(&self) -> Bytes {
        let deadline = self.read_timeout.map(|timeout| Instant::now() + timeout);
        let mut guard = lock(&self.playback);
        let playback = &mut *guard;

        loop {
            if let Some(packet) = playback.packetizer.next_packet() {
                playback.state = SourceState::Streaming;
                return packet;
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Bytes::new();
                    }
                    Some(left)
                }
                None => None,
            };

            match playback.reader.fetch(remaining) {
                Ok(Fetched::Data(data)) => playback.packetizer.push(&data),
                Ok(Fetched::TimedOut) => return Bytes::new(),
                Ok(Fetched::Eof) => {
                    if let Some(packet) = playback.packetizer.flush() {
                        playback.state = SourceState::Streaming;
                        return packet;
                    }
                    let discarded = playback.packetizer.reset();
                    if discarded > 0 {
                        warn!("Stream ended mid-packet, dropped {} bytes", discarded);
                    }
                    if playback.state == SourceState::Streaming {
                        debug!("Audio source drained");
                    }
                    if playback.state != SourceState::Idle {
                        playback.state = SourceState::Drained;
                    }
                    return Bytes::new();
                }
                Err(e) => {
                    warn!("Audio source read failed: {}", e);
                    playback.packetizer.reset();
                    return Bytes::new();
                }
            }
        }
    }

    /// Queue a phrase behind everything already submitted
    pub fn submit(&self, request: SynthesisRequest) -> Result<Submission> {
        request.validate(self.max_text_chars)?;

        // Hold the slot so the writer cannot attach to a channel being replaced
        let channel = lock(&self.channel);
        let writer = channel.writer();
        let submission = self.pool.submit_job(request, writer)?;
        debug!(
            "Submitted job {} ({} writers queued)",
            submission.id(),
            channel.queued_writers()
        );
        Ok(submission)
    }

    /// Abandon in-flight speech.
    ///
    /// Buffered audio is discarded and the source switches to a fresh
    /// channel; calls still running for earlier phrases write into the void.
    pub fn clear(&self) -> Result<()> {
        let fresh = Channel::new();
        let reader = fresh.reader()?;

        let old = std::mem::replace(&mut *lock(&self.channel), fresh);
        // Wakes a read blocked on the old channel
        old.abandon();

        let mut playback = lock(&self.playback);
        playback.reader = reader;
        playback.packetizer.reset();
        playback.state = SourceState::Idle;
        info!("Cleared audio source");
        Ok(())
    }

    pub fn state(&self) -> SourceState {
        lock(&self.playback).state
    }

    /// Whether a synthesis job is currently writing to the source
    pub fn is_speaking(&self) -> bool {
        lock(&self.channel).has_writer()
    }

    /// The codec is fixed (Opus), so packets need no transcoding
    pub fn is_frame_format_fixed(&self) -> bool {
        true
    }
}

impl Drop for AudioSource {
    fn drop(&mut self) {
        lock(&self.channel).abandon();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::packetizer::tests::opus_stream;
    use crate::audio::RawPacketizer;
    use crate::error::Error;
    use crate::synthesis::MockSynthesizer;

    fn config() -> PipelineConfig {
        PipelineConfig {
            workers: 2,
            queue_poll_ms: 20,
            ..Default::default()
        }
    }

    fn raw_source(mock: MockSynthesizer, packet_size: usize) -> AudioSource {
        let pool = Arc::new(SynthesisPool::with_synthesizer(&config(), Arc::new(mock)).unwrap());
        AudioSource::with_packetizer(pool, &config(), Box::new(RawPacketizer::new(packet_size)))
            .unwrap()
    }

    fn read_until_empty(source: &AudioSource) -> Vec<u8> {
        let mut audio = Vec::new();
        loop {
            let packet = source.read();
            if packet.is_empty() {
                return audio;
            }
            audio.extend_from_slice(&packet);
        }
    }

    #[test]
    fn test_read_restarts_after_drain() {
        let mock = MockSynthesizer::new()
            .with_audio("one", b"first", 4)
            .with_audio("two", b"second", 4);
        let source = raw_source(mock, 2);
        assert_eq!(source.state(), SourceState::Idle);
        assert!(source.is_frame_format_fixed());

        source.submit(SynthesisRequest::new("one")).unwrap().wait_blocking().unwrap();
        assert_eq!(read_until_empty(&source), b"first");
        assert_eq!(source.state(), SourceState::Drained);

        source.submit(SynthesisRequest::new("two")).unwrap().wait_blocking().unwrap();
        assert_eq!(read_until_empty(&source), b"second");
    }

    #[test]
    fn test_submit_rejects_long_text() {
        let source = raw_source(MockSynthesizer::new(), 4);
        let result = source.submit(SynthesisRequest::new("x".repeat(601)));
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
        assert!(!source.is_speaking());
    }

    #[test]
    fn test_clear_discards_buffered_audio() {
        let mock = MockSynthesizer::new()
            .with_audio("stale", b"old audio", 4)
            .with_audio("fresh", b"new audio", 4);
        let source = raw_source(mock, 3);

        source.submit(SynthesisRequest::new("stale")).unwrap().wait_blocking().unwrap();
        assert_eq!(&source.read()[..], b"old");

        source.clear().unwrap();
        assert_eq!(source.state(), SourceState::Idle);

        source.submit(SynthesisRequest::new("fresh")).unwrap().wait_blocking().unwrap();
        assert_eq!(read_until_empty(&source), b"new audio");
    }

    #[test]
    fn test_ogg_packets_from_two_phrases() {
        let first = opus_stream(&[&b"p1"[..], &b"p2"[..]]);
        let second = opus_stream(&[&b"p3"[..]]);
        let mock = MockSynthesizer::new()
            .with_audio("first", &first, 16)
            .with_audio("second", &second, 16);
        let pool = Arc::new(SynthesisPool::with_synthesizer(&config(), Arc::new(mock)).unwrap());
        let source = AudioSource::new(pool, &config()).unwrap();

        let a = source.submit(SynthesisRequest::new("first")).unwrap();
        let b = source.submit(SynthesisRequest::new("second")).unwrap();

        let mut packets = Vec::new();
        while packets.len() < 3 {
            let packet = source.read();
            if !packet.is_empty() {
                packets.push(packet);
            }
        }
        assert_eq!(packets, vec![&b"p1"[..], &b"p2"[..], &b"p3"[..]]);
        assert!(a.wait_blocking().is_ok());
        assert!(b.wait_blocking().is_ok());
        assert_eq!(source.state(), SourceState::Streaming);
    }

    #[test]
    fn test_read_timeout_returns_empty_while_speaking() {
        let mock = MockSynthesizer::new()
            .with_audio("slow", b"slowly", 2)
            .with_chunk_delay(Duration::from_millis(30));
        let pool = Arc::new(SynthesisPool::with_synthesizer(&config(), Arc::new(mock)).unwrap());
        let cfg = PipelineConfig {
            read_timeout_ms: Some(5),
            ..config()
        };
        let source =
            AudioSource::with_packetizer(pool, &cfg, Box::new(RawPacketizer::new(64))).unwrap();

        let submission = source.submit(SynthesisRequest::new("slow")).unwrap();
        // Nothing is ready yet and the read must not wait for the whole phrase
        assert!(source.read().is_empty());
        assert_ne!(source.state(), SourceState::Drained);

        submission.wait_blocking().unwrap();
        assert_eq!(read_until_empty(&source), b"slowly");
    }

    #[test]
    fn test_read_timeout_bounds_trickling_phrase() {
        let audio: Vec<u8> = (0..400u32).map(|i| (i % 251) as u8).collect();
        // Every body chunk decodes to a little audio, never a whole packet
        let mock = MockSynthesizer::new()
            .with_audio("trickle", &audio, 4)
            .with_chunk_delay(Duration::from_millis(3));
        let pool = Arc::new(SynthesisPool::with_synthesizer(&config(), Arc::new(mock)).unwrap());
        let cfg = PipelineConfig {
            read_timeout_ms: Some(20),
            ..config()
        };
        let source =
            AudioSource::with_packetizer(pool, &cfg, Box::new(RawPacketizer::new(4096))).unwrap();

        let submission = source.submit(SynthesisRequest::new("trickle")).unwrap();
        std::thread::sleep(Duration::from_millis(40));

        let started = Instant::now();
        let packet = source.read();
        let took = started.elapsed();
        assert!(packet.is_empty());
        assert!(took < Duration::from_millis(150), "read took {:?}", took);
        assert_ne!(source.state(), SourceState::Drained);

        submission.wait_blocking().unwrap();
        assert_eq!(read_until_empty(&source), audio);
    }
}
