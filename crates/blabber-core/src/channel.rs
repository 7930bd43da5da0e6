//! Single-reader, sequential-multi-writer byte channel.
//!
//! A [`Channel`] carries decoded audio from synthesis workers to the playback
//! side. Any number of [`ChannelWriter`]s may be attached over time, but only
//! one is *active*: later writers wait in attachment order and are activated
//! one by one as earlier writers close. The single [`ChannelReader`] only sees
//! end-of-stream once no writer is active and every queued byte was drained,
//! so back-to-back phrases play as one continuous stream.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Shared byte pipe between synthesis workers and a playback reader.
///
/// Cloning a `Channel` yields another handle to the same pipe.
#[derive(Clone, Default)]
pub struct Channel {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    signal: Condvar,
}

#[derive(Default)]
struct State {
    chunks: VecDeque<Bytes>,
    reader: Option<u64>,
    active: Option<u64>,
    waiting: VecDeque<QueuedWriter>,
    next_token: u64,
    abandoned: bool,
}

/// Wait-list entry for a writer that attached while another was active.
struct QueuedWriter {
    token: u64,
    open: Arc<AtomicBool>,
}

impl State {
    fn issue_token(&mut self) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        token
    }
}

impl Channel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the read end. Fails while another read end is still open.
    pub fn reader(&self) -> Result<ChannelReader> {
        let mut state = self.lock();
        if state.reader.is_some() {
            return Err(Error::AlreadyAttached);
        }
        let token = state.issue_token();
        state.reader = Some(token);
        drop(state);

        debug!("Attached channel reader {}", token);
        Ok(ChannelReader {
            channel: self.clone(),
            token,
            open: true,
            buffer: BytesMut::new(),
        })
    }

    /// Attach a write end.
    ///
    /// The writer becomes active at once when the channel has no active
    /// writer. Otherwise it joins the wait list and its writes block until
    /// every writer attached before it has closed.
    pub fn writer(&self) -> ChannelWriter {
        let open = Arc::new(AtomicBool::new(true));
        let mut state = self.lock();
        let token = state.issue_token();
        if state.active.is_none() {
            state.active = Some(token);
            debug!("Attached channel writer {} (active)", token);
        } else {
            state.waiting.push_back(QueuedWriter {
                token,
                open: open.clone(),
            });
            debug!(
                "Attached channel writer {} (queued behind {} writers)",
                token,
                state.waiting.len()
            );
        }
        drop(state);

        ChannelWriter {
            channel: self.clone(),
            token,
            open,
        }
    }

    pub fn has_reader(&self) -> bool {
        self.lock().reader.is_some()
    }

    pub fn has_writer(&self) -> bool {
        self.lock().active.is_some()
    }

    /// Number of open writers waiting for activation
    pub fn queued_writers(&self) -> usize {
        self.lock()
            .waiting
            .iter()
            .filter(|w| w.open.load(Ordering::SeqCst))
            .count()
    }

    /// Bytes written but not yet pulled by the reader
    pub fn queued_bytes(&self) -> usize {
        self.lock().chunks.iter().map(Bytes::len).sum()
    }

    /// Give up on the channel.
    ///
    /// Buffered bytes are discarded, blocked readers and writers wake up,
    /// readers see end-of-stream from now on and writes are silently dropped.
    pub fn abandon(&self) {
        let mut state = self.lock();
        if state.abandoned {
            return;
        }
        state.abandoned = true;
        let discarded: usize = state.chunks.drain(..).map(|c| c.len()).sum();
        drop(state);
        self.shared.signal.notify_all();
        debug!("Abandoned channel, discarded {} buffered bytes", discarded);
    }

    pub fn is_abandoned(&self) -> bool {
        self.lock().abandoned
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // State is never left half-updated, so a poisoned lock is still usable
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.shared
            .signal
            .wait(guard)
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, State>,
        timeout: Duration,
    ) -> MutexGuard<'a, State> {
        match self.shared.signal.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    fn detach_reader(&self, token: u64) {
        let mut state = self.lock();
        if state.reader == Some(token) {
            state.reader = None;
            debug!("Detached channel reader {}", token);
        }
    }

    fn detach_writer(&self, token: u64) {
        let mut state = self.lock();
        if state.active != Some(token) {
            // Still queued: the closed flag makes activation skip it
            return;
        }

        state.active = None;
        while let Some(next) = state.waiting.pop_front() {
            if next.open.load(Ordering::SeqCst) {
                state.active = Some(next.token);
                break;
            }
            trace!("Skipping closed queued writer {}", next.token);
        }

        match state.active {
            Some(next) => debug!("Writer {} detached, activated writer {}", token, next),
            None => debug!("Writer {} detached, channel has no writer", token),
        }
        drop(state);
        self.shared.signal.notify_all();
    }
}

/// Result of a bounded read from the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    /// Every byte available right now (never empty)
    Data(Bytes),
    /// No writer is active and the channel is drained
    Eof,
    /// The deadline passed while a writer was still active
    TimedOut,
}

/// Read end of a [`Channel`]. Closing (or dropping) it frees the reader slot.
pub struct ChannelReader {
    channel: Channel,
    token: u64,
    open: bool,
    buffer: BytesMut,
}

impl ChannelReader {
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Read exactly `size` bytes, or fewer only at end-of-stream.
    ///
    /// Blocks while a writer is active and not enough bytes have arrived.
    /// Returns an empty buffer when the channel is drained and writer-less.
    pub fn read(&mut self, size: usize) -> Result<Bytes> {
        self.ensure_open()?;
        if self.buffer.len() >= size {
            return Ok(self.buffer.split_to(size).freeze());
        }
        self.fill(Some(size))
    }

    /// Read until end-of-stream
    pub fn read_all(&mut self) -> Result<Bytes> {
        self.ensure_open()?;
        self.fill(None)
    }

    /// Return whatever is available, waiting at most `timeout` for data.
    ///
    /// `None` waits for as long as a writer is active.
    pub fn fetch(&mut self, timeout: Option<Duration>) -> Result<Fetched> {
        self.ensure_open()?;
        if !self.buffer.is_empty() {
            return Ok(Fetched::Data(self.buffer.split().freeze()));
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let channel = self.channel.clone();
        let mut state = channel.lock();
        loop {
            if state.abandoned {
                return Ok(Fetched::Eof);
            }
            if !state.chunks.is_empty() {
                while let Some(chunk) = state.chunks.pop_front() {
                    self.buffer.extend_from_slice(&chunk);
                }
                return Ok(Fetched::Data(self.buffer.split().freeze()));
            }
            if state.active.is_none() {
                return Ok(Fetched::Eof);
            }
            state = match deadline {
                None => channel.wait(state),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Fetched::TimedOut);
                    }
                    channel.wait_timeout(state, deadline - now)
                }
            };
        }
    }

    pub fn close(&mut self) {
        if self.open {
            self.open = false;
            self.buffer.clear();
            self.channel.detach_reader(self.token);
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::ClosedAccessor)
        }
    }

    fn fill(&mut self, size: Option<usize>) -> Result<Bytes> {
        let channel = self.channel.clone();
        let mut state = channel.lock();
        loop {
            if state.abandoned {
                self.buffer.clear();
                return Ok(Bytes::new());
            }
            while let Some(chunk) = state.chunks.pop_front() {
                self.buffer.extend_from_slice(&chunk);
            }
            if let Some(size) = size {
                if self.buffer.len() >= size {
                    return Ok(self.buffer.split_to(size).freeze());
                }
            }
            if state.active.is_none() {
                return Ok(self.buffer.split().freeze());
            }
            state = channel.wait(state);
        }
    }
}

impl Drop for ChannelReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Write end of a [`Channel`]. Closing (or dropping) it lets the next queued
/// writer take over.
pub struct ChannelWriter {
    channel: Channel,
    token: u64,
    open: Arc<AtomicBool>,
}

impl ChannelWriter {
    /// Attachment order of this writer on its channel
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.channel.lock().active == Some(self.token)
    }

    /// Append bytes to the channel, blocking until this writer is active.
    ///
    /// Writes to an abandoned channel are accepted and dropped.
    pub fn write(&mut self, data: impl Into<Bytes>) -> Result<usize> {
        if !self.is_open() {
            return Err(Error::ClosedAccessor);
        }
        let data = data.into();
        let len = data.len();

        let mut state = self.channel.lock();
        loop {
            if state.abandoned {
                trace!("Dropping {} bytes written to abandoned channel", len);
                return Ok(len);
            }
            if state.active == Some(self.token) {
                break;
            }
            state = self.channel.wait(state);
        }
        if !data.is_empty() {
            state.chunks.push_back(data);
        }
        drop(state);
        self.channel.shared.signal.notify_all();
        Ok(len)
    }

    pub fn close(&mut self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.channel.detach_writer(self.token);
        }
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        self.close();
    }
}
