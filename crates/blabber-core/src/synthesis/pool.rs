//! Synthesis worker pool.
//!
//! A fixed set of long-lived threads drains a FIFO job queue. Each job pairs
//! a [`SynthesisRequest`] with the [`ChannelWriter`] its audio goes to; the
//! worker performs the network call, streams the body through a
//! [`FrameDecoder`] and always closes the writer afterwards so the channel
//! can move on to the next queued writer.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::future::Future;
use std::io::{ErrorKind, Read};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audio::{ExtractRule, FrameDecoder};
use crate::channel::ChannelWriter;
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::synthesis::client::{HttpSynthesizer, Synthesizer};
use crate::synthesis::SynthesisRequest;

/// One queued unit of work
pub struct Job {
    pub id: Uuid,
    pub request: SynthesisRequest,
    pub sink: ChannelWriter,
    completion: oneshot::Sender<Result<JobReport>>,
}

/// Summary of a finished job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub id: Uuid,
    /// Decoded audio bytes written to the channel
    pub bytes_written: usize,
    /// Response body chunks read
    pub chunks: usize,
    pub elapsed: Duration,
}

impl JobReport {
    /// The call succeeded but carried no audio
    pub fn is_silent(&self) -> bool {
        self.bytes_written == 0
    }
}

/// Handle to a submitted job. Awaiting it yields the job's outcome.
///
/// Dropping it does not cancel the job.
#[derive(Debug)]
pub struct Submission {
    id: Uuid,
    outcome: oneshot::Receiver<Result<JobReport>>,
}

impl Submission {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Block the current thread until the job finishes.
    ///
    /// # Panics
    /// Panics when called from within an async runtime.
    pub fn wait_blocking(self) -> Result<JobReport> {
        self.outcome
            .blocking_recv()
            .unwrap_or(Err(Error::PoolShutdown))
    }
}

impl Future for Submission {
    type Output = Result<JobReport>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.outcome)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::PoolShutdown)))
    }
}

/// Settings each worker thread runs with
#[derive(Clone)]
struct WorkerContext {
    synthesizer: Arc<dyn Synthesizer>,
    jobs: Receiver<Job>,
    terminate: Arc<AtomicBool>,
    // Dropped when the worker exits; teardown watches for disconnection
    _alive: Sender<()>,
    extract_rule: ExtractRule,
    chunk_size: usize,
    queue_poll: Duration,
}

/// Fixed-size pool of synthesis worker threads
pub struct SynthesisPool {
    jobs: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    alive: Receiver<()>,
    terminate: Arc<AtomicBool>,
    worker_count: usize,
    join_timeout: Duration,
}

impl SynthesisPool {
    /// Create a pool that calls the configured HTTP endpoint.
    ///
    /// Must not be called from inside an async runtime.
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let synthesizer = HttpSynthesizer::new(config)?;
        Self::with_synthesizer(config, Arc::new(synthesizer))
    }

    /// Create a pool around any synthesizer
    pub fn with_synthesizer(
        config: &PipelineConfig,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Result<Self> {
        config.validate()?;

        let (job_tx, job_rx) = unbounded();
        let (alive_tx, alive_rx) = unbounded();
        let terminate = Arc::new(AtomicBool::new(false));

        let context = WorkerContext {
            synthesizer,
            jobs: job_rx,
            terminate: terminate.clone(),
            _alive: alive_tx,
            extract_rule: config.extract_rule.clone(),
            chunk_size: config.chunk_size,
            queue_poll: config.queue_poll(),
        };

        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let context = context.clone();
            let handle = thread::Builder::new()
                .name(format!("blabber-synth-{}", index))
                .spawn(move || context.run())
                .map_err(|e| {
                    terminate.store(true, Ordering::SeqCst);
                    Error::from(e)
                })?;
            workers.push(handle);
        }
        drop(context);

        info!("Started synthesis pool with {} workers", config.workers);

        Ok(Self {
            jobs: Mutex::new(Some(job_tx)),
            workers: Mutex::new(workers),
            alive: alive_rx,
            terminate,
            worker_count: config.workers,
            join_timeout: config.join_timeout(),
        })
    }

    /// Queue a request whose audio goes to `sink`.
    ///
    /// Fails with `PoolShutdown` after teardown; the writer is closed then.
    pub fn submit_job(&self, request: SynthesisRequest, sink: ChannelWriter) -> Result<Submission> {
        let (completion, outcome) = oneshot::channel();
        let id = Uuid::new_v4();
        let job = Job {
            id,
            request,
            sink,
            completion,
        };

        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let sender = jobs.as_ref().ok_or(Error::PoolShutdown)?;
        sender.send(job).map_err(|_| Error::PoolShutdown)?;
        debug!("Queued synthesis job {} ({} pending)", id, sender.len());

        Ok(Submission { id, outcome })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Jobs waiting for a free worker
    pub fn pending_jobs(&self) -> usize {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(Sender::len)
            .unwrap_or(0)
    }

    pub fn is_shut_down(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    /// Stop all workers.
    ///
    /// Queued jobs are dropped (closing their writers); in-flight calls run to
    /// completion. Waits up to the configured join timeout, then leaves any
    /// still-busy worker running detached.
    pub fn teardown(&self) {
        if self.terminate.swap(true, Ordering::SeqCst) {
            return;
        }
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).take();

        let deadline = Instant::now() + self.join_timeout;
        let all_exited = loop {
            match self.alive.recv_deadline(deadline) {
                Err(RecvTimeoutError::Disconnected) => break true,
                Err(RecvTimeoutError::Timeout) => break false,
                Ok(()) => continue,
            }
        };

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        let mut detached = 0;
        for handle in workers {
            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!("Synthesis worker exited with a panic");
                }
            } else {
                detached += 1;
            }
        }

        if all_exited {
            info!("Synthesis pool shut down");
        } else {
            warn!(
                "Synthesis pool shut down with {} workers still busy",
                detached
            );
        }
    }
}

impl Drop for SynthesisPool {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl WorkerContext {
    fn run(self) {
        let name = thread::current().name().unwrap_or("blabber-synth").to_string();
        debug!("{} started", name);

        while !self.terminate.load(Ordering::SeqCst) {
            let job = match self.jobs.recv_timeout(self.queue_poll) {
                Ok(job) => job,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            self.process(job);
        }

        debug!("{} stopped", name);
    }

    fn process(&self, job: Job) {
        let Job {
            id,
            request,
            mut sink,
            completion,
        } = job;
        let started = Instant::now();
        debug!(
            "Job {} started: {} chars, voice {:?}, {}",
            id,
            request.text().chars().count(),
            request.voice_name(),
            request.language_code()
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.stream(&request, &mut sink)
        }))
        .unwrap_or_else(|payload| Err(Error::WorkerPanic(panic_message(payload.as_ref()))));

        // Always release the channel, whatever happened to the call
        sink.close();

        let outcome = outcome.map(|(bytes_written, chunks)| JobReport {
            id,
            bytes_written,
            chunks,
            elapsed: started.elapsed(),
        });

        match &outcome {
            Ok(report) if report.is_silent() => warn!(
                "Job {} finished without audio after {:?}",
                id, report.elapsed
            ),
            Ok(report) => debug!(
                "Job {} finished: {} bytes in {} chunks, {:?}",
                id, report.bytes_written, report.chunks, report.elapsed
            ),
            Err(e) => error!("Job {} failed via {}: {}", id, self.synthesizer.name(), e),
        }

        // The submitter may have stopped listening
        let _ = completion.send(outcome);
    }

    fn stream(&self, request: &SynthesisRequest, sink: &mut ChannelWriter) -> Result<(usize, usize)> {
        let mut body = self.synthesizer.synthesize(request)?;
        let mut decoder = FrameDecoder::new(self.extract_rule.clone());
        let mut buf = vec![0u8; self.chunk_size];
        let mut written = 0;
        let mut chunks = 0;

        loop {
            let n = match body.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            chunks += 1;

            let audio = decoder.decode(&buf[..n])?;
            if !audio.is_empty() {
                written += sink.write(audio)?;
            }
        }

        decoder.finish()?;
        Ok((written, chunks))
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
