//! Fixed-cadence packet puller standing in for a voice connection

use blabber_core::AudioSource;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Pulls one packet per frame from an [`AudioSource`] on its own thread and
/// broadcasts every non-empty packet to the session's listeners.
pub struct Player {
    packets: broadcast::Sender<Bytes>,
    stop: Arc<AtomicBool>,
    played: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Player {
    pub fn start(
        name: &str,
        source: Arc<AudioSource>,
        frame: Duration,
        buffer: usize,
    ) -> std::io::Result<Self> {
        let (packets, _) = broadcast::channel(buffer);
        let stop = Arc::new(AtomicBool::new(false));
        let played = Arc::new(AtomicU64::new(0));

        let handle = {
            let packets = packets.clone();
            let stop = stop.clone();
            let played = played.clone();
            let name = name.to_string();
            thread::Builder::new()
                .name(format!("blabber-player-{}", name))
                .spawn(move || play(&name, &source, frame, &packets, &stop, &played))?
        };

        Ok(Self {
            packets,
            stop,
            played,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Listen to packets played from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.packets.subscribe()
    }

    pub fn listeners(&self) -> usize {
        self.packets.receiver_count()
    }

    /// Packets played since the start
    pub fn played(&self) -> u64 {
        self.played.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::SeqCst)
    }

    /// Ask the thread to stop; it exits after its current frame
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Stop and wait for the thread to exit.
    ///
    /// Returns false if the thread had panicked.
    pub fn join(&self) -> bool {
        self.stop();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let clean = handle.map_or(true, |handle| handle.join().is_ok());
        if !clean {
            warn!("Player thread exited with a panic");
        }
        clean
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}

fn play(
    name: &str,
    source: &AudioSource,
    frame: Duration,
    packets: &broadcast::Sender<Bytes>,
    stop: &AtomicBool,
    played: &AtomicU64,
) {
    info!("Player {} started ({:?} frames)", name, frame);
    let mut next_frame = Instant::now();

    while !stop.load(Ordering::SeqCst) {
        let packet = source.read();
        if !packet.is_empty() {
            played.fetch_add(1, Ordering::Relaxed);
            // No listeners is fine, the packet is simply not heard
            let _ = packets.send(packet);
        }

        next_frame += frame;
        let now = Instant::now();
        if next_frame > now {
            thread::sleep(next_frame - now);
        } else {
            next_frame = now;
        }
    }

    debug!(
        "Player {} stopped after {} packets",
        name,
        played.load(Ordering::Relaxed)
    );
}
