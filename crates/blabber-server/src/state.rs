//! Application state management

use blabber_core::{AudioSource, PipelineConfig, SynthesisPool, VoiceDefaults};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::player::Player;
use crate::settings::ServerConfig;

/// One speaking voice connection: its audio source and the thread playing it
pub struct Session {
    pub id: String,
    pub source: Arc<AudioSource>,
    pub player: Player,
}

impl Session {
    fn start(
        id: &str,
        pool: Arc<SynthesisPool>,
        pipeline: &PipelineConfig,
        server: &ServerConfig,
    ) -> Result<Self, ApiError> {
        let source = Arc::new(AudioSource::new(pool, pipeline)?);
        let player = Player::start(id, source.clone(), server.frame(), server.listener_buffer)
            .map_err(|e| ApiError::internal(format!("Failed to start player: {}", e)))?;
        Ok(Self {
            id: id.to_string(),
            source,
            player,
        })
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<SynthesisPool>,
    pub pipeline: Arc<PipelineConfig>,
    pub server: Arc<ServerConfig>,
    pub voice: Arc<VoiceDefaults>,
    pub sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl AppState {
    pub fn new(
        pool: Arc<SynthesisPool>,
        pipeline: PipelineConfig,
        server: ServerConfig,
        voice: VoiceDefaults,
    ) -> Self {
        Self {
            pool,
            pipeline: Arc::new(pipeline),
            server: Arc::new(server),
            voice: Arc::new(voice),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Existing session, or a new one started on first use
    pub async fn session_or_start(&self, id: &str) -> Result<Arc<Session>, ApiError> {
        if let Some(session) = self.session(id).await {
            return Ok(session);
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(id) {
            return Ok(session.clone());
        }
        let session = Arc::new(Session::start(
            id,
            self.pool.clone(),
            &self.pipeline,
            &self.server,
        )?);
        sessions.insert(id.to_string(), session.clone());
        info!("Started session {} ({} active)", id, sessions.len());
        Ok(session)
    }

    /// Stop and forget a session. Returns false if it did not exist.
    pub async fn remove_session(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(session) => {
                session.player.stop();
                info!("Removed session {}", id);
                true
            }
            None => false,
        }
    }

    /// Stop every session player and wait for the threads to exit
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain().collect();
        let count = sessions.len();
        for (_, session) in &sessions {
            session.player.stop();
        }

        let joined = tokio::task::spawn_blocking(move || {
            for (_, session) in sessions {
                session.player.join();
            }
        })
        .await;
        if let Err(e) = joined {
            warn!("Failed to join session players: {}", e);
        }
        info!("Stopped {} sessions", count);
    }
}
