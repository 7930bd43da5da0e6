//! Session endpoints
//!
//! A session is one voice connection: text posted to it is spoken in order
//! and its audio is streamed to every listener of `/audio`.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::Response,
    Json,
};
use blabber_core::{SourceState, SsmlGender, SynthesisRequest};
use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Speak request
#[derive(Debug, Deserialize)]
pub struct SpeakRequest {
    pub text: String,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SpeakQuery {
    /// Answer only once the phrase has been synthesized
    #[serde(default)]
    pub wait: bool,
}

/// Speak response
#[derive(Debug, Serialize)]
pub struct SpeakResponse {
    pub job_id: Uuid,
    pub session: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_written: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

/// Session status response
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session: String,
    pub state: &'static str,
    pub speaking: bool,
    pub playing: bool,
    pub listeners: usize,
    pub packets: u64,
}

/// Queue text for speech on a session, starting the session on first use
pub async fn speak(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<SpeakQuery>,
    Json(req): Json<SpeakRequest>,
) -> Result<(StatusCode, Json<SpeakResponse>), ApiError> {
    info!(
        "Speak request for session {}: {} chars, voice: {:?}",
        id,
        req.text.chars().count(),
        req.voice
    );

    let request = build_request(&state, req)?;
    // Checked before the session exists so a bad request starts no player
    request.validate(state.pipeline.max_text_chars)?;

    let session = state.session_or_start(&id).await?;
    let submission = session.source.submit(request)?;
    let job_id = submission.id();

    if !query.wait {
        return Ok((
            StatusCode::ACCEPTED,
            Json(SpeakResponse {
                job_id,
                session: id,
                bytes_written: None,
                elapsed_ms: None,
            }),
        ));
    }

    let report = submission.await?;
    if report.is_silent() {
        warn!("Job {} for session {} produced no audio", job_id, id);
    }
    Ok((
        StatusCode::OK,
        Json(SpeakResponse {
            job_id,
            session: id,
            bytes_written: Some(report.bytes_written),
            elapsed_ms: Some(report.elapsed.as_millis() as u64),
        }),
    ))
}

fn build_request(state: &AppState, req: SpeakRequest) -> Result<SynthesisRequest, ApiError> {
    let mut request = SynthesisRequest::with_defaults(req.text, &state.voice);
    if let Some(voice) = req.voice {
        request = request.voice(voice);
    }
    if let Some(language) = req.language {
        request = request.language(language);
    }
    if let Some(gender) = req.gender {
        request = request.gender(gender.parse::<SsmlGender>()?);
    }
    Ok(request)
}

/// Session status
pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state
        .session(&id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Session not found: {}", id)))?;

    Ok(Json(SessionResponse {
        session: session.id.clone(),
        state: state_name(session.source.state()),
        speaking: session.source.is_speaking(),
        playing: session.player.is_running(),
        listeners: session.player.listeners(),
        packets: session.player.played(),
    }))
}

fn state_name(state: SourceState) -> &'static str {
    match state {
        SourceState::Idle => "idle",
        SourceState::Streaming => "streaming",
        SourceState::Drained => "drained",
    }
}

/// Stream the packets a session plays from now on.
///
/// Each packet is sent as a big-endian `u32` length followed by its bytes.
/// The body ends when the session is removed.
pub async fn audio(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let mut packets = match state.session(&id).await {
        Some(session) => BroadcastStream::new(session.player.subscribe()),
        None => return Err(ApiError::not_found(format!("Session not found: {}", id))),
    };
    debug!("New audio listener on session {}", id);

    let stream = async_stream::stream! {
        while let Some(packet) = packets.next().await {
            match packet {
                Ok(packet) => {
                    yield Ok::<Bytes, Infallible>(frame_packet(&packet));
                }
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!("Audio listener on session {} lagged, skipped {} packets", id, skipped);
                }
            }
        }
        debug!("Audio listener on session {} finished", id);
    };

    Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::internal(e.to_string()))
}

/// Length-prefix one packet for the audio stream
pub fn frame_packet(packet: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(4 + packet.len());
    frame.put_u32(packet.len() as u32);
    frame.extend_from_slice(packet);
    frame.freeze()
}

/// Abandon everything the session is about to say
pub async fn clear(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let session = state
        .session(&id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Session not found: {}", id)))?;
    session.source.clear()?;
    Ok(StatusCode::NO_CONTENT)
}

/// Stop the session's player and forget the session
pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.remove_session(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("Session not found: {}", id)))
    }
}
