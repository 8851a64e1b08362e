//! Up and down connection lifecycle
//!
//! Wraps the external WebRTC engine behind the [`PeerConnection`] seam
//! and owns the signaling-level state machine:
//!
//! ```text
//! NEW -> OFFERED -> NEGOTIATED -> CONNECTED -> (RENEGOTIATING -> CONNECTED)* -> CLOSED
//! ```
//!
//! Close is idempotent from every state, and every error path releases
//! the underlying peer connection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::models::{ClientId, ConnId};
use crate::{Error, Result};

/// Session description (SDP)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Pranswer => "pranswer",
            Self::Rollback => "rollback",
        }
    }
}

/// ICE candidate for connection establishment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u32>,
}

/// ICE connection state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

pub type IceStateHandler = Box<dyn Fn(IceConnectionState) + Send + Sync>;

/// The contract the external WebRTC engine satisfies toward the core.
///
/// ICE callbacks fire on engine threads; implementations must tolerate
/// the handler being detached concurrently with a state change.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;
    async fn remote_description(&self) -> Option<SessionDescription>;
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;
    async fn local_description(&self) -> Option<SessionDescription>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    /// Resolves once ICE candidate gathering has completed
    async fn gathering_complete(&self);
    /// Passing `None` detaches the handler
    fn set_ice_state_handler(&self, handler: Option<IceStateHandler>);
    async fn close(&self) -> Result<()>;
}

/// Factory for peer connections, implemented by the engine
pub trait Engine: Send + Sync {
    fn new_peer_connection(&self) -> Result<Arc<dyn PeerConnection>>;
}

/// Signaling-level connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Offered,
    Negotiated,
    Connected,
    Renegotiating,
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Cancellation handle for connection setup.
///
/// Cancelling during negotiation makes the answer reflect whatever was
/// gathered so far; cancelling before negotiation aborts it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain data about one track, as carried in signaling events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub codec: String,
    pub ssrc: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
}

/// One track of a published stream.
///
/// The jitter buffer and NACK generator live in the engine; the core
/// keeps the per-subscriber layer requests used for simulcast selection.
#[derive(Debug)]
pub struct UpTrack {
    pub codec: String,
    pub ssrc: u32,
    pub rid: Option<String>,
    layers: Mutex<HashMap<ClientId, u8>>,
}

impl UpTrack {
    #[must_use]
    pub fn new(codec: String, ssrc: u32, rid: Option<String>) -> Self {
        Self {
            codec,
            ssrc,
            rid,
            layers: Mutex::new(HashMap::new()),
        }
    }

    pub fn request_layer(&self, subscriber: &ClientId, layer: u8) {
        self.layers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(subscriber.clone(), layer);
    }

    #[must_use]
    pub fn requested_layer(&self, subscriber: &ClientId) -> u8 {
        self.layers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(subscriber)
            .copied()
            .unwrap_or(0)
    }

    pub fn forget_subscriber(&self, subscriber: &ClientId) {
        self.layers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(subscriber);
    }

    #[must_use]
    pub fn info(&self) -> TrackInfo {
        TrackInfo {
            codec: self.codec.clone(),
            ssrc: self.ssrc,
            rid: self.rid.clone(),
        }
    }
}

/// Server-side representation of an incoming (published) stream
pub struct UpConnection {
    id: ConnId,
    label: Option<String>,
    pc: Arc<dyn PeerConnection>,
    state: Mutex<ConnectionState>,
    tracks: Mutex<Vec<Arc<UpTrack>>>,
}

impl std::fmt::Debug for UpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpConnection")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish()
    }
}

impl UpConnection {
    /// Create an up connection from a publisher's offer and negotiate
    /// the answer. On any failure the peer connection is released.
    pub async fn negotiate(
        engine: &dyn Engine,
        id: ConnId,
        label: Option<String>,
        offer: &str,
        gather_timeout: Duration,
        cancel: &CancelHandle,
    ) -> Result<(Arc<Self>, SessionDescription)> {
        let pc = engine.new_peer_connection()?;
        let conn = Arc::new(Self {
            id,
            label,
            pc,
            state: Mutex::new(ConnectionState::New),
            tracks: Mutex::new(Vec::new()),
        });
        match conn.got_offer(offer, gather_timeout, cancel).await {
            Ok(answer) => Ok((conn, answer)),
            Err(e) => {
                conn.close().await;
                Err(e)
            }
        }
    }

    /// Apply a (re)offer from the publisher and produce the answer.
    ///
    /// The answer is the local description at the earlier of gathering
    /// completion, cancellation, and the gather timeout.
    pub async fn got_offer(
        &self,
        offer: &str,
        gather_timeout: Duration,
        cancel: &CancelHandle,
    ) -> Result<SessionDescription> {
        if cancel.is_cancelled() {
            return Err(Error::Unavailable("Negotiation cancelled".to_string()));
        }
        {
            let mut state = self.lock_state();
            match *state {
                ConnectionState::Closed => {
                    return Err(Error::Invalid("Connection is closed".to_string()))
                }
                ConnectionState::New | ConnectionState::Offered => {
                    *state = ConnectionState::Offered;
                }
                _ => *state = ConnectionState::Renegotiating,
            }
        }

        let tracks = parse_tracks(offer)?;
        self.pc
            .set_remote_description(SessionDescription {
                sdp_type: SdpType::Offer,
                sdp: offer.to_string(),
            })
            .await?;
        *self.lock_tracks() = tracks;

        let answer = self.pc.create_answer().await?;
        self.pc.set_local_description(answer.clone()).await?;
        {
            let mut state = self.lock_state();
            if state.is_closed() {
                return Err(Error::Invalid("Connection is closed".to_string()));
            }
            *state = match *state {
                ConnectionState::Renegotiating => ConnectionState::Connected,
                _ => ConnectionState::Negotiated,
            };
        }

        tokio::select! {
            () = self.pc.gathering_complete() => {}
            () = cancel.cancelled() => {}
            () = tokio::time::sleep(gather_timeout) => {}
        }

        Ok(self.pc.local_description().await.unwrap_or(answer))
    }

    #[must_use]
    pub fn id(&self) -> &ConnId {
        &self.id
    }

    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.lock_state()
    }

    #[must_use]
    pub fn tracks(&self) -> Vec<Arc<UpTrack>> {
        self.lock_tracks().clone()
    }

    #[must_use]
    pub fn track_infos(&self) -> Vec<TrackInfo> {
        self.lock_tracks().iter().map(|t| t.info()).collect()
    }

    pub async fn remote_description(&self) -> Option<SessionDescription> {
        self.pc.remote_description().await
    }

    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc.add_ice_candidate(candidate).await
    }

    pub fn set_ice_state_handler(&self, handler: Option<IceStateHandler>) {
        self.pc.set_ice_state_handler(handler);
    }

    /// Marshalled in from the engine's ICE callback
    pub fn mark_connected(&self) {
        let mut state = self.lock_state();
        if matches!(
            *state,
            ConnectionState::Negotiated | ConnectionState::Renegotiating
        ) {
            *state = ConnectionState::Connected;
        }
    }

    /// Idempotent close. The ICE handler is detached first so the
    /// engine cannot re-enter the close path.
    ///
    /// Returns false if the connection was already closed.
    pub async fn close(&self) -> bool {
        {
            let mut state = self.lock_state();
            if state.is_closed() {
                return false;
            }
            *state = ConnectionState::Closed;
        }
        self.pc.set_ice_state_handler(None);
        if let Err(e) = self.pc.close().await {
            debug!(conn = %self.id, "Peer connection close failed: {e}");
        }
        true
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ConnectionState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_tracks(&self) -> std::sync::MutexGuard<'_, Vec<Arc<UpTrack>>> {
        self.tracks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Server-side representation of an outgoing (subscribed) stream
pub struct DownConnection {
    id: ConnId,
    remote_up: ConnId,
    pc: Arc<dyn PeerConnection>,
    state: Mutex<ConnectionState>,
    tracks: Mutex<Vec<TrackInfo>>,
}

impl DownConnection {
    /// Create a down connection mirroring an up connection's tracks and
    /// produce the initial offer.
    pub async fn negotiate(
        engine: &dyn Engine,
        up: &UpConnection,
    ) -> Result<(Arc<Self>, SessionDescription)> {
        let pc = engine.new_peer_connection()?;
        let conn = Arc::new(Self {
            id: ConnId::new(),
            remote_up: up.id().clone(),
            pc,
            state: Mutex::new(ConnectionState::New),
            tracks: Mutex::new(up.track_infos()),
        });
        match conn.offer().await {
            Ok(offer) => Ok((conn, offer)),
            Err(e) => {
                conn.close().await;
                Err(e)
            }
        }
    }

    async fn offer(&self) -> Result<SessionDescription> {
        {
            let mut state = self.lock_state();
            if state.is_closed() {
                return Err(Error::Invalid("Connection is closed".to_string()));
            }
            *state = match *state {
                ConnectionState::New => ConnectionState::Offered,
                _ => ConnectionState::Renegotiating,
            };
        }
        let offer = self.pc.create_offer().await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    /// Apply the subscriber's answer.
    pub async fn got_answer(&self, sdp: &str) -> Result<()> {
        {
            let state = self.lock_state();
            match *state {
                ConnectionState::Offered | ConnectionState::Renegotiating => {}
                ConnectionState::Closed => {
                    return Err(Error::Invalid("Connection is closed".to_string()))
                }
                _ => return Err(Error::Invalid("Unexpected answer".to_string())),
            }
        }
        self.pc
            .set_remote_description(SessionDescription {
                sdp_type: SdpType::Answer,
                sdp: sdp.to_string(),
            })
            .await?;
        let mut state = self.lock_state();
        if !state.is_closed() {
            *state = match *state {
                ConnectionState::Renegotiating => ConnectionState::Connected,
                _ => ConnectionState::Negotiated,
            };
        }
        Ok(())
    }

    /// Re-mirror the up connection's track set and produce a fresh
    /// offer. Called whenever the publisher's tracks change.
    pub async fn update_tracks(&self, up: &UpConnection) -> Result<SessionDescription> {
        *self
            .tracks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = up.track_infos();
        self.offer().await
    }

    #[must_use]
    pub fn id(&self) -> &ConnId {
        &self.id
    }

    /// The up connection this down connection mirrors
    #[must_use]
    pub fn remote_up(&self) -> &ConnId {
        &self.remote_up
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.lock_state()
    }

    #[must_use]
    pub fn tracks(&self) -> Vec<TrackInfo> {
        self.tracks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc.add_ice_candidate(candidate).await
    }

    pub fn set_ice_state_handler(&self, handler: Option<IceStateHandler>) {
        self.pc.set_ice_state_handler(handler);
    }

    pub fn mark_connected(&self) {
        let mut state = self.lock_state();
        if matches!(
            *state,
            ConnectionState::Negotiated | ConnectionState::Renegotiating
        ) {
            *state = ConnectionState::Connected;
        }
    }

    /// Idempotent close; returns false if already closed.
    pub async fn close(&self) -> bool {
        {
            let mut state = self.lock_state();
            if state.is_closed() {
                return false;
            }
            *state = ConnectionState::Closed;
        }
        self.pc.set_ice_state_handler(None);
        if let Err(e) = self.pc.close().await {
            debug!(conn = %self.id, "Peer connection close failed: {e}");
        }
        true
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ConnectionState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Extract the published tracks from an SDP offer.
///
/// One track per audio or video section; with simulcast, one track per
/// rid the publisher sends.
fn parse_tracks(sdp: &str) -> Result<Vec<Arc<UpTrack>>> {
    struct Section {
        codec: Option<String>,
        ssrc: Option<u32>,
        rids: Vec<String>,
    }

    fn flush(section: Option<Section>, tracks: &mut Vec<Arc<UpTrack>>) -> Result<()> {
        let Some(section) = section else {
            return Ok(());
        };
        let codec = section
            .codec
            .ok_or_else(|| Error::Invalid("Media section without rtpmap".to_string()))?;
        if section.rids.is_empty() {
            tracks.push(Arc::new(UpTrack::new(
                codec,
                section.ssrc.unwrap_or(0),
                None,
            )));
        } else {
            for rid in section.rids {
                tracks.push(Arc::new(UpTrack::new(codec.clone(), 0, Some(rid))));
            }
        }
        Ok(())
    }

    let mut tracks = Vec::new();
    let mut current: Option<Section> = None;

    for line in sdp.lines() {
        let line = line.trim_end();
        if line.starts_with("m=audio") || line.starts_with("m=video") {
            flush(current.take(), &mut tracks)?;
            current = Some(Section {
                codec: None,
                ssrc: None,
                rids: Vec::new(),
            });
        } else if line.starts_with("m=") {
            flush(current.take(), &mut tracks)?;
        } else if let Some(section) = current.as_mut() {
            if let Some(rest) = line.strip_prefix("a=rtpmap:") {
                if section.codec.is_none() {
                    section.codec = rest
                        .split_whitespace()
                        .nth(1)
                        .and_then(|s| s.split('/').next())
                        .map(str::to_string);
                }
            } else if let Some(rest) = line.strip_prefix("a=ssrc:") {
                if section.ssrc.is_none() {
                    section.ssrc = rest.split_whitespace().next().and_then(|s| s.parse().ok());
                }
            } else if let Some(rest) = line.strip_prefix("a=rid:") {
                let mut parts = rest.split_whitespace();
                if let (Some(rid), Some("send")) = (parts.next(), parts.next()) {
                    section.rids.push(rid.to_string());
                }
            }
        }
    }
    flush(current.take(), &mut tracks)?;

    if tracks.is_empty() {
        return Err(Error::Invalid("No media sections in SDP".to_string()));
    }
    Ok(tracks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{audio_video_offer, simulcast_offer, MockEngine};

    #[tokio::test]
    async fn test_up_negotiation() {
        let engine = MockEngine::new();
        let cancel = CancelHandle::new();
        let (up, answer) = UpConnection::negotiate(
            &engine,
            ConnId::from("up1"),
            Some("camera".to_string()),
            &audio_video_offer(),
            Duration::from_secs(1),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(answer.sdp_type, SdpType::Answer);
        assert_eq!(up.state(), ConnectionState::Negotiated);
        let infos = up.track_infos();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].codec, "opus");
        assert_eq!(infos[1].codec, "VP8");
        assert_eq!(infos[1].ssrc, 12345);

        up.mark_connected();
        assert_eq!(up.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_up_simulcast_tracks() {
        let engine = MockEngine::new();
        let cancel = CancelHandle::new();
        let (up, _) = UpConnection::negotiate(
            &engine,
            ConnId::new(),
            None,
            &simulcast_offer(),
            Duration::from_secs(1),
            &cancel,
        )
        .await
        .unwrap();

        let rids: Vec<Option<String>> = up.track_infos().into_iter().map(|t| t.rid).collect();
        assert!(rids.contains(&Some("hi".to_string())));
        assert!(rids.contains(&Some("lo".to_string())));
    }

    #[tokio::test]
    async fn test_up_bad_sdp() {
        let engine = MockEngine::new();
        let cancel = CancelHandle::new();
        let err = UpConnection::negotiate(
            &engine,
            ConnId::new(),
            None,
            "v=0\r\ns=-\r\n",
            Duration::from_secs(1),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[tokio::test]
    async fn test_up_renegotiation_states() {
        let engine = MockEngine::new();
        let cancel = CancelHandle::new();
        let (up, _) = UpConnection::negotiate(
            &engine,
            ConnId::new(),
            None,
            &audio_video_offer(),
            Duration::from_secs(1),
            &cancel,
        )
        .await
        .unwrap();
        up.mark_connected();

        let answer = up
            .got_offer(&audio_video_offer(), Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        assert_eq!(up.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let engine = MockEngine::new();
        let cancel = CancelHandle::new();
        let (up, _) = UpConnection::negotiate(
            &engine,
            ConnId::new(),
            None,
            &audio_video_offer(),
            Duration::from_secs(1),
            &cancel,
        )
        .await
        .unwrap();

        assert!(up.close().await);
        assert!(!up.close().await);
        assert_eq!(up.state(), ConnectionState::Closed);
        assert!(up
            .got_offer(&audio_video_offer(), Duration::from_secs(1), &cancel)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cancelled_before_setup() {
        let engine = MockEngine::new();
        let cancel = CancelHandle::new();
        cancel.cancel();
        let err = UpConnection::negotiate(
            &engine,
            ConnId::new(),
            None,
            &audio_video_offer(),
            Duration::from_secs(1),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_down_lifecycle() {
        let engine = MockEngine::new();
        let cancel = CancelHandle::new();
        let (up, _) = UpConnection::negotiate(
            &engine,
            ConnId::from("up1"),
            None,
            &audio_video_offer(),
            Duration::from_secs(1),
            &cancel,
        )
        .await
        .unwrap();

        let (down, offer) = DownConnection::negotiate(&engine, &up).await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert_eq!(down.remote_up(), up.id());
        assert_eq!(down.tracks(), up.track_infos());
        assert_eq!(down.state(), ConnectionState::Offered);

        down.got_answer("v=0\r\n").await.unwrap();
        assert_eq!(down.state(), ConnectionState::Negotiated);
        down.mark_connected();
        assert_eq!(down.state(), ConnectionState::Connected);

        // track change triggers renegotiation
        let offer = down.update_tracks(&up).await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert_eq!(down.state(), ConnectionState::Renegotiating);
        down.got_answer("v=0\r\n").await.unwrap();
        assert_eq!(down.state(), ConnectionState::Connected);

        assert!(down.close().await);
        assert!(!down.close().await);
    }

    #[tokio::test]
    async fn test_unexpected_answer() {
        let engine = MockEngine::new();
        let cancel = CancelHandle::new();
        let (up, _) = UpConnection::negotiate(
            &engine,
            ConnId::new(),
            None,
            &audio_video_offer(),
            Duration::from_secs(1),
            &cancel,
        )
        .await
        .unwrap();
        let (down, _) = DownConnection::negotiate(&engine, &up).await.unwrap();
        down.got_answer("v=0\r\n").await.unwrap();
        assert!(down.got_answer("v=0\r\n").await.is_err());
    }

    #[test]
    fn test_up_track_layers() {
        let track = UpTrack::new("VP8".to_string(), 1, None);
        let subscriber = ClientId::from("c1");
        assert_eq!(track.requested_layer(&subscriber), 0);
        track.request_layer(&subscriber, 2);
        assert_eq!(track.requested_layer(&subscriber), 2);
        track.forget_subscriber(&subscriber);
        assert_eq!(track.requested_layer(&subscriber), 0);
    }
}
