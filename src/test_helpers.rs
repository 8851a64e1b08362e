//! Test helpers and fixtures
//!
//! A mock WebRTC engine plus canned SDP, used by the unit tests and by
//! embedders exercising the signaling path without a real engine.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use crate::service::connection::{
    Engine, IceCandidate, IceConnectionState, IceStateHandler, PeerConnection, SdpType,
    SessionDescription,
};
use crate::{Error, Result};

/// An in-process engine whose peer connections negotiate instantly.
#[derive(Default)]
pub struct MockEngine {
    connections: Mutex<Vec<Arc<MockPeerConnection>>>,
}

impl MockEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every peer connection handed out so far, in creation order
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<MockPeerConnection>> {
        self.connections.lock().unwrap().clone()
    }
}

impl Engine for MockEngine {
    fn new_peer_connection(&self) -> Result<Arc<dyn PeerConnection>> {
        let pc = Arc::new(MockPeerConnection::default());
        self.connections.lock().unwrap().push(pc.clone());
        Ok(pc)
    }
}

#[derive(Default)]
struct MockPcState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    closed: bool,
}

#[derive(Default)]
pub struct MockPeerConnection {
    state: Mutex<MockPcState>,
    handler: Mutex<Option<IceStateHandler>>,
}

impl MockPeerConnection {
    /// Simulate an ICE state change from the engine side
    pub fn fire_ice_state(&self, state: IceConnectionState) {
        let handler = self.handler.lock().unwrap();
        if let Some(handler) = handler.as_ref() {
            handler(state);
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    #[must_use]
    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().unwrap().candidates.clone()
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(Error::Internal("Peer connection is closed".to_string()));
        }
        state.remote = Some(description);
        Ok(())
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().remote.clone()
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        if self.state.lock().unwrap().closed {
            return Err(Error::Internal("Peer connection is closed".to_string()));
        }
        Ok(SessionDescription {
            sdp_type: SdpType::Offer,
            sdp: audio_video_offer(),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let state = self.state.lock().unwrap();
        if state.closed {
            return Err(Error::Internal("Peer connection is closed".to_string()));
        }
        if state.remote.is_none() {
            return Err(Error::Internal("No remote description".to_string()));
        }
        Ok(SessionDescription {
            sdp_type: SdpType::Answer,
            sdp: "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\na=ice-ufrag:mock\r\na=ice-pwd:mockpwd\r\n".to_string(),
        })
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(Error::Internal("Peer connection is closed".to_string()));
        }
        state.local = Some(description);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().local.clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(Error::Internal("Peer connection is closed".to_string()));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn gathering_complete(&self) {}

    fn set_ice_state_handler(&self, handler: Option<IceStateHandler>) {
        *self.handler.lock().unwrap() = handler;
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}

/// An offer publishing one opus audio track and one VP8 video track
#[must_use]
pub fn audio_video_offer() -> String {
    "v=0\r\n\
     o=- 1 1 IN IP4 127.0.0.1\r\n\
     s=-\r\n\
     a=ice-ufrag:offer\r\n\
     a=ice-pwd:offerpwd\r\n\
     m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
     a=mid:0\r\n\
     a=rtpmap:111 opus/48000/2\r\n\
     a=ssrc:54321 cname:mock\r\n\
     m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
     a=mid:1\r\n\
     a=rtpmap:96 VP8/90000\r\n\
     a=ssrc:12345 cname:mock\r\n"
        .to_string()
}

/// A simulcast video offer with two rids
#[must_use]
pub fn simulcast_offer() -> String {
    "v=0\r\n\
     o=- 1 1 IN IP4 127.0.0.1\r\n\
     s=-\r\n\
     m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
     a=mid:0\r\n\
     a=rtpmap:96 VP8/90000\r\n\
     a=rid:hi send\r\n\
     a=rid:lo send\r\n\
     a=simulcast:send hi;lo\r\n"
        .to_string()
}
