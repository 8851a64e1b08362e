//! WHIP publishers
//!
//! A WHIP client owns at most one up connection. ICE restarts arrive as
//! SDP fragments that are patched into the previous offer, preserving
//! its m-lines and ssrc values.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, Instrument};

use crate::logging;
use crate::models::{ChatEntry, ClientId, ConnId, PermissionSet};
use crate::service::client::{Client, JoinKind, PresenceEvent};
use crate::service::connection::{
    CancelHandle, Engine, IceCandidate, IceConnectionState, SessionDescription, UpConnection,
    UpTrack,
};
use crate::service::registry::Group;
use crate::{Error, Result};

/// A parsed SDP fragment, the body format of WHIP PATCH requests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpFragment {
    pub ufrag: Option<String>,
    pub pwd: Option<String>,
    pub media: Vec<FragmentMedia>,
}

/// Per-media-section content of an SDP fragment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FragmentMedia {
    pub mid: String,
    pub candidates: Vec<String>,
    pub end_of_candidates: bool,
}

impl SdpFragment {
    pub fn parse(input: &str) -> Result<Self> {
        let mut fragment = Self::default();
        let mut current: Option<FragmentMedia> = None;
        for line in input.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            if line.starts_with("m=") {
                if let Some(media) = current.take() {
                    fragment.media.push(media);
                }
                current = Some(FragmentMedia::default());
            } else if let Some(rest) = line.strip_prefix("a=mid:") {
                if let Some(media) = current.as_mut() {
                    media.mid = rest.to_string();
                }
            } else if let Some(rest) = line.strip_prefix("a=ice-ufrag:") {
                fragment.ufrag = Some(rest.to_string());
            } else if let Some(rest) = line.strip_prefix("a=ice-pwd:") {
                fragment.pwd = Some(rest.to_string());
            } else if line.starts_with("a=candidate:") {
                if let Some(media) = current.as_mut() {
                    media.candidates.push(line.to_string());
                }
            } else if line == "a=end-of-candidates" {
                if let Some(media) = current.as_mut() {
                    media.end_of_candidates = true;
                }
            }
        }
        if let Some(media) = current.take() {
            fragment.media.push(media);
        }
        if fragment.ufrag.is_none() && fragment.media.is_empty() {
            return Err(Error::Invalid("Empty SDP fragment".to_string()));
        }
        Ok(fragment)
    }

    /// Extract the fragment-relevant parts of a full session description.
    #[must_use]
    pub fn from_sdp(sdp: &str) -> Self {
        let mut fragment = Self::default();
        let mut current: Option<FragmentMedia> = None;
        for line in sdp.lines() {
            let line = line.trim_end();
            if line.starts_with("m=") {
                if let Some(media) = current.take() {
                    fragment.media.push(media);
                }
                current = Some(FragmentMedia::default());
            } else if let Some(rest) = line.strip_prefix("a=mid:") {
                if let Some(media) = current.as_mut() {
                    media.mid = rest.to_string();
                }
            } else if let Some(rest) = line.strip_prefix("a=ice-ufrag:") {
                if fragment.ufrag.is_none() {
                    fragment.ufrag = Some(rest.to_string());
                }
            } else if let Some(rest) = line.strip_prefix("a=ice-pwd:") {
                if fragment.pwd.is_none() {
                    fragment.pwd = Some(rest.to_string());
                }
            } else if line.starts_with("a=candidate:") {
                if let Some(media) = current.as_mut() {
                    media.candidates.push(line.to_string());
                }
            } else if line == "a=end-of-candidates" {
                if let Some(media) = current.as_mut() {
                    media.end_of_candidates = true;
                }
            }
        }
        if let Some(media) = current.take() {
            fragment.media.push(media);
        }
        fragment
    }

    /// Patch this fragment into a full offer: credentials are replaced
    /// in place, stale candidates dropped, and the fragment's candidates
    /// inserted into their media sections. Everything else, m-lines and
    /// ssrc values included, is preserved.
    #[must_use]
    pub fn patch(&self, sdp: &str) -> String {
        let mut out = Vec::new();
        let mut current_mid: Option<String> = None;
        for line in sdp.lines() {
            let line = line.trim_end();
            if line.starts_with("a=candidate:") || line == "a=end-of-candidates" {
                continue;
            }
            if let Some(rest) = line.strip_prefix("a=ice-ufrag:") {
                match &self.ufrag {
                    Some(ufrag) => out.push(format!("a=ice-ufrag:{ufrag}")),
                    None => out.push(format!("a=ice-ufrag:{rest}")),
                }
                continue;
            }
            if let Some(rest) = line.strip_prefix("a=ice-pwd:") {
                match &self.pwd {
                    Some(pwd) => out.push(format!("a=ice-pwd:{pwd}")),
                    None => out.push(format!("a=ice-pwd:{rest}")),
                }
                continue;
            }
            if line.starts_with("m=") {
                self.flush_candidates(&mut out, current_mid.take());
                current_mid = None;
            } else if let Some(rest) = line.strip_prefix("a=mid:") {
                current_mid = Some(rest.to_string());
            }
            out.push(line.to_string());
        }
        self.flush_candidates(&mut out, current_mid.take());
        let mut patched = out.join("\r\n");
        patched.push_str("\r\n");
        patched
    }

    fn flush_candidates(&self, out: &mut Vec<String>, mid: Option<String>) {
        let Some(mid) = mid else {
            return;
        };
        if let Some(media) = self.media.iter().find(|m| m.mid == mid) {
            out.extend(media.candidates.iter().cloned());
            if media.end_of_candidates {
                out.push("a=end-of-candidates".to_string());
            }
        }
    }
}

impl std::fmt::Display for SdpFragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ufrag) = &self.ufrag {
            writeln!(f, "a=ice-ufrag:{ufrag}\r")?;
        }
        if let Some(pwd) = &self.pwd {
            writeln!(f, "a=ice-pwd:{pwd}\r")?;
        }
        for media in &self.media {
            writeln!(f, "a=mid:{}\r", media.mid)?;
            for candidate in &media.candidates {
                writeln!(f, "{candidate}\r")?;
            }
            if media.end_of_candidates {
                writeln!(f, "a=end-of-candidates\r")?;
            }
        }
        Ok(())
    }
}

struct WhipState {
    username: String,
    permissions: PermissionSet,
    group: Option<Arc<Group>>,
    connection: Option<Arc<UpConnection>>,
    closed: bool,
}

/// A WHIP publisher: one HTTP-managed up connection, no downstream.
pub struct WhipClient {
    id: ClientId,
    token: String,
    addr: Option<SocketAddr>,
    engine: Arc<dyn Engine>,
    gather_timeout: Duration,
    state: Mutex<WhipState>,
}

impl WhipClient {
    #[must_use]
    pub fn new(
        id: ClientId,
        token: String,
        addr: Option<SocketAddr>,
        engine: Arc<dyn Engine>,
        gather_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            token,
            addr,
            engine,
            gather_timeout,
            state: Mutex::new(WhipState {
                username: String::new(),
                permissions: PermissionSet::new(),
                group: None,
                connection: None,
                closed: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, WhipState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// The bearer token this session was created with
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    #[must_use]
    pub fn connection(&self) -> Option<Arc<UpConnection>> {
        self.lock().connection.clone()
    }

    /// Negotiate the session's single up connection from the POSTed
    /// offer. A second connection on the same session is refused.
    pub async fn new_connection(
        self: &Arc<Self>,
        offer: &str,
        cancel: &CancelHandle,
    ) -> Result<SessionDescription> {
        let group = {
            let state = self.lock();
            if state.closed {
                return Err(Error::Invalid("Client is closed".to_string()));
            }
            if state.connection.is_some() {
                return Err(Error::Conflict("Duplicate connection".to_string()));
            }
            state
                .group
                .clone()
                .ok_or_else(|| Error::Invalid("Not in a group".to_string()))?
        };

        let conn_id = ConnId::from_string(self.id.0.clone());
        let span = logging::conn_span(&self.id, &conn_id);
        let (conn, answer) = UpConnection::negotiate(
            self.engine.as_ref(),
            conn_id,
            None,
            offer,
            self.gather_timeout,
            cancel,
        )
        .instrument(span)
        .await?;

        {
            let mut state = self.lock();
            if state.closed || state.connection.is_some() {
                drop(state);
                conn.close().await;
                return Err(Error::Conflict("Duplicate connection".to_string()));
            }
            state.connection = Some(conn.clone());
        }

        let client = Arc::downgrade(self);
        let up = Arc::downgrade(&conn);
        conn.set_ice_state_handler(Some(Box::new(move |state| {
            match state {
                IceConnectionState::Connected | IceConnectionState::Completed => {
                    if let Some(up) = up.upgrade() {
                        up.mark_connected();
                    }
                }
                IceConnectionState::Failed | IceConnectionState::Closed => {
                    if let Some(client) = client.upgrade() {
                        if let Ok(handle) = tokio::runtime::Handle::try_current() {
                            handle.spawn(async move {
                                let _ = client.close().await;
                            });
                        }
                    }
                }
                _ => {}
            }
        })));

        group
            .push_conn_except(&self.id, conn.id(), Some(conn.clone()), conn.tracks(), None)
            .await;
        Ok(answer)
    }

    /// Renegotiate the existing connection with a fresh offer.
    pub async fn got_offer(
        self: &Arc<Self>,
        offer: &str,
        cancel: &CancelHandle,
    ) -> Result<SessionDescription> {
        let (group, conn) = {
            let state = self.lock();
            let conn = state
                .connection
                .clone()
                .ok_or_else(|| Error::NotFound("No connection".to_string()))?;
            (state.group.clone(), conn)
        };
        let answer = conn.got_offer(offer, self.gather_timeout, cancel).await?;
        if let Some(group) = group {
            group
                .push_conn_except(&self.id, conn.id(), Some(conn.clone()), conn.tracks(), None)
                .await;
        }
        Ok(answer)
    }

    /// Trickle ICE from a PATCH request.
    pub async fn got_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let conn = self.lock().connection.clone();
        match conn {
            Some(conn) => conn.add_ice_candidate(candidate).await,
            None => Ok(()),
        }
    }

    /// ICE restart from a PATCH request: patch the fragment into the
    /// previous offer and renegotiate. Returns the answer fragment.
    pub async fn restart(
        self: &Arc<Self>,
        fragment: &SdpFragment,
        cancel: &CancelHandle,
    ) -> Result<SdpFragment> {
        let conn = self
            .lock()
            .connection
            .clone()
            .ok_or_else(|| Error::NotFound("No connection".to_string()))?;
        let offer = conn
            .remote_description()
            .await
            .ok_or_else(|| Error::Invalid("No remote description".to_string()))?;
        let patched = fragment.patch(&offer.sdp);
        let answer = self.got_offer(&patched, cancel).await?;
        Ok(SdpFragment::from_sdp(&answer.sdp))
    }
}

#[async_trait]
impl Client for WhipClient {
    fn id(&self) -> &ClientId {
        &self.id
    }

    fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    fn username(&self) -> String {
        self.lock().username.clone()
    }

    fn set_username(&self, username: String) {
        self.lock().username = username;
    }

    fn permissions(&self) -> PermissionSet {
        self.lock().permissions.clone()
    }

    fn set_permissions(&self, permissions: PermissionSet) {
        self.lock().permissions = permissions;
    }

    fn data(&self) -> HashMap<String, serde_json::Value> {
        HashMap::new()
    }

    fn group(&self) -> Option<Arc<Group>> {
        self.lock().group.clone()
    }

    fn set_group(&self, group: Option<Arc<Group>>) {
        self.lock().group = group;
    }

    async fn joined(&self, _group: Arc<Group>, _kind: JoinKind) -> Result<()> {
        Ok(())
    }

    async fn push_conn(
        &self,
        _group: &Arc<Group>,
        _id: &ConnId,
        _up: Option<Arc<UpConnection>>,
        _tracks: Vec<Arc<UpTrack>>,
        _replace: Option<ConnId>,
    ) -> Result<()> {
        Ok(())
    }

    async fn push_client(&self, _group: &str, _event: PresenceEvent) -> Result<()> {
        Ok(())
    }

    async fn push_message(&self, _group: &str, _entry: &ChatEntry) -> Result<()> {
        Ok(())
    }

    async fn request_conns(&self, target: Arc<dyn Client>, group: &Arc<Group>) -> Result<()> {
        let conn = {
            let state = self.lock();
            match &state.group {
                Some(own) if Arc::ptr_eq(own, group) => state.connection.clone(),
                _ => return Ok(()),
            }
        };
        if let Some(conn) = conn {
            target
                .push_conn(group, conn.id(), Some(conn.clone()), conn.tracks(), None)
                .await?;
        }
        Ok(())
    }

    async fn kick(
        &self,
        _by_id: Option<ClientId>,
        _by_username: Option<String>,
        _message: String,
    ) -> Result<()> {
        self.close().await
    }

    async fn close(&self) -> Result<()> {
        let (group, conn) = {
            let mut state = self.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            (state.group.take(), state.connection.take())
        };

        if let Some(conn) = conn {
            let id = conn.id().clone();
            conn.close().await;
            if let Some(group) = &group {
                group.push_conn_except(&self.id, &id, None, Vec::new(), None).await;
            }
        }
        if let Some(group) = group {
            group.del_client(&self.id).await;
        }
        debug!(client = %self.id, "Closed WHIP client");
        Ok(())
    }
}
