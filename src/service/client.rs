//! The polymorphic client contract
//!
//! Anything that participates in a group satisfies [`Client`]: signaling
//! peers, WHIP publishers, recorders. The registry only ever talks to
//! this trait; callbacks are invoked with all group locks released.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, Instrument};

use crate::logging;
use crate::models::{ChatEntry, ClientId, ConnId, PermissionSet};
use crate::service::connection::{
    CancelHandle, DownConnection, Engine, IceCandidate, IceConnectionState, SessionDescription,
    TrackInfo, UpConnection, UpTrack,
};
use crate::service::registry::Group;
use crate::{Error, Result};

/// Lifecycle callback kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Join,
    Leave,
    Change,
}

/// Presence update kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    Add,
    Change,
    Delete,
}

/// A presence update about one client, fanned out to its peers
#[derive(Debug, Clone)]
pub struct PresenceEvent {
    pub kind: PresenceKind,
    pub id: ClientId,
    pub username: String,
    pub permissions: PermissionSet,
    pub data: HashMap<String, serde_json::Value>,
}

#[async_trait]
pub trait Client: Send + Sync {
    fn id(&self) -> &ClientId;
    fn addr(&self) -> Option<SocketAddr>;
    fn username(&self) -> String;
    fn set_username(&self, username: String);
    fn permissions(&self) -> PermissionSet;
    fn set_permissions(&self, permissions: PermissionSet);
    /// Transient key-value presence data
    fn data(&self) -> HashMap<String, serde_json::Value>;
    fn group(&self) -> Option<Arc<Group>>;
    /// Set by the registry under the group lock; not for external use
    fn set_group(&self, group: Option<Arc<Group>>);

    /// Membership lifecycle callback
    async fn joined(&self, group: Arc<Group>, kind: JoinKind) -> Result<()>;
    /// A publisher appeared (`up` set), changed, or went away (`up`
    /// empty). `replace` names an up connection this one supersedes.
    async fn push_conn(
        &self,
        group: &Arc<Group>,
        id: &ConnId,
        up: Option<Arc<UpConnection>>,
        tracks: Vec<Arc<UpTrack>>,
        replace: Option<ConnId>,
    ) -> Result<()>;
    /// A presence update about some client in the group
    async fn push_client(&self, group: &str, event: PresenceEvent) -> Result<()>;
    /// A chat message or operator broadcast
    async fn push_message(&self, group: &str, entry: &ChatEntry) -> Result<()>;
    /// Push this client's own up connections to `target`, used to bring
    /// a late joiner up to date.
    async fn request_conns(&self, target: Arc<dyn Client>, group: &Arc<Group>) -> Result<()>;
    async fn kick(
        &self,
        by_id: Option<ClientId>,
        by_username: Option<String>,
        message: String,
    ) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Events delivered to the signaling layer through a client's channel
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Joined {
        group: String,
        kind: JoinKind,
        permissions: PermissionSet,
    },
    /// A down connection was created or renegotiated; `offer` must be
    /// forwarded to the peer.
    Down {
        id: ConnId,
        remote: ConnId,
        tracks: Vec<TrackInfo>,
        replace: Option<ConnId>,
        offer: SessionDescription,
    },
    /// The publisher behind a down connection went away
    DownGone {
        id: ConnId,
        remote: ConnId,
    },
    Presence(PresenceEvent),
    Message(ChatEntry),
    Kicked {
        by: Option<String>,
        message: String,
    },
}

struct SignalingState {
    username: String,
    permissions: PermissionSet,
    data: HashMap<String, serde_json::Value>,
    group: Option<Arc<Group>>,
    up: HashMap<ConnId, Arc<UpConnection>>,
    /// Down connections keyed by the remote up id, so a repeated push
    /// for the same publisher updates rather than duplicates. The weak
    /// reference to the source connection serves renegotiation.
    down: HashMap<ConnId, (Arc<DownConnection>, Weak<UpConnection>)>,
    closed: bool,
}

/// A signaling-channel peer.
///
/// The transport layer feeds offers, answers and ICE candidates in, and
/// drains [`ClientEvent`]s from the channel returned by [`new`](Self::new).
pub struct SignalingClient {
    id: ClientId,
    addr: Option<SocketAddr>,
    engine: Arc<dyn Engine>,
    gather_timeout: Duration,
    events: mpsc::UnboundedSender<ClientEvent>,
    state: Mutex<SignalingState>,
}

impl SignalingClient {
    pub fn new(
        id: ClientId,
        addr: Option<SocketAddr>,
        engine: Arc<dyn Engine>,
        gather_timeout: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            id,
            addr,
            engine,
            gather_timeout,
            events: tx,
            state: Mutex::new(SignalingState {
                username: String::new(),
                permissions: PermissionSet::new(),
                data: HashMap::new(),
                group: None,
                up: HashMap::new(),
                down: HashMap::new(),
                closed: false,
            }),
        });
        (client, rx)
    }

    fn lock(&self) -> MutexGuard<'_, SignalingState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// Handle an SDP offer from this client: it is publishing.
    ///
    /// A fresh `id` creates an up connection and fans it out to the
    /// group; a known `id` renegotiates in place and is re-pushed so
    /// subscribers update their mirrored tracks. `replace` names a
    /// previous up connection this one supersedes; receivers swap.
    pub async fn got_offer(
        self: &Arc<Self>,
        id: ConnId,
        label: Option<String>,
        offer: &str,
        replace: Option<ConnId>,
        cancel: &CancelHandle,
    ) -> Result<SessionDescription> {
        let (group, existing, replaced) = {
            let mut state = self.lock();
            if state.closed {
                return Err(Error::Invalid("Client is closed".to_string()));
            }
            if !state.permissions.has(crate::models::Permission::Present) {
                return Err(Error::Forbidden("Not authorized to present".to_string()));
            }
            let group = state
                .group
                .clone()
                .ok_or_else(|| Error::Invalid("Not in a group".to_string()))?;
            let replaced = replace
                .as_ref()
                .filter(|old| **old != id)
                .and_then(|old| state.up.remove(old));
            (group, state.up.get(&id).cloned(), replaced)
        };

        if let Some(old) = &replaced {
            old.close().await;
        }

        let (up, answer) = match existing {
            Some(up) => {
                let answer = up.got_offer(offer, self.gather_timeout, cancel).await?;
                (up, answer)
            }
            None => {
                let (up, answer) = UpConnection::negotiate(
                    self.engine.as_ref(),
                    id.clone(),
                    label,
                    offer,
                    self.gather_timeout,
                    cancel,
                )
                .instrument(logging::conn_span(&self.id, &id))
                .await?;
                {
                    let mut state = self.lock();
                    if state.closed {
                        drop(state);
                        up.close().await;
                        return Err(Error::Invalid("Client is closed".to_string()));
                    }
                    state.up.insert(id.clone(), up.clone());
                }
                let conn = Arc::downgrade(&up);
                up.set_ice_state_handler(Some(Box::new(move |state| {
                    if let Some(conn) = conn.upgrade() {
                        if matches!(
                            state,
                            IceConnectionState::Connected | IceConnectionState::Completed
                        ) {
                            conn.mark_connected();
                        }
                    }
                })));
                (up, answer)
            }
        };

        let replace = replaced.map(|old| old.id().clone());
        group
            .push_conn_except(&self.id, &id, Some(up.clone()), up.tracks(), replace)
            .await;
        Ok(answer)
    }

    /// Handle the client's answer to a down connection offer.
    pub async fn got_answer(&self, id: &ConnId, sdp: &str) -> Result<()> {
        let down = {
            let state = self.lock();
            state
                .down
                .values()
                .find(|(d, _)| d.id() == id)
                .map(|(d, _)| d.clone())
                .ok_or_else(|| Error::NotFound("No such connection".to_string()))?
        };
        down.got_answer(sdp).await
    }

    /// Client-requested renegotiation of one of its down connections.
    pub async fn got_renegotiate(&self, id: &ConnId) -> Result<()> {
        let (down, up) = {
            let state = self.lock();
            state
                .down
                .values()
                .find(|(d, _)| d.id() == id)
                .map(|(d, up)| (d.clone(), up.clone()))
                .ok_or_else(|| Error::NotFound("No such connection".to_string()))?
        };
        let up = up
            .upgrade()
            .ok_or_else(|| Error::NotFound("Publisher has gone away".to_string()))?;
        let offer = down.update_tracks(&up).await?;
        self.emit(ClientEvent::Down {
            id: down.id().clone(),
            remote: down.remote_up().clone(),
            tracks: down.tracks(),
            replace: None,
            offer,
        });
        Ok(())
    }

    /// Trickle ICE from the client, for either direction.
    pub async fn got_ice_candidate(&self, id: &ConnId, candidate: IceCandidate) -> Result<()> {
        let (up, down) = {
            let state = self.lock();
            (
                state.up.get(id).cloned(),
                state
                    .down
                    .values()
                    .find(|(d, _)| d.id() == id)
                    .map(|(d, _)| d.clone()),
            )
        };
        if let Some(up) = up {
            return up.add_ice_candidate(candidate).await;
        }
        if let Some(down) = down {
            return down.add_ice_candidate(candidate).await;
        }
        Err(Error::NotFound("No such connection".to_string()))
    }

    /// Request a simulcast layer for all tracks of one of this client's
    /// down connections.
    pub fn request_layer(&self, id: &ConnId, layer: u8) -> Result<()> {
        let up = {
            let state = self.lock();
            state
                .down
                .values()
                .find(|(d, _)| d.id() == id)
                .map(|(_, up)| up.clone())
                .ok_or_else(|| Error::NotFound("No such connection".to_string()))?
        };
        let up = up
            .upgrade()
            .ok_or_else(|| Error::NotFound("Publisher has gone away".to_string()))?;
        for track in up.tracks() {
            track.request_layer(&self.id, layer);
        }
        Ok(())
    }

    /// Close one of this client's up connections and notify the group.
    pub async fn close_up(&self, id: &ConnId) -> Result<()> {
        let (group, up) = {
            let mut state = self.lock();
            (state.group.clone(), state.up.remove(id))
        };
        let Some(up) = up else {
            return Ok(());
        };
        up.close().await;
        if let Some(group) = group {
            group.push_conn_except(&self.id, id, None, Vec::new(), None).await;
        }
        Ok(())
    }

    /// Merge presence data; a null value deletes the key. The update is
    /// fanned out to the whole group.
    pub async fn set_data(&self, update: HashMap<String, serde_json::Value>) -> Result<()> {
        let group = {
            let mut state = self.lock();
            for (key, value) in update {
                if value.is_null() {
                    state.data.remove(&key);
                } else {
                    state.data.insert(key, value);
                }
            }
            state.group.clone()
        };
        if let Some(group) = group {
            group.push_client_update(&self.id, PresenceKind::Change).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Client for SignalingClient {
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
        self.lock().data.clone()
    }

    fn group(&self) -> Option<Arc<Group>> {
        self.lock().group.clone()
    }

    fn set_group(&self, group: Option<Arc<Group>>) {
        self.lock().group = group;
    }

    async fn joined(&self, group: Arc<Group>, kind: JoinKind) -> Result<()> {
        let permissions = self.permissions();
        self.emit(ClientEvent::Joined {
            group: group.name().to_string(),
            kind,
            permissions,
        });
        Ok(())
    }

    async fn push_conn(
        &self,
        group: &Arc<Group>,
        id: &ConnId,
        up: Option<Arc<UpConnection>>,
        _tracks: Vec<Arc<UpTrack>>,
        replace: Option<ConnId>,
    ) -> Result<()> {
        {
            let state = self.lock();
            if state.closed {
                return Ok(());
            }
            match &state.group {
                Some(own) if Arc::ptr_eq(own, group) => {}
                _ => return Ok(()),
            }
        }

        let Some(up) = up else {
            // the publisher went away
            let down = self.lock().down.remove(id);
            if let Some((down, _)) = down {
                down.close().await;
                self.emit(ClientEvent::DownGone {
                    id: down.id().clone(),
                    remote: id.clone(),
                });
            }
            return Ok(());
        };

        if let Some(replaced) = &replace {
            let down = self.lock().down.remove(replaced);
            if let Some((down, _)) = down {
                down.close().await;
            }
        }

        let existing = self.lock().down.get(id).map(|(d, _)| d.clone());
        if let Some(down) = existing {
            // repeated push for the same publisher updates in place
            let offer = down.update_tracks(&up).await?;
            self.emit(ClientEvent::Down {
                id: down.id().clone(),
                remote: id.clone(),
                tracks: down.tracks(),
                replace,
                offer,
            });
            return Ok(());
        }

        let (down, offer) = DownConnection::negotiate(self.engine.as_ref(), &up).await?;
        let closed = self.lock().closed;
        if closed {
            down.close().await;
            return Ok(());
        }
        {
            let mut state = self.lock();
            state
                .down
                .insert(id.clone(), (down.clone(), Arc::downgrade(&up)));
        }
        let conn = Arc::downgrade(&down);
        down.set_ice_state_handler(Some(Box::new(move |state| {
            if let Some(conn) = conn.upgrade() {
                if matches!(
                    state,
                    IceConnectionState::Connected | IceConnectionState::Completed
                ) {
                    conn.mark_connected();
                }
            }
        })));
        self.emit(ClientEvent::Down {
            id: down.id().clone(),
            remote: id.clone(),
            tracks: down.tracks(),
            replace,
            offer,
        });
        Ok(())
    }

    async fn push_client(&self, _group: &str, event: PresenceEvent) -> Result<()> {
        if self.lock().closed {
            return Ok(());
        }
        self.emit(ClientEvent::Presence(event));
        Ok(())
    }

    async fn push_message(&self, _group: &str, entry: &ChatEntry) -> Result<()> {
        if self.lock().closed {
            return Ok(());
        }
        self.emit(ClientEvent::Message(entry.clone()));
        Ok(())
    }

    async fn request_conns(&self, target: Arc<dyn Client>, group: &Arc<Group>) -> Result<()> {
        let ups: Vec<Arc<UpConnection>> = {
            let state = self.lock();
            match &state.group {
                Some(own) if Arc::ptr_eq(own, group) => state.up.values().cloned().collect(),
                _ => return Ok(()),
            }
        };
        for up in ups {
            target
                .push_conn(group, up.id(), Some(up.clone()), up.tracks(), None)
                .await?;
        }
        Ok(())
    }

    async fn kick(
        &self,
        _by_id: Option<ClientId>,
        by_username: Option<String>,
        message: String,
    ) -> Result<()> {
        self.emit(ClientEvent::Kicked {
            by: by_username,
            message,
        });
        self.close().await
    }

    async fn close(&self) -> Result<()> {
        let (group, ups, downs) = {
            let mut state = self.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            (
                state.group.take(),
                std::mem::take(&mut state.up),
                std::mem::take(&mut state.down),
            )
        };

        for (id, up) in ups {
            up.close().await;
            if let Some(group) = &group {
                group.push_conn_except(&self.id, &id, None, Vec::new(), None).await;
            }
        }
        for (down, up) in downs.into_values() {
            down.close().await;
            if let Some(up) = up.upgrade() {
                for track in up.tracks() {
                    track.forget_subscriber(&self.id);
                }
            }
        }
        if let Some(group) = group {
            group.del_client(&self.id).await;
        }
        debug!(client = %self.id, "Closed client");
        Ok(())
    }
}

/// A recording participant. Near-stub: it accepts pushed connections
/// and hands them to the recording delegate, which lives outside the
/// core.
pub struct Recorder {
    id: ClientId,
    state: Mutex<RecorderState>,
}

struct RecorderState {
    username: String,
    permissions: PermissionSet,
    group: Option<Arc<Group>>,
    conns: HashMap<ConnId, Vec<TrackInfo>>,
    closed: bool,
}

impl Recorder {
    #[must_use]
    pub fn new(id: ClientId) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(RecorderState {
                username: "RECORDING".to_string(),
                permissions: PermissionSet::new(),
                group: None,
                conns: HashMap::new(),
                closed: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// The publishers currently being recorded
    #[must_use]
    pub fn recorded_conns(&self) -> HashMap<ConnId, Vec<TrackInfo>> {
        self.lock().conns.clone()
    }
}

#[async_trait]
impl Client for Recorder {
    fn id(&self) -> &ClientId {
        &self.id
    }

    fn addr(&self) -> Option<SocketAddr> {
        None
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
        id: &ConnId,
        up: Option<Arc<UpConnection>>,
        _tracks: Vec<Arc<UpTrack>>,
        replace: Option<ConnId>,
    ) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Ok(());
        }
        if let Some(replaced) = replace {
            state.conns.remove(&replaced);
        }
        match up {
            Some(up) => {
                state.conns.insert(id.clone(), up.track_infos());
            }
            None => {
                state.conns.remove(id);
            }
        }
        Ok(())
    }

    async fn push_client(&self, _group: &str, _event: PresenceEvent) -> Result<()> {
        Ok(())
    }

    async fn push_message(&self, _group: &str, _entry: &ChatEntry) -> Result<()> {
        Ok(())
    }

    async fn request_conns(&self, _target: Arc<dyn Client>, _group: &Arc<Group>) -> Result<()> {
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
        let group = {
            let mut state = self.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.conns.clear();
            state.group.take()
        };
        if let Some(group) = group {
            group.del_client(&self.id).await;
        }
        Ok(())
    }
}
