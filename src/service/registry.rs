//! Group registry and membership
//!
//! The process-wide map of live groups. A group materializes on the
//! first successful join and is torn down once it has been empty for a
//! grace period. The group lock protects the client map, the runtime
//! lock flag, the chat history and the description pointer; callbacks
//! into clients are made with the lock released, iterating a snapshot
//! captured under it.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn, Instrument};

use crate::config::GroupsConfig;
use crate::logging;
use crate::models::{ChatEntry, ClientId, ConnId, GroupDescription, Permission, PermissionSet};
use crate::service::auth::{Authenticator, Credential};
use crate::service::client::{Client, JoinKind, PresenceEvent, PresenceKind};
use crate::service::connection::{UpConnection, UpTrack};
use crate::service::descriptions::DescriptionStore;
use crate::{Error, Result};

/// One live group
pub struct Group {
    name: String,
    registry: Weak<Groups>,
    state: Mutex<GroupState>,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group").field("name", &self.name).finish()
    }
}

struct GroupState {
    desc: Arc<GroupDescription>,
    clients: HashMap<ClientId, Arc<dyn Client>>,
    /// Runtime lock, in addition to the description's `locked` field
    locked: Option<String>,
    history: VecDeque<ChatEntry>,
    /// Bumped on every membership or permission change
    version: u64,
    created_at: DateTime<Utc>,
    empty_since: Option<Instant>,
}

impl Group {
    fn new(name: &str, desc: Arc<GroupDescription>, registry: Weak<Groups>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            registry,
            state: Mutex::new(GroupState {
                desc,
                clients: HashMap::new(),
                locked: None,
                history: VecDeque::new(),
                version: 0,
                created_at: Utc::now(),
                empty_since: Some(Instant::now()),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn description(&self) -> Arc<GroupDescription> {
        self.lock().desc.clone()
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.lock().created_at
    }

    /// Monotonic counter, bumped on membership and permission changes
    #[must_use]
    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// Snapshot of the member list, optionally excluding one client
    #[must_use]
    pub fn clients(&self, except: Option<&ClientId>) -> Vec<Arc<dyn Client>> {
        self.lock()
            .clients
            .iter()
            .filter(|(id, _)| except != Some(*id))
            .map(|(_, c)| c.clone())
            .collect()
    }

    #[must_use]
    pub fn client(&self, id: &ClientId) -> Option<Arc<dyn Client>> {
        self.lock().clients.get(id).cloned()
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    /// The runtime lock state and its message, if any
    #[must_use]
    pub fn locked(&self) -> Option<String> {
        let state = self.lock();
        if let Some(message) = &state.locked {
            return Some(message.clone());
        }
        state
            .desc
            .locked
            .as_ref()
            .filter(|l| l.is_locked())
            .map(|l| l.message().unwrap_or("Group is locked").to_string())
    }

    /// Lock or unlock the group at runtime. Enforcing that only
    /// operators call this is the signaling layer's job.
    pub fn set_locked(&self, locked: Option<String>) {
        self.lock().locked = locked;
    }

    /// Remove a client from the group. Idempotent: removing an unknown
    /// id is a no-op. Returns whether a client was removed.
    pub async fn del_client(self: &Arc<Self>, id: &ClientId) -> bool {
        let (removed, peers, kicked) = {
            let mut state = self.lock();
            let Some(removed) = state.clients.remove(id) else {
                return false;
            };
            removed.set_group(None);
            state.version += 1;

            let had_op = removed.permissions().has(Permission::Op);
            let ops_remain = state
                .clients
                .values()
                .any(|c| c.permissions().has(Permission::Op));

            let mut kicked: Vec<Arc<dyn Client>> = Vec::new();
            if had_op && !ops_remain && !state.clients.is_empty() {
                if state.desc.auto_lock && state.locked.is_none() {
                    info!(group = %self.name, "Last operator left, locking group");
                    state.locked = Some("Group is locked".to_string());
                }
                if let Some(count) = state.desc.auto_kick_count {
                    if state.clients.len() > count {
                        kicked = state.clients.values().cloned().collect();
                    }
                }
            }

            if state.desc.announce_joins {
                let entry = ChatEntry::new(
                    Some(id.clone()),
                    Some(removed.username()),
                    "leave",
                    serde_json::Value::Null,
                );
                push_history(&mut state, entry);
            }

            if state.clients.is_empty() {
                state.empty_since = Some(Instant::now());
            }
            let peers: Vec<Arc<dyn Client>> = state.clients.values().cloned().collect();
            (removed, peers, kicked)
        };

        let span = logging::client_span(&self.name, id);
        if let Err(e) = removed
            .joined(self.clone(), JoinKind::Leave)
            .instrument(span.clone())
            .await
        {
            debug!(client = %id, "Leave callback failed: {e}");
        }
        span.in_scope(|| debug!("Client left"));
        let event = PresenceEvent {
            kind: PresenceKind::Delete,
            id: id.clone(),
            username: removed.username(),
            permissions: PermissionSet::new(),
            data: HashMap::new(),
        };
        for peer in &peers {
            if let Err(e) = peer.push_client(&self.name, event.clone()).await {
                debug!(client = %peer.id(), "Presence push failed: {e}");
            }
        }

        for client in kicked {
            info!(group = %self.name, client = %client.id(), "Kicking client, no operator left");
            if let Err(e) = client
                .kick(None, None, "No operator present".to_string())
                .await
            {
                warn!(client = %client.id(), "Kick failed: {e}");
            }
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.expire_groups();
        }
        true
    }

    /// Fan one up connection out to every member except its owner.
    ///
    /// `up` empty announces that the publisher is gone; `replace` names
    /// a connection the pushed one supersedes.
    pub async fn push_conn_except(
        self: &Arc<Self>,
        except: &ClientId,
        id: &ConnId,
        up: Option<Arc<UpConnection>>,
        tracks: Vec<Arc<UpTrack>>,
        replace: Option<ConnId>,
    ) {
        for peer in self.clients(Some(except)) {
            let span = logging::conn_span(peer.id(), id);
            if let Err(e) = peer
                .push_conn(self, id, up.clone(), tracks.clone(), replace.clone())
                .instrument(span)
                .await
            {
                debug!(group = %self.name, client = %peer.id(), conn = %id,
                       "Connection push failed: {e}");
            }
        }
    }

    /// Fan a presence update about `id` out to every member.
    pub async fn push_client_update(self: &Arc<Self>, id: &ClientId, kind: PresenceKind) {
        let (about, peers) = {
            let mut state = self.lock();
            let Some(about) = state.clients.get(id).cloned() else {
                return;
            };
            state.version += 1;
            (about, state.clients.values().cloned().collect::<Vec<_>>())
        };
        let event = PresenceEvent {
            kind,
            id: id.clone(),
            username: about.username(),
            permissions: about.permissions(),
            data: about.data(),
        };
        for peer in peers {
            if let Err(e) = peer.push_client(&self.name, event.clone()).await {
                debug!(client = %peer.id(), "Presence push failed: {e}");
            }
        }
    }

    /// Deliver a message to every member without touching the history.
    pub async fn broadcast(&self, entry: &ChatEntry) {
        for peer in self.clients(None) {
            if let Err(e) = peer.push_message(&self.name, entry).await {
                debug!(client = %peer.id(), "Message push failed: {e}");
            }
        }
    }

    /// Append to the chat history ring and deliver to all members.
    pub async fn add_chat_message(&self, entry: ChatEntry) {
        {
            let mut state = self.lock();
            push_history(&mut state, entry.clone());
        }
        self.broadcast(&entry).await;
    }

    #[must_use]
    pub fn chat_history(&self) -> Vec<ChatEntry> {
        let mut state = self.lock();
        evict_history(&mut state);
        state.history.iter().cloned().collect()
    }

    pub fn clear_chat_history(&self) {
        self.lock().history.clear();
    }

    /// Best-effort kick: notifies and closes the target. Permission
    /// checks are the caller's responsibility.
    pub async fn kick(
        &self,
        by_id: Option<ClientId>,
        by_username: Option<String>,
        target: &ClientId,
        message: &str,
    ) -> Result<()> {
        let client = self
            .client(target)
            .ok_or_else(|| Error::NotFound(format!("No such client: {target}")))?;
        client.kick(by_id, by_username, message.to_string()).await
    }

    /// Change a member's permissions (op/unop, present/unpresent) and
    /// fan the change out.
    pub async fn set_client_permissions(
        self: &Arc<Self>,
        id: &ClientId,
        permissions: PermissionSet,
    ) -> Result<()> {
        let client = self
            .client(id)
            .ok_or_else(|| Error::NotFound(format!("No such client: {id}")))?;
        client.set_permissions(permissions);
        if let Err(e) = client.joined(self.clone(), JoinKind::Change).await {
            debug!(client = %id, "Change callback failed: {e}");
        }
        self.push_client_update(id, PresenceKind::Change).await;
        Ok(())
    }
}

fn push_history(state: &mut GroupState, entry: ChatEntry) {
    state.history.push_back(entry);
    evict_history(state);
}

/// Ring eviction by count and by age
fn evict_history(state: &mut GroupState) {
    let size = state
        .desc
        .chat_history_size
        .unwrap_or(GroupsConfig::default().default_chat_history);
    while state.history.len() > size {
        state.history.pop_front();
    }
    if let Some(max_age) = state.desc.max_history_age {
        let cutoff = Utc::now() - chrono::Duration::seconds(max_age as i64);
        while state
            .history
            .front()
            .is_some_and(|entry| entry.time < cutoff)
        {
            state.history.pop_front();
        }
    }
}

/// The process-wide group registry.
///
/// Initialize one explicitly at startup; [`shutdown`](Self::shutdown)
/// closes every client and flushes state.
pub struct Groups {
    descriptions: Arc<DescriptionStore>,
    authenticator: Arc<Authenticator>,
    config: GroupsConfig,
    groups: Mutex<HashMap<String, Arc<Group>>>,
}

impl Groups {
    #[must_use]
    pub fn new(
        descriptions: Arc<DescriptionStore>,
        authenticator: Arc<Authenticator>,
        config: GroupsConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            descriptions,
            authenticator,
            config,
            groups: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Group>>> {
        self.groups.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// A live group, if any
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Group>> {
        self.lock().get(name).cloned()
    }

    /// Authenticate and install a client into a group.
    ///
    /// On success the client is visible to all members, has received its
    /// `joined` callback, and has been brought up to date with current
    /// publishers.
    pub async fn add_client(
        self: &Arc<Self>,
        group_name: &str,
        client: Arc<dyn Client>,
        credential: &Credential,
    ) -> Result<(Arc<Group>, PermissionSet)> {
        let requested = client.username();
        let requested = if requested.is_empty() {
            None
        } else {
            Some(requested)
        };
        let (username, permissions) = self
            .authenticator
            .authenticate(group_name, requested.as_deref(), credential)
            .await?;

        let group = self.get_or_create(group_name)?;

        let peers = {
            let mut state = group.lock();

            let locked = if let Some(message) = &state.locked {
                Some(message.clone())
            } else if state.desc.is_locked() {
                Some(
                    state
                        .desc
                        .locked
                        .as_ref()
                        .and_then(|l| l.message())
                        .unwrap_or("Group is locked")
                        .to_string(),
                )
            } else {
                None
            };
            if let Some(message) = locked {
                if !permissions.has(Permission::Op) {
                    return Err(Error::Forbidden(message));
                }
            }

            if let Some(max) = state.desc.max_clients {
                if state.clients.len() >= max {
                    return Err(Error::Unavailable("Group is full".to_string()));
                }
            }

            if !permissions.has(Permission::Op) {
                let ops_present = state
                    .clients
                    .values()
                    .any(|c| c.permissions().has(Permission::Op));
                if !ops_present {
                    if let Some(count) = state.desc.auto_kick_count {
                        if state.clients.len() >= count {
                            return Err(Error::Unavailable(
                                "Group has no operator".to_string(),
                            ));
                        }
                    }
                }
            }

            if state.clients.contains_key(client.id()) {
                return Err(Error::Conflict("Duplicate client id".to_string()));
            }

            client.set_username(username.clone());
            client.set_permissions(permissions.clone());
            client.set_group(Some(group.clone()));
            state.clients.insert(client.id().clone(), client.clone());
            state.version += 1;
            state.empty_since = None;

            if state.desc.announce_joins {
                let entry = ChatEntry::new(
                    Some(client.id().clone()),
                    Some(username.clone()),
                    "join",
                    serde_json::Value::Null,
                );
                push_history(&mut state, entry);
            }

            state
                .clients
                .values()
                .filter(|c| c.id() != client.id())
                .cloned()
                .collect::<Vec<_>>()
        };

        let span = logging::client_span(group_name, client.id());
        if let Err(e) = client
            .joined(group.clone(), JoinKind::Join)
            .instrument(span.clone())
            .await
        {
            warn!(client = %client.id(), "Join callback failed: {e}");
            group.del_client(client.id()).await;
            return Err(e);
        }
        span.in_scope(|| info!(username = %username, "Client joined"));

        // tell the newcomer about the room, and the room about the newcomer
        let event = PresenceEvent {
            kind: PresenceKind::Add,
            id: client.id().clone(),
            username: client.username(),
            permissions: permissions.clone(),
            data: client.data(),
        };
        for peer in &peers {
            if let Err(e) = peer.push_client(group_name, event.clone()).await {
                debug!(client = %peer.id(), "Presence push failed: {e}");
            }
            let peer_event = PresenceEvent {
                kind: PresenceKind::Add,
                id: peer.id().clone(),
                username: peer.username(),
                permissions: peer.permissions(),
                data: peer.data(),
            };
            if let Err(e) = client.push_client(group_name, peer_event).await {
                debug!(client = %client.id(), "Presence push failed: {e}");
            }
        }

        // bring the newcomer up to date with current publishers
        for peer in &peers {
            if let Err(e) = peer.request_conns(client.clone(), &group).await {
                debug!(client = %peer.id(), "Connection replay failed: {e}");
            }
        }

        Ok((group, permissions))
    }

    /// Remove a client from whatever group it is in.
    pub async fn del_client(&self, client: &Arc<dyn Client>) -> bool {
        match client.group() {
            Some(group) => group.del_client(client.id()).await,
            None => false,
        }
    }

    fn get_or_create(self: &Arc<Self>, name: &str) -> Result<Arc<Group>> {
        // always consult the store so an edited description file is
        // picked up on the next join
        let desc = self.descriptions.get(name)?;
        let mut groups = self.lock();
        if let Some(group) = groups.get(name) {
            let mut state = group.lock();
            if !Arc::ptr_eq(&state.desc, &desc) {
                debug!(group = %name, "Group description changed, reloading");
                state.desc = desc;
            }
            return Ok(group.clone());
        }
        let group = Group::new(name, desc, Arc::downgrade(self));
        groups.insert(name.to_string(), group.clone());
        info!(group = %name, "Created group");
        Ok(group)
    }

    /// Tear down groups that have been empty past the grace period, and
    /// groups whose description file is gone. Best-effort; a failed
    /// teardown is retried on the next leave.
    pub fn expire_groups(&self) {
        let grace = Duration::from_secs(self.config.empty_grace_seconds);
        let mut groups = self.lock();
        groups.retain(|name, group| {
            let state = group.lock();
            if !state.clients.is_empty() {
                return true;
            }
            let expired = state
                .empty_since
                .is_some_and(|since| since.elapsed() >= grace);
            let vanished = matches!(self.descriptions.get(name), Err(Error::NotFound(_)));
            if expired || vanished {
                logging::group_span(name).in_scope(|| debug!("Tearing down empty group"));
                return false;
            }
            true
        });
    }

    /// Names and display names of the public groups, with client counts
    #[must_use]
    pub fn public_groups(&self) -> Vec<(String, String, usize)> {
        let groups: Vec<Arc<Group>> = self.lock().values().cloned().collect();
        let mut public = Vec::new();
        for group in groups {
            let state = group.lock();
            if state.desc.public {
                let display = state
                    .desc
                    .display_name
                    .clone()
                    .unwrap_or_else(|| group.name.clone());
                public.push((group.name.clone(), display, state.clients.len()));
            }
        }
        public.sort();
        public
    }

    /// Close every client in every group.
    pub async fn shutdown(&self) {
        let groups: Vec<Arc<Group>> = self.lock().values().cloned().collect();
        for group in &groups {
            for client in group.clients(None) {
                if let Err(e) = client.close().await {
                    warn!(client = %client.id(), "Close failed during shutdown: {e}");
                }
            }
        }
        self.lock().clear();
    }
}
