//! End-to-end tests of the group, client and connection machinery,
//! driven through the public API with the mock engine.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::UnboundedReceiver;

use galene_core::config::GroupsConfig;
use galene_core::models::{ClientId, ConnId, StatefulToken};
use galene_core::service::{
    Authenticator, CancelHandle, Client, ClientEvent, Credential, DescriptionStore, Groups,
    IceConnectionState, JoinKind, SignalingClient, TokenStore, WhipClient,
};
use galene_core::test_helpers::{audio_video_offer, MockEngine};

const GATHER_TIMEOUT: Duration = Duration::from_secs(1);

fn setup_groups(dir: &Path, group_json: &str, config: GroupsConfig) -> Arc<Groups> {
    fs::create_dir_all(dir.join("groups")).unwrap();
    fs::write(dir.join("groups/conf.json"), group_json).unwrap();
    let descriptions = Arc::new(DescriptionStore::new(dir.join("groups")));
    let tokens = Arc::new(TokenStore::new(dir.join("tokens.jsonl")));
    let authenticator = Arc::new(Authenticator::new(descriptions.clone(), tokens));
    Groups::new(descriptions, authenticator, config)
}

fn presenter_group() -> &'static str {
    r#"{"wildcard-user": {"password": {"type": "wildcard"}, "permissions": "presenter"}}"#
}

fn new_client(
    id: &str,
    username: &str,
    engine: &Arc<MockEngine>,
) -> (Arc<SignalingClient>, UnboundedReceiver<ClientEvent>) {
    let engine: Arc<dyn galene_core::service::Engine> = engine.clone();
    let (client, events) = SignalingClient::new(ClientId::from(id), None, engine, GATHER_TIMEOUT);
    client.set_username(username.to_string());
    (client, events)
}

fn drain(events: &mut UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

fn down_conns(events: &[ClientEvent]) -> Vec<ConnId> {
    events
        .iter()
        .filter_map(|e| match e {
            ClientEvent::Down { remote, .. } => Some(remote.clone()),
            _ => None,
        })
        .collect()
}

fn gone_conns(events: &[ClientEvent]) -> Vec<ConnId> {
    events
        .iter()
        .filter_map(|e| match e {
            ClientEvent::DownGone { remote, .. } => Some(remote.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_fan_out_on_join_and_close() {
    let dir = tempfile::tempdir().unwrap();
    let groups = setup_groups(dir.path(), presenter_group(), GroupsConfig::default());
    let engine = Arc::new(MockEngine::new());
    let credential = Credential::Password("anything".to_string());

    // the publisher joins an empty group: nothing to fan out
    let (publisher, mut publisher_events) = new_client("p", "paula", &engine);
    let publisher_dyn: Arc<dyn Client> = publisher.clone();
    groups
        .add_client("conf", publisher_dyn, &credential)
        .await
        .unwrap();
    let cancel = CancelHandle::new();
    let up_id = ConnId::from("p-cam");
    publisher
        .got_offer(up_id.clone(), Some("camera".to_string()), &audio_video_offer(), None, &cancel)
        .await
        .unwrap();
    assert!(down_conns(&drain(&mut publisher_events)).is_empty());

    // a subscriber joins and receives the existing publisher
    let (sub1, mut sub1_events) = new_client("s1", "sam", &engine);
    let sub1_dyn: Arc<dyn Client> = sub1.clone();
    groups.add_client("conf", sub1_dyn, &credential).await.unwrap();
    let events = drain(&mut sub1_events);
    assert_eq!(down_conns(&events), vec![up_id.clone()]);
    assert!(events
        .iter()
        .any(|e| matches!(e, ClientEvent::Joined { kind: JoinKind::Join, .. })));

    // a second subscriber receives it too
    let (sub2, mut sub2_events) = new_client("s2", "tessa", &engine);
    let sub2_dyn: Arc<dyn Client> = sub2.clone();
    groups.add_client("conf", sub2_dyn, &credential).await.unwrap();
    assert_eq!(down_conns(&drain(&mut sub2_events)), vec![up_id.clone()]);

    // no duplicate down for the same publisher
    assert!(down_conns(&drain(&mut sub1_events)).is_empty());

    // the publisher closes: both subscribers see the stream go away
    publisher.close().await.unwrap();
    assert_eq!(gone_conns(&drain(&mut sub1_events)), vec![up_id.clone()]);
    assert_eq!(gone_conns(&drain(&mut sub2_events)), vec![up_id.clone()]);

    let group = groups.get("conf").unwrap();
    assert_eq!(group.client_count(), 2);
}

#[tokio::test]
async fn test_late_publisher_fans_out() {
    let dir = tempfile::tempdir().unwrap();
    let groups = setup_groups(dir.path(), presenter_group(), GroupsConfig::default());
    let engine = Arc::new(MockEngine::new());
    let credential = Credential::Password("x".to_string());

    let (sub, mut sub_events) = new_client("s", "sam", &engine);
    let sub_dyn: Arc<dyn Client> = sub.clone();
    groups.add_client("conf", sub_dyn, &credential).await.unwrap();

    let (publisher, _publisher_events) = new_client("p", "paula", &engine);
    let publisher_dyn: Arc<dyn Client> = publisher.clone();
    groups.add_client("conf", publisher_dyn, &credential).await.unwrap();
    drain(&mut sub_events);

    let cancel = CancelHandle::new();
    publisher
        .got_offer(ConnId::from("p-cam"), None, &audio_video_offer(), None, &cancel)
        .await
        .unwrap();
    assert_eq!(down_conns(&drain(&mut sub_events)), vec![ConnId::from("p-cam")]);
}

#[tokio::test]
async fn test_kick_notifies_and_removes() {
    let dir = tempfile::tempdir().unwrap();
    let groups = setup_groups(dir.path(), presenter_group(), GroupsConfig::default());
    let engine = Arc::new(MockEngine::new());
    let credential = Credential::Password("x".to_string());

    let (victim, mut victim_events) = new_client("v", "vic", &engine);
    let victim_dyn: Arc<dyn Client> = victim.clone();
    let (group, _) = groups.add_client("conf", victim_dyn, &credential).await.unwrap();

    group
        .kick(None, Some("op".to_string()), victim.id(), "begone")
        .await
        .unwrap();

    let events = drain(&mut victim_events);
    assert!(events.iter().any(|e| matches!(
        e,
        ClientEvent::Kicked { by: Some(by), message } if by == "op" && message == "begone"
    )));
    assert_eq!(group.client_count(), 0);
    assert!(victim.group().is_none());

    // closing again is a no-op
    victim.close().await.unwrap();
}

#[tokio::test]
async fn test_group_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let json = r#"{"max-clients": 1,
                   "wildcard-user": {"password": {"type": "wildcard"}, "permissions": "presenter"}}"#;
    let groups = setup_groups(dir.path(), json, GroupsConfig::default());
    let engine = Arc::new(MockEngine::new());
    let credential = Credential::Password("x".to_string());

    let (first, _e1) = new_client("a", "alice", &engine);
    let first_dyn: Arc<dyn Client> = first.clone();
    groups.add_client("conf", first_dyn, &credential).await.unwrap();

    let (second, _e2) = new_client("b", "bob", &engine);
    let second_dyn: Arc<dyn Client> = second.clone();
    let err = groups.add_client("conf", second_dyn, &credential).await.unwrap_err();
    assert!(matches!(err, galene_core::Error::Unavailable(_)));
}

#[tokio::test]
async fn test_auto_lock_when_last_op_leaves() {
    let dir = tempfile::tempdir().unwrap();
    let json = r#"{"auto-lock": true,
                   "users": {"admin": {"password": "adminpw", "permissions": "op"}},
                   "wildcard-user": {"password": {"type": "wildcard"}, "permissions": "observer"}}"#;
    let groups = setup_groups(dir.path(), json, GroupsConfig::default());
    let engine = Arc::new(MockEngine::new());

    let (op, _op_events) = new_client("op", "admin", &engine);
    let op_dyn: Arc<dyn Client> = op.clone();
    groups
        .add_client("conf", op_dyn, &Credential::Password("adminpw".to_string()))
        .await
        .unwrap();

    let (watcher, _w_events) = new_client("w", "wanda", &engine);
    let watcher_dyn: Arc<dyn Client> = watcher.clone();
    groups
        .add_client("conf", watcher_dyn, &Credential::Password("x".to_string()))
        .await
        .unwrap();

    op.close().await.unwrap();

    let group = groups.get("conf").unwrap();
    assert!(group.locked().is_some());

    // a non-op is now refused
    let (late, _l_events) = new_client("l", "late", &engine);
    let late_dyn: Arc<dyn Client> = late.clone();
    let err = groups
        .add_client("conf", late_dyn, &Credential::Password("x".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, galene_core::Error::Forbidden(_)));

    // but an operator still gets in
    let (op2, _o2_events) = new_client("op2", "admin", &engine);
    let op2_dyn: Arc<dyn Client> = op2.clone();
    groups
        .add_client("conf", op2_dyn, &Credential::Password("adminpw".to_string()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_empty_group_teardown() {
    let dir = tempfile::tempdir().unwrap();
    let config = GroupsConfig {
        empty_grace_seconds: 0,
        ..Default::default()
    };
    let groups = setup_groups(dir.path(), presenter_group(), config);
    let engine = Arc::new(MockEngine::new());
    let credential = Credential::Password("x".to_string());

    let (client, _events) = new_client("c", "carol", &engine);
    let client_dyn: Arc<dyn Client> = client.clone();
    groups.add_client("conf", client_dyn, &credential).await.unwrap();
    assert!(groups.get("conf").is_some());

    client.close().await.unwrap();
    assert!(groups.get("conf").is_none());

    // re-joining materializes the group again
    let (client2, _events2) = new_client("c2", "carol", &engine);
    let client2_dyn: Arc<dyn Client> = client2.clone();
    groups.add_client("conf", client2_dyn, &credential).await.unwrap();
    assert!(groups.get("conf").is_some());
}

#[tokio::test]
async fn test_chat_history_ring() {
    let dir = tempfile::tempdir().unwrap();
    let json = r#"{"chat-history-size": 3,
                   "wildcard-user": {"password": {"type": "wildcard"}, "permissions": "presenter"}}"#;
    let groups = setup_groups(dir.path(), json, GroupsConfig::default());
    let engine = Arc::new(MockEngine::new());
    let credential = Credential::Password("x".to_string());

    let (client, mut events) = new_client("c", "carol", &engine);
    let client_dyn: Arc<dyn Client> = client.clone();
    let (group, _) = groups.add_client("conf", client_dyn, &credential).await.unwrap();

    for i in 0..5 {
        let entry = galene_core::models::ChatEntry::new(
            Some(client.id().clone()),
            Some("carol".to_string()),
            "",
            serde_json::json!(format!("message {i}")),
        );
        group.add_chat_message(entry).await;
    }

    let history = group.chat_history();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].value, serde_json::json!("message 2"));

    // every message was also delivered
    let delivered = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, ClientEvent::Message(_)))
        .count();
    assert_eq!(delivered, 5);

    group.clear_chat_history();
    assert!(group.chat_history().is_empty());
}

#[tokio::test]
async fn test_whip_publisher() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("groups")).unwrap();
    fs::write(dir.path().join("groups/conf.json"), "{}").unwrap();
    let engine = Arc::new(MockEngine::new());

    // WHIP authenticates with a stateful token
    let descriptions = Arc::new(DescriptionStore::new(dir.path().join("groups")));
    let tokens = Arc::new(TokenStore::new(dir.path().join("tokens.jsonl")));
    let authenticator = Arc::new(Authenticator::new(descriptions.clone(), tokens.clone()));
    let groups = Groups::new(descriptions, authenticator, GroupsConfig::default());

    let token = StatefulToken {
        token: StatefulToken::new_value(),
        group: "conf".to_string(),
        include_subgroups: false,
        username: Some("cam".to_string()),
        permissions: vec!["present".to_string()],
        expires: Some((Utc::now() + chrono::Duration::hours(1)).fixed_offset()),
        not_before: None,
        issued_by: None,
        issued_at: None,
    };
    tokens.update(&token, "").unwrap();

    let engine_dyn: Arc<dyn galene_core::service::Engine> = engine.clone();
    let whip = WhipClient::new(
        ClientId::from("whip-1"),
        token.token.clone(),
        None,
        engine_dyn,
        GATHER_TIMEOUT,
    );
    let whip_dyn: Arc<dyn Client> = whip.clone();
    groups
        .add_client("conf", whip_dyn, &Credential::Token(token.token.clone()))
        .await
        .unwrap();
    assert_eq!(whip.username(), "cam");

    let cancel = CancelHandle::new();
    whip.new_connection(&audio_video_offer(), &cancel).await.unwrap();

    // a second connection on the same session is refused
    let err = whip
        .new_connection(&audio_video_offer(), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    // a subscriber sees the WHIP publisher
    let (sub, mut sub_events) = new_client("s", "sam", &engine);
    sub.set_username(String::new());
    let sub_dyn: Arc<dyn Client> = sub.clone();
    let sub_token = StatefulToken {
        token: StatefulToken::new_value(),
        group: "conf".to_string(),
        include_subgroups: false,
        username: Some("sam".to_string()),
        permissions: vec!["message".to_string()],
        expires: Some((Utc::now() + chrono::Duration::hours(1)).fixed_offset()),
        not_before: None,
        issued_by: None,
        issued_at: None,
    };
    tokens.update(&sub_token, "").unwrap();
    groups
        .add_client("conf", sub_dyn, &Credential::Token(sub_token.token.clone()))
        .await
        .unwrap();
    assert_eq!(
        down_conns(&drain(&mut sub_events)),
        vec![ConnId::from("whip-1")]
    );

    // ICE failure tears the whole session down
    let pcs = engine.connections();
    pcs[0].fire_ice_state(IceConnectionState::Failed);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(whip.group().is_none());
    assert_eq!(
        gone_conns(&drain(&mut sub_events)),
        vec![ConnId::from("whip-1")]
    );
}

#[tokio::test]
async fn test_permission_change_fans_out() {
    let dir = tempfile::tempdir().unwrap();
    let groups = setup_groups(dir.path(), presenter_group(), GroupsConfig::default());
    let engine = Arc::new(MockEngine::new());
    let credential = Credential::Password("x".to_string());

    let (client, mut events) = new_client("c", "carol", &engine);
    let client_dyn: Arc<dyn Client> = client.clone();
    let (group, _) = groups.add_client("conf", client_dyn, &credential).await.unwrap();
    drain(&mut events);

    let op_set = galene_core::models::permission::preset("op").unwrap();
    group
        .set_client_permissions(client.id(), op_set.clone())
        .await
        .unwrap();

    assert_eq!(client.permissions(), op_set);
    let events = drain(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, ClientEvent::Joined { kind: JoinKind::Change, .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        ClientEvent::Presence(p) if p.permissions == op_set
    )));
}

#[tokio::test]
async fn test_down_answer_and_renegotiate() {
    let dir = tempfile::tempdir().unwrap();
    let groups = setup_groups(dir.path(), presenter_group(), GroupsConfig::default());
    let engine = Arc::new(MockEngine::new());
    let credential = Credential::Password("x".to_string());

    let (publisher, _p_events) = new_client("p", "paula", &engine);
    let publisher_dyn: Arc<dyn Client> = publisher.clone();
    groups.add_client("conf", publisher_dyn, &credential).await.unwrap();

    let (sub, mut sub_events) = new_client("s", "sam", &engine);
    let sub_dyn: Arc<dyn Client> = sub.clone();
    groups.add_client("conf", sub_dyn, &credential).await.unwrap();

    let cancel = CancelHandle::new();
    publisher
        .got_offer(ConnId::from("cam"), None, &audio_video_offer(), None, &cancel)
        .await
        .unwrap();

    let events = drain(&mut sub_events);
    let (down_id, offer) = events
        .iter()
        .find_map(|e| match e {
            ClientEvent::Down { id, offer, .. } => Some((id.clone(), offer.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(offer.sdp_type, galene_core::service::SdpType::Offer);

    // the subscriber answers its down offer
    sub.got_answer(&down_id, "v=0\r\n").await.unwrap();

    // the publisher renegotiates; the subscriber's down follows with a
    // fresh offer for the same publisher
    publisher
        .got_offer(ConnId::from("cam"), None, &audio_video_offer(), None, &cancel)
        .await
        .unwrap();
    let events = drain(&mut sub_events);
    assert_eq!(down_conns(&events), vec![ConnId::from("cam")]);

    // client-driven renegotiation also produces an offer
    sub.got_answer(&down_id, "v=0\r\n").await.unwrap();
    sub.got_renegotiate(&down_id).await.unwrap();
    assert_eq!(down_conns(&drain(&mut sub_events)), vec![ConnId::from("cam")]);

    // simulcast layer requests reach the publisher's tracks
    sub.request_layer(&down_id, 1).unwrap();
    assert!(sub.request_layer(&ConnId::from("nope"), 1).is_err());
}

#[tokio::test]
async fn test_presence_data_update() {
    let dir = tempfile::tempdir().unwrap();
    let groups = setup_groups(dir.path(), presenter_group(), GroupsConfig::default());
    let engine = Arc::new(MockEngine::new());
    let credential = Credential::Password("x".to_string());

    let (alice, _a_events) = new_client("a", "alice", &engine);
    let alice_dyn: Arc<dyn Client> = alice.clone();
    groups.add_client("conf", alice_dyn, &credential).await.unwrap();

    let (bob, mut bob_events) = new_client("b", "bob", &engine);
    let bob_dyn: Arc<dyn Client> = bob.clone();
    groups.add_client("conf", bob_dyn, &credential).await.unwrap();
    drain(&mut bob_events);

    let mut update = std::collections::HashMap::new();
    update.insert("raisehand".to_string(), serde_json::json!(true));
    alice.set_data(update).await.unwrap();
    assert_eq!(alice.data()["raisehand"], serde_json::json!(true));

    let events = drain(&mut bob_events);
    assert!(events.iter().any(|e| matches!(
        e,
        ClientEvent::Presence(p)
            if p.id == *alice.id() && p.data.get("raisehand") == Some(&serde_json::json!(true))
    )));

    // a null value deletes the key
    let mut update = std::collections::HashMap::new();
    update.insert("raisehand".to_string(), serde_json::Value::Null);
    alice.set_data(update).await.unwrap();
    assert!(alice.data().is_empty());
}

#[tokio::test]
async fn test_recorder_tracks_publishers() {
    use galene_core::service::Recorder;

    let dir = tempfile::tempdir().unwrap();
    let json = r#"{"allow-recording": true,
                   "wildcard-user": {"password": {"type": "wildcard"}, "permissions": "presenter"}}"#;
    let groups = setup_groups(dir.path(), json, GroupsConfig::default());
    let engine = Arc::new(MockEngine::new());
    let credential = Credential::Password("x".to_string());

    let (publisher, _p_events) = new_client("p", "paula", &engine);
    let publisher_dyn: Arc<dyn Client> = publisher.clone();
    groups.add_client("conf", publisher_dyn, &credential).await.unwrap();
    let cancel = CancelHandle::new();
    publisher
        .got_offer(ConnId::from("cam"), None, &audio_video_offer(), None, &cancel)
        .await
        .unwrap();

    let recorder = Recorder::new(ClientId::from("rec"));
    let recorder_dyn: Arc<dyn Client> = recorder.clone();
    groups.add_client("conf", recorder_dyn, &credential).await.unwrap();

    let recorded = recorder.recorded_conns();
    assert_eq!(recorded.len(), 1);
    assert!(recorded.contains_key(&ConnId::from("cam")));

    publisher.close().await.unwrap();
    assert!(recorder.recorded_conns().is_empty());

    recorder.close().await.unwrap();
    assert_eq!(groups.get("conf").unwrap().client_count(), 0);
}

#[tokio::test]
async fn test_stream_replacement() {
    let dir = tempfile::tempdir().unwrap();
    let groups = setup_groups(dir.path(), presenter_group(), GroupsConfig::default());
    let engine = Arc::new(MockEngine::new());
    let credential = Credential::Password("x".to_string());

    let (publisher, _p_events) = new_client("p", "paula", &engine);
    let publisher_dyn: Arc<dyn Client> = publisher.clone();
    groups.add_client("conf", publisher_dyn, &credential).await.unwrap();

    let (sub, mut sub_events) = new_client("s", "sam", &engine);
    let sub_dyn: Arc<dyn Client> = sub.clone();
    groups.add_client("conf", sub_dyn, &credential).await.unwrap();

    let cancel = CancelHandle::new();
    publisher
        .got_offer(ConnId::from("cam1"), None, &audio_video_offer(), None, &cancel)
        .await
        .unwrap();
    assert_eq!(down_conns(&drain(&mut sub_events)), vec![ConnId::from("cam1")]);

    // a new up supersedes the old one; the subscriber swaps atomically
    publisher
        .got_offer(
            ConnId::from("cam2"),
            None,
            &audio_video_offer(),
            Some(ConnId::from("cam1")),
            &cancel,
        )
        .await
        .unwrap();

    let events = drain(&mut sub_events);
    let replaced = events.iter().find_map(|e| match e {
        ClientEvent::Down { remote, replace, .. } => Some((remote.clone(), replace.clone())),
        _ => None,
    });
    assert_eq!(
        replaced,
        Some((ConnId::from("cam2"), Some(ConnId::from("cam1"))))
    );

    // only the new stream remains; closing fans out a single gone event
    publisher.close().await.unwrap();
    assert_eq!(gone_conns(&drain(&mut sub_events)), vec![ConnId::from("cam2")]);
}
