/// Core unit tests for normalization, identity and dedup
///
/// Socket-level behavior lives in test_session_flow.rs; these cover the
/// pure pieces through the public API.
use chrono::Utc;
use roomlink_core::bus::{Frame, FrameCommand};
use roomlink_core::dedup::{content_signature, pending_signature, Deduplicator};
use roomlink_core::{ChatConfig, ChatMessage, LocalIdentity};
use serde_json::json;
use std::time::Duration;

fn identity() -> LocalIdentity {
    LocalIdentity::new(Some("u1".to_string()), Some("ana".to_string()))
}

#[test]
fn test_identity_resolution_is_deterministic() {
    // id match wins even when the username disagrees
    let raw = json!({ "userId": "u1", "username": "impostor", "content": "x" });
    let msg = ChatMessage::from_value(&raw, "r1", &identity(), Utc::now()).unwrap();
    assert!(msg.is_mine);

    // id mismatch is decisive even when the username agrees
    let raw = json!({ "userId": "u2", "username": "ana", "content": "x" });
    let msg = ChatMessage::from_value(&raw, "r1", &identity(), Utc::now()).unwrap();
    assert!(!msg.is_mine);

    // with no id on the message, the username decides
    let raw = json!({ "username": "ANA", "content": "x" });
    let msg = ChatMessage::from_value(&raw, "r1", &identity(), Utc::now()).unwrap();
    assert!(msg.is_mine);
}

#[test]
fn test_field_probing_priority_across_shapes() {
    // the same message, three backend spellings, one canonical result
    let variants = [
        json!({ "userId": "u2", "username": "bob", "content": "hola" }),
        json!({ "authorId": "u2", "senderName": "bob", "text": "hola" }),
        json!({ "idUser": "u2", "authorUsername": "bob", "content": " hola " }),
    ];
    for raw in &variants {
        let msg = ChatMessage::from_value(raw, "r1", &identity(), Utc::now()).unwrap();
        assert_eq!(msg.sender_id.as_deref(), Some("u2"));
        assert_eq!(msg.sender_username.as_deref(), Some("bob"));
        assert_eq!(msg.content, "hola");
    }
}

#[test]
fn test_delivering_identified_message_n_times_admits_once() {
    let mut dedup = Deduplicator::new(Duration::from_millis(1200), Duration::from_millis(6000));
    let mut admitted = 0;
    for _ in 0..5 {
        if !dedup.id_seen("m1") {
            dedup.remember_id("m1");
            admitted += 1;
        }
    }
    assert_eq!(admitted, 1);
}

#[test]
fn test_signature_ignores_case_and_outer_whitespace_of_sender() {
    let a = ChatMessage::from_value(
        &json!({ "username": "Bob", "content": "hi" }),
        "r1",
        &identity(),
        Utc::now(),
    )
    .unwrap();
    let b = ChatMessage::from_value(
        &json!({ "userName": "bob", "content": "hi" }),
        "r1",
        &identity(),
        Utc::now(),
    )
    .unwrap();
    assert_eq!(content_signature(&a), content_signature(&b));
}

#[test]
fn test_pending_signature_scopes_by_room() {
    assert_ne!(pending_signature("r1", "hi"), pending_signature("r2", "hi"));
    assert_eq!(
        pending_signature("r1", "  Hi "),
        pending_signature("r1", "hi")
    );
}

#[test]
fn test_frame_codec_speaks_the_broker_dialect() {
    let subscribe = Frame::new(FrameCommand::Subscribe)
        .header("id", "room-1")
        .header("destination", "/topic/room/r1");
    let wire = subscribe.to_wire();
    assert!(wire.starts_with("SUBSCRIBE\n"));
    assert!(wire.ends_with('\0'));

    let parsed = Frame::parse(&wire).unwrap().unwrap();
    assert_eq!(parsed.get_header("destination"), Some("/topic/room/r1"));
}

#[test]
fn test_config_defaults_are_sane() {
    let config = ChatConfig::default();
    assert_eq!(config.signature_window, Duration::from_millis(1200));
    assert_eq!(config.echo_window, Duration::from_millis(6000));
    assert!(config.reconnect_delay >= Duration::from_secs(3));
    assert_eq!(config.ws_endpoint(), "ws://localhost:8081/ws");
}
