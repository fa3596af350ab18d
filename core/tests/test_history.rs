/// History loading, REST fallback, and the history/live merge race
use futures_util::{SinkExt, StreamExt};
use roomlink_core::bus::{Frame, FrameCommand};
use roomlink_core::{ChatConfig, ChatSession, ConnectionStatus, HistoryClient, LocalIdentity};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::{sleep, Instant};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Minimal HTTP responder: every request gets the same JSON body back
async fn start_rest_stub(body: String) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let body = body.clone();
            tokio::spawn(async move {
                let mut buf = Vec::with_capacity(2048);
                let mut chunk = [0u8; 1024];
                // read the request through the end of its headers, then
                // drain any content-length body
                let header_end = loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) => return,
                        Ok(n) => {
                            buf.extend_from_slice(&chunk[..n]);
                            if let Some(pos) =
                                buf.windows(4).position(|w| w == b"\r\n\r\n")
                            {
                                break pos + 4;
                            }
                            if buf.len() > 64 * 1024 {
                                return;
                            }
                        }
                        Err(_) => return,
                    }
                };
                let head = String::from_utf8_lossy(&buf[..header_end]).to_lowercase();
                let expected_body = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                let mut have = buf.len() - header_end;
                while have < expected_body {
                    match stream.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => have += n,
                        Err(_) => return,
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    addr
}

fn test_identity() -> LocalIdentity {
    LocalIdentity::new(Some("u1".to_string()), Some("ana".to_string()))
}

#[tokio::test]
async fn test_fetch_messages_normalizes_records() {
    let records = json!([
        {
            "id": "m1",
            "userID": "u2",
            "userName": "bob",
            "content": "old",
            "createdAt": "2026-01-10T12:00:00Z"
        },
        { "userId": "u2", "content": "   " },
        { "senderId": "u1", "text": "mine from history" }
    ]);
    let addr = start_rest_stub(records.to_string()).await;
    let config = ChatConfig::with_base_url(format!("http://{}", addr));
    let client = HistoryClient::new(&config, "tok-1").unwrap();

    let messages = client.fetch_messages("r1", &test_identity()).await.unwrap();
    assert_eq!(messages.len(), 2);

    assert_eq!(messages[0].id.as_deref(), Some("m1"));
    assert_eq!(messages[0].sender_id.as_deref(), Some("u2"));
    assert_eq!(messages[0].sender_username.as_deref(), Some("bob"));
    assert!(!messages[0].is_mine);
    assert_eq!(messages[0].created_at.to_rfc3339(), "2026-01-10T12:00:00+00:00");

    assert_eq!(messages[1].content, "mine from history");
    assert!(messages[1].is_mine);
}

#[tokio::test]
async fn test_room_id_is_percent_encoded() {
    let addr = start_rest_stub("[]".to_string()).await;
    let config = ChatConfig::with_base_url(format!("http://{}", addr));
    let client = HistoryClient::new(&config, "tok-1").unwrap();
    // a room id with a path separator must not change the URL shape
    let messages = client
        .fetch_messages("sala/general", &test_identity())
        .await
        .unwrap();
    assert!(messages.is_empty());
}

#[tokio::test]
async fn test_persist_message_returns_stored_record() {
    let stored = json!({ "id": "m9", "userId": "u1", "content": "via rest" });
    let addr = start_rest_stub(stored.to_string()).await;
    let config = ChatConfig::with_base_url(format!("http://{}", addr));
    let client = HistoryClient::new(&config, "tok-1").unwrap();

    let message = client
        .persist_message("r1", "via rest", &test_identity())
        .await
        .unwrap()
        .expect("backend echoed the stored record");
    assert_eq!(message.id.as_deref(), Some("m9"));
    assert!(message.is_mine);
}

#[tokio::test]
async fn test_fetch_profile_feeds_identity_probing() {
    let me = json!({ "user": { "id": "u1", "username": "Ana" }, "rooms": [] });
    let addr = start_rest_stub(me.to_string()).await;
    let config = ChatConfig::with_base_url(format!("http://{}", addr));
    let client = HistoryClient::new(&config, "tok-1").unwrap();

    let profile = client.fetch_profile().await.unwrap();
    let identity = LocalIdentity::from_session_value(&profile);
    assert_eq!(identity.user_id.as_deref(), Some("u1"));
    assert!(identity.is_mine(Some("u1"), Some("someone-else")));
}

/// History replays `m1`; the live stream delivers `m1` again right
/// after connect. Exactly one entry must survive, whichever side wins
/// the race.
#[tokio::test]
async fn test_history_live_race_yields_single_entry() {
    let records = json!([
        { "id": "m1", "userId": "u2", "username": "bob", "content": "old" }
    ]);
    let rest_addr = start_rest_stub(records.to_string()).await;

    // one-shot broker: accept, complete the handshake, deliver m1 live
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut ws) = accept_async(stream).await else {
            return;
        };
        let mut subscribed = false;
        while let Some(Ok(message)) = ws.next().await {
            let WsMessage::Text(text) = message else { continue };
            let Ok(Some(frame)) = Frame::parse(&text) else {
                continue;
            };
            match frame.command {
                FrameCommand::Connect => {
                    let connected = Frame::new(FrameCommand::Connected).header("version", "1.2");
                    if ws.send(WsMessage::Text(connected.to_wire())).await.is_err() {
                        return;
                    }
                }
                FrameCommand::Subscribe if !subscribed => {
                    subscribed = true;
                    let live = Frame::new(FrameCommand::Message)
                        .header("destination", "/topic/room/r1")
                        .header("subscription", "sub-0")
                        .header("message-id", "push-0")
                        .body(
                            json!({ "id": "m1", "userId": "u2", "username": "bob", "content": "old" })
                                .to_string(),
                        );
                    if ws.send(WsMessage::Text(live.to_wire())).await.is_err() {
                        return;
                    }
                }
                _ => {}
            }
        }
    });

    let mut config = ChatConfig::with_base_url(format!("http://{}", rest_addr));
    config.ws_url = Some(format!("ws://{}", ws_addr));
    config.reconnect_delay = Duration::from_millis(100);
    let session = ChatSession::new(config, "tok-1", test_identity()).unwrap();

    session.connect("r1").await.unwrap();

    // wait until both the live delivery and the history merge settled
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if session.status().await == ConnectionStatus::Connected
            && !session.messages().await.is_empty()
        {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    sleep(Duration::from_millis(300)).await;

    let messages = session.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id.as_deref(), Some("m1"));
    assert_eq!(messages[0].content, "old");

    session.disconnect().await;
}
