/// Room chat session management
///
/// One `ChatSession` per open room view. The session owns the bus
/// connection and at most one live room subscription at a time, runs
/// every inbound record through normalization and dedup, and exposes an
/// append-ordered message list plus an event stream to the consumer.
use crate::bus::{BusClient, BusCommand, BusConfig, BusEvent, ConnectionStatus};
use crate::config::ChatConfig;
use crate::dedup::{self, Deduplicator};
use crate::error::{ChatError, Result};
use crate::history::HistoryClient;
use crate::identity::LocalIdentity;
use crate::message::{ChatMessage, DeliveryStatus};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Events streamed to the consuming view
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Connection status changed
    StatusChanged { status: ConnectionStatus },
    /// A message was appended to the list (incoming or optimistic local)
    NewMessage { message: ChatMessage },
    /// A locally sent message was confirmed by its server echo
    MessageDelivered { message: ChatMessage },
    /// Past messages were merged in after a room entry
    HistoryLoaded { count: usize },
}

struct SessionState {
    status: ConnectionStatus,
    /// Whether the underlying socket currently holds a broker session;
    /// distinct from `status`, which also tracks room attachment
    transport_up: bool,
    room_id: Option<String>,
    /// Active subscription id; never handed out
    subscription: Option<String>,
    messages: Vec<ChatMessage>,
    dedup: Deduplicator,
    /// Bumped on every room change and disconnect so in-flight work
    /// can detect it became stale
    generation: u64,
}

pub struct ChatSession {
    config: ChatConfig,
    token: String,
    identity: LocalIdentity,
    history: HistoryClient,
    state: Arc<RwLock<SessionState>>,
    events: broadcast::Sender<SessionEvent>,
    bus: Arc<Mutex<Option<BusClient>>>,
}

impl ChatSession {
    pub fn new(config: ChatConfig, token: impl Into<String>, identity: LocalIdentity) -> Result<Self> {
        let token = token.into();
        let history = HistoryClient::new(&config, token.clone())?;
        let (events, _) = broadcast::channel(256);
        let state = SessionState {
            status: ConnectionStatus::Disconnected,
            transport_up: false,
            room_id: None,
            subscription: None,
            messages: Vec::new(),
            dedup: Deduplicator::new(config.signature_window, config.echo_window),
            generation: 0,
        };
        Ok(Self {
            config,
            token,
            identity,
            history,
            state: Arc::new(RwLock::new(state)),
            events,
            bus: Arc::new(Mutex::new(None)),
        })
    }

    /// Subscribe to session events
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.state.read().await.status
    }

    pub async fn room_id(&self) -> Option<String> {
        self.state.read().await.room_id.clone()
    }

    /// Snapshot of the append-ordered message list
    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.state.read().await.messages.clone()
    }

    /// Attach the session to a room.
    ///
    /// Idempotent while already attached or attaching to the same room.
    /// A different room tears the previous subscription down first and
    /// resets all session-scoped state. Refuses to run without a bearer
    /// token. History loading starts in the background.
    pub async fn connect(&self, room_id: &str) -> Result<()> {
        let room_id = room_id.trim();
        if room_id.is_empty() {
            return Err(ChatError::Config("Room id must not be empty".to_string()));
        }
        if self.token.trim().is_empty() {
            let mut state = self.state.write().await;
            set_status(&mut state, &self.events, ConnectionStatus::Error);
            return Err(ChatError::Credential("Missing bearer token".to_string()));
        }

        let mut bus = self.bus.lock().await;
        let mut state = self.state.write().await;

        if state.room_id.as_deref() == Some(room_id)
            && matches!(
                state.status,
                ConnectionStatus::Connected | ConnectionStatus::Connecting
            )
        {
            debug!("Already attached to room {}, ignoring connect", room_id);
            return Ok(());
        }

        // Tear the old room down before arming the new one. The command
        // channel is ordered, so the unsubscribe reaches the broker
        // ahead of the new subscribe.
        if let Some(old) = state.subscription.take() {
            if let Some(client) = bus.as_ref() {
                client.command(BusCommand::Unsubscribe { id: old });
            }
        }

        state.room_id = Some(room_id.to_string());
        state.messages.clear();
        state.dedup.reset();
        state.generation += 1;
        let generation = state.generation;
        set_status(&mut state, &self.events, ConnectionStatus::Connecting);

        if bus.is_none() {
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let client = BusClient::spawn(
                BusConfig {
                    endpoint: self.config.ws_endpoint(),
                    token: self.token.clone(),
                    reconnect_delay: self.config.reconnect_delay,
                    heartbeat_interval: self.config.heartbeat_interval,
                    connect_timeout: self.config.connect_timeout,
                },
                event_tx,
            );
            tokio::spawn(run_event_pump(
                event_rx,
                self.state.clone(),
                self.events.clone(),
                client.sender(),
                self.identity.clone(),
            ));
            *bus = Some(client);
        } else if state.transport_up {
            // the socket survived the room switch, so no Connected
            // event will fire; subscribe right away
            if let Some(client) = bus.as_ref() {
                subscribe_room(&client.sender(), &mut state);
                set_status(&mut state, &self.events, ConnectionStatus::Connected);
            }
        }
        drop(state);
        drop(bus);

        self.spawn_history_load(room_id.to_string(), generation);
        Ok(())
    }

    /// Publish a message to the current room.
    ///
    /// Silently ignored when the text trims empty or the session is not
    /// connected. The pending-sent signature is registered before the
    /// publish so a fast server echo cannot race local bookkeeping.
    pub async fn send(&self, text: &str) {
        let content = text.trim();
        if content.is_empty() {
            return;
        }
        let bus = self.bus.lock().await;
        let mut state = self.state.write().await;
        if state.status != ConnectionStatus::Connected {
            debug!("Send ignored while {:?}", state.status);
            return;
        }
        let Some(room_id) = state.room_id.clone() else {
            return;
        };
        let Some(client) = bus.as_ref() else {
            return;
        };

        state
            .dedup
            .register_pending(dedup::pending_signature(&room_id, content));
        let message = ChatMessage::outgoing(&room_id, &self.identity, content);
        let body = serde_json::json!({ "content": content }).to_string();
        client.command(BusCommand::Publish {
            destination: destination_for(&room_id),
            body,
        });
        state.messages.push(message.clone());
        drop(state);
        let _ = self.events.send(SessionEvent::NewMessage { message });
    }

    /// Detach from the room and release the transport. Idempotent.
    pub async fn disconnect(&self) {
        let mut bus = self.bus.lock().await;
        let client = bus.take();
        let mut state = self.state.write().await;
        state.generation += 1;
        state.room_id = None;
        state.subscription = None;
        state.transport_up = false;
        state.messages.clear();
        state.dedup.reset();
        set_status(&mut state, &self.events, ConnectionStatus::Disconnected);
        drop(state);
        drop(bus);

        if let Some(client) = client {
            client.shutdown().await;
        }
    }

    fn spawn_history_load(&self, room_id: String, generation: u64) {
        let history = self.history.clone();
        let identity = self.identity.clone();
        let state = self.state.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let fetched = match history.fetch_messages(&room_id, &identity).await {
                Ok(fetched) => fetched,
                Err(e) => {
                    warn!("History load for room {} failed: {}", room_id, e);
                    return;
                }
            };

            let mut state = state.write().await;
            if state.generation != generation {
                debug!("Discarding stale history fetch for room {}", room_id);
                return;
            }
            let mut admitted = Vec::with_capacity(fetched.len());
            for message in fetched {
                match &message.id {
                    Some(id) => {
                        if state.dedup.id_seen(id) {
                            continue;
                        }
                        state.dedup.remember_id(id);
                    }
                    None => {
                        if state
                            .dedup
                            .recently_admitted(&dedup::content_signature(&message))
                        {
                            continue;
                        }
                    }
                }
                admitted.push(message);
            }
            let count = admitted.len();
            // history precedes whatever the live stream already appended
            let live = std::mem::take(&mut state.messages);
            admitted.extend(live);
            state.messages = admitted;
            drop(state);
            let _ = events.send(SessionEvent::HistoryLoaded { count });
        });
    }
}

impl Clone for ChatSession {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            token: self.token.clone(),
            identity: self.identity.clone(),
            history: self.history.clone(),
            state: self.state.clone(),
            events: self.events.clone(),
            bus: self.bus.clone(),
        }
    }
}

fn topic_for(room_id: &str) -> String {
    format!("/topic/room/{}", room_id)
}

fn destination_for(room_id: &str) -> String {
    format!("/app/room/{}/chat", room_id)
}

fn set_status(
    state: &mut SessionState,
    events: &broadcast::Sender<SessionEvent>,
    status: ConnectionStatus,
) {
    if state.status == status {
        return;
    }
    state.status = status;
    let _ = events.send(SessionEvent::StatusChanged { status });
}

fn subscribe_room(cmd_tx: &mpsc::UnboundedSender<BusCommand>, state: &mut SessionState) {
    let Some(room_id) = state.room_id.clone() else {
        return;
    };
    let id = format!("room-{}", Uuid::new_v4());
    let _ = cmd_tx.send(BusCommand::Subscribe {
        id: id.clone(),
        topic: topic_for(&room_id),
    });
    state.subscription = Some(id);
}

/// Consume transport events for the lifetime of one bus connection task
async fn run_event_pump(
    mut bus_events: mpsc::UnboundedReceiver<BusEvent>,
    state: Arc<RwLock<SessionState>>,
    events: broadcast::Sender<SessionEvent>,
    cmd_tx: mpsc::UnboundedSender<BusCommand>,
    identity: LocalIdentity,
) {
    while let Some(event) = bus_events.recv().await {
        match event {
            BusEvent::Status(ConnectionStatus::Connected) => {
                let mut state = state.write().await;
                state.transport_up = true;
                if state.room_id.is_some() {
                    // reconnects land here too: the transport never
                    // restores subscriptions on its own
                    subscribe_room(&cmd_tx, &mut state);
                    set_status(&mut state, &events, ConnectionStatus::Connected);
                }
            }
            BusEvent::Status(status) => {
                let mut state = state.write().await;
                state.transport_up = false;
                state.subscription = None;
                if state.room_id.is_some() {
                    // transport trouble never clears the message list;
                    // the bus keeps reconnecting underneath
                    set_status(&mut state, &events, status);
                }
            }
            BusEvent::Frame { destination, body } => {
                handle_frame(&state, &events, &identity, destination, body).await;
            }
        }
    }
    debug!("Bus event channel closed, pump exiting");
}

/// Normalize, dedup and admit one live frame
async fn handle_frame(
    state: &Arc<RwLock<SessionState>>,
    events: &broadcast::Sender<SessionEvent>,
    identity: &LocalIdentity,
    destination: String,
    body: String,
) {
    let mut state = state.write().await;
    let Some(room_id) = state.room_id.clone() else {
        return;
    };
    if destination != topic_for(&room_id) {
        debug!("Dropping frame for stale topic {}", destination);
        return;
    }

    let raw: Value = match serde_json::from_str(&body) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("Dropping non-JSON chat frame: {}", e);
            return;
        }
    };
    let Some(incoming) = ChatMessage::from_value(&raw, &room_id, identity, Utc::now()) else {
        debug!("Dropping unusable chat frame: {}", body);
        return;
    };

    // identifier dedup holds for the whole session
    if let Some(id) = &incoming.id {
        if state.dedup.id_seen(id) {
            return;
        }
    }

    // echo reconciliation: an own-authored frame matching an unexpired
    // pending signature confirms the optimistic copy in place
    if incoming.is_mine
        && state
            .dedup
            .consume_pending(&dedup::pending_signature(&room_id, &incoming.content))
    {
        if let Some(pos) = state.messages.iter().rposition(|m| {
            m.is_mine
                && m.delivery == DeliveryStatus::Pending
                && m.content.to_lowercase() == incoming.content.to_lowercase()
        }) {
            let confirmed = {
                let entry = &mut state.messages[pos];
                entry.delivery = DeliveryStatus::Confirmed;
                if entry.id.is_none() {
                    entry.id = incoming.id.clone();
                }
                entry.clone()
            };
            if let Some(id) = &confirmed.id {
                state.dedup.remember_id(id);
            }
            drop(state);
            let _ = events.send(SessionEvent::MessageDelivered { message: confirmed });
            return;
        }
        // pending entry vanished (already confirmed or list reset);
        // treat the frame as a normal arrival
    }

    match &incoming.id {
        Some(id) => state.dedup.remember_id(id),
        None => {
            if state
                .dedup
                .recently_admitted(&dedup::content_signature(&incoming))
            {
                return;
            }
        }
    }
    state.messages.push(incoming.clone());
    drop(state);
    let _ = events.send(SessionEvent::NewMessage { message: incoming });
}
