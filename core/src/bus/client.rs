/// Message bus connection lifecycle
///
/// One background task owns the WebSocket. Consumers talk to it through
/// an ordered command channel and observe it through an event channel;
/// failures never surface as errors into calling code, only as status
/// events. Reconnection is automatic with a fixed delay, but the task
/// deliberately does not restore subscriptions: the session layer
/// re-subscribes when it observes `Connected`.
use crate::bus::frame::{Frame, FrameCommand};
use crate::error::{ChatError, Result};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state as seen by consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Commands accepted by the connection task
#[derive(Debug)]
pub enum BusCommand {
    Subscribe { id: String, topic: String },
    Unsubscribe { id: String },
    Publish { destination: String, body: String },
    Shutdown,
}

/// Events emitted by the connection task
#[derive(Debug)]
pub enum BusEvent {
    Status(ConnectionStatus),
    Frame { destination: String, body: String },
}

/// Transport tunables, lifted out of [`crate::config::ChatConfig`]
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub endpoint: String,
    pub token: String,
    pub reconnect_delay: Duration,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
}

/// Why the serve loop returned
enum Exit {
    /// Explicit shutdown command
    Shutdown,
    /// All command senders dropped
    Abandoned,
    /// Broker-level ERROR frame
    Broker,
    /// Socket closed or failed
    Socket,
}

pub struct BusClient {
    cmd_tx: mpsc::UnboundedSender<BusCommand>,
    task: JoinHandle<()>,
}

impl BusClient {
    /// Spawn the connection task. Events arrive on `events` until the
    /// task ends; the task ends on [`BusCommand::Shutdown`] or when all
    /// command senders are gone.
    pub fn spawn(config: BusConfig, events: mpsc::UnboundedSender<BusEvent>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(config, cmd_rx, events));
        Self { cmd_tx, task }
    }

    /// A cloneable handle for issuing commands
    pub fn sender(&self) -> mpsc::UnboundedSender<BusCommand> {
        self.cmd_tx.clone()
    }

    pub fn command(&self, command: BusCommand) {
        if self.cmd_tx.send(command).is_err() {
            debug!("Bus task already stopped; command dropped");
        }
    }

    /// Stop the connection task and wait for it to finish
    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(BusCommand::Shutdown);
        let _ = self.task.await;
    }
}

async fn run(
    config: BusConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<BusCommand>,
    events: mpsc::UnboundedSender<BusEvent>,
) {
    loop {
        let _ = events.send(BusEvent::Status(ConnectionStatus::Connecting));

        match establish(&config).await {
            Ok(mut socket) => {
                info!("Bus connected to {}", config.endpoint);
                let _ = events.send(BusEvent::Status(ConnectionStatus::Connected));

                match serve(&mut socket, &mut cmd_rx, &events, &config).await {
                    Exit::Shutdown => {
                        let disconnect = Frame::new(FrameCommand::Disconnect).to_wire();
                        let _ = socket.send(WsMessage::Text(disconnect)).await;
                        let _ = socket.close(None).await;
                        let _ = events.send(BusEvent::Status(ConnectionStatus::Disconnected));
                        return;
                    }
                    Exit::Abandoned => {
                        let _ = socket.close(None).await;
                        return;
                    }
                    Exit::Broker => {
                        let _ = events.send(BusEvent::Status(ConnectionStatus::Error));
                    }
                    Exit::Socket => {
                        let _ = events.send(BusEvent::Status(ConnectionStatus::Disconnected));
                    }
                }
            }
            Err(e) => {
                warn!("Bus connect to {} failed: {}", config.endpoint, e);
                let _ = events.send(BusEvent::Status(ConnectionStatus::Error));
            }
        }

        debug!(
            "Reconnecting in {} ms",
            config.reconnect_delay.as_millis()
        );
        tokio::select! {
            _ = sleep(config.reconnect_delay) => {}
            cmd = cmd_rx.recv() => match cmd {
                Some(BusCommand::Shutdown) | None => {
                    let _ = events.send(BusEvent::Status(ConnectionStatus::Disconnected));
                    return;
                }
                Some(other) => {
                    // nothing to apply it to; the session re-issues
                    // subscriptions once the link is back
                    debug!("Dropping {:?} while offline", other);
                }
            }
        }
    }
}

/// Open the socket and complete the broker handshake
async fn establish(config: &BusConfig) -> Result<Socket> {
    let connect = timeout(config.connect_timeout, connect_async(config.endpoint.as_str()))
        .await
        .map_err(|_| ChatError::Timeout("Bus connect timeout".to_string()))?;
    let (mut socket, _response) =
        connect.map_err(|e| ChatError::Transport(format!("WebSocket connect: {}", e)))?;

    let heartbeat_ms = config.heartbeat_interval.as_millis();
    let mut connect_frame = Frame::new(FrameCommand::Connect)
        .header("accept-version", "1.2")
        .header("heart-beat", format!("{},{}", heartbeat_ms, heartbeat_ms));
    if !config.token.trim().is_empty() {
        connect_frame = connect_frame.header(
            "Authorization",
            format!("Bearer {}", config.token.trim()),
        );
    }
    socket
        .send(WsMessage::Text(connect_frame.to_wire()))
        .await
        .map_err(|e| ChatError::Transport(format!("WebSocket send: {}", e)))?;

    let deadline = Instant::now() + config.connect_timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| ChatError::Timeout("Broker handshake timeout".to_string()))?;
        let item = timeout(remaining, socket.next())
            .await
            .map_err(|_| ChatError::Timeout("Broker handshake timeout".to_string()))?;

        match item {
            Some(Ok(WsMessage::Text(text))) => match Frame::parse(&text)? {
                Some(frame) if frame.command == FrameCommand::Connected => return Ok(socket),
                Some(frame) if frame.command == FrameCommand::Error => {
                    return Err(ChatError::Protocol(format!(
                        "Broker refused connection: {}",
                        frame.get_header("message").unwrap_or("unspecified")
                    )));
                }
                _ => continue,
            },
            Some(Ok(WsMessage::Ping(payload))) => {
                socket
                    .send(WsMessage::Pong(payload))
                    .await
                    .map_err(|e| ChatError::Transport(format!("WebSocket send: {}", e)))?;
            }
            Some(Ok(WsMessage::Close(_))) | None => {
                return Err(ChatError::Transport(
                    "Socket closed during handshake".to_string(),
                ));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(ChatError::Transport(format!("WebSocket read: {}", e)));
            }
        }
    }
}

/// Pump one established connection until it ends
async fn serve(
    socket: &mut Socket,
    cmd_rx: &mut mpsc::UnboundedReceiver<BusCommand>,
    events: &mpsc::UnboundedSender<BusEvent>,
    config: &BusConfig,
) -> Exit {
    let mut heartbeat = interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // half-open detection: the broker heart-beats at the same cadence,
    // so a silent link well past one interval is considered dead
    let stale_cutoff = config.heartbeat_interval * 5 / 2;
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            item = socket.next() => match item {
                Some(Ok(message)) => {
                    last_inbound = Instant::now();
                    match message {
                        WsMessage::Text(text) => match Frame::parse(&text) {
                            Ok(Some(frame)) => match frame.command {
                                FrameCommand::Message => {
                                    let destination = frame
                                        .get_header("destination")
                                        .unwrap_or_default()
                                        .to_string();
                                    let _ = events.send(BusEvent::Frame {
                                        destination,
                                        body: frame.body,
                                    });
                                }
                                FrameCommand::Error => {
                                    warn!(
                                        "Broker error: {}",
                                        frame.get_header("message").unwrap_or("unspecified")
                                    );
                                    return Exit::Broker;
                                }
                                other => debug!("Ignoring {} frame", other),
                            },
                            Ok(None) => {} // heart-beat
                            Err(e) => warn!("Dropping unparseable frame: {}", e),
                        },
                        WsMessage::Ping(payload) => {
                            if socket.send(WsMessage::Pong(payload)).await.is_err() {
                                return Exit::Socket;
                            }
                        }
                        WsMessage::Close(_) => {
                            debug!("Bus socket closed by server");
                            return Exit::Socket;
                        }
                        _ => {}
                    }
                }
                Some(Err(e)) => {
                    warn!("Bus socket error: {}", e);
                    return Exit::Socket;
                }
                None => return Exit::Socket,
            },

            cmd = cmd_rx.recv() => {
                let frame = match cmd {
                    Some(BusCommand::Subscribe { id, topic }) => {
                        debug!("Subscribing {} to {}", id, topic);
                        Frame::new(FrameCommand::Subscribe)
                            .header("id", id)
                            .header("destination", topic)
                            .header("ack", "auto")
                    }
                    Some(BusCommand::Unsubscribe { id }) => {
                        debug!("Unsubscribing {}", id);
                        Frame::new(FrameCommand::Unsubscribe).header("id", id)
                    }
                    Some(BusCommand::Publish { destination, body }) => {
                        Frame::new(FrameCommand::Send)
                            .header("destination", destination)
                            .header("content-type", "application/json")
                            .body(body)
                    }
                    Some(BusCommand::Shutdown) => return Exit::Shutdown,
                    None => return Exit::Abandoned,
                };
                if socket.send(WsMessage::Text(frame.to_wire())).await.is_err() {
                    return Exit::Socket;
                }
            }

            _ = heartbeat.tick() => {
                if last_inbound.elapsed() > stale_cutoff {
                    warn!(
                        "No traffic for {} ms, assuming half-open connection",
                        last_inbound.elapsed().as_millis()
                    );
                    return Exit::Socket;
                }
                if socket.send(WsMessage::Text("\n".to_string())).await.is_err() {
                    return Exit::Socket;
                }
            }
        }
    }
}
