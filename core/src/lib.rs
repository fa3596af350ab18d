/// RoomLink Core - Room Messaging Session Manager
///
/// A reconnecting message-bus client for room chat: one session per
/// open room view, per-room topic subscriptions multiplexed over a
/// single socket, and dedup across live push, REST fallback and
/// optimistic local echo.

pub mod bus;
pub mod config;
pub mod dedup;
pub mod error;
pub mod history;
pub mod identity;
pub mod message;
pub mod session;

pub use bus::ConnectionStatus;
pub use config::ChatConfig;
pub use error::{ChatError, Result};
pub use history::HistoryClient;
pub use identity::LocalIdentity;
pub use message::{ChatMessage, DeliveryStatus};
pub use session::{ChatSession, SessionEvent};
