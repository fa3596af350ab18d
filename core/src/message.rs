/// Canonical chat message model and upstream-record normalization
use crate::identity::{self, LocalIdentity};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Delivery state of a locally sent message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Published, echo not yet observed
    Pending,
    /// Echoed back by the server, or received from someone else
    Confirmed,
}

/// One chat message, identical in shape whether it came from the live
/// bus, the REST history endpoint, or a local send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Server-assigned identifier; locally sent messages adopt it from
    /// the delivery echo
    pub id: Option<String>,
    pub room_id: String,
    pub sender_id: Option<String>,
    pub sender_username: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Derived locally, never trusted from the wire
    pub is_mine: bool,
    pub delivery: DeliveryStatus,
}

impl ChatMessage {
    /// Build the optimistic local copy of an outgoing message
    pub fn outgoing(room_id: &str, identity: &LocalIdentity, content: &str) -> Self {
        Self {
            id: None,
            room_id: room_id.to_string(),
            sender_id: identity.user_id.clone(),
            sender_username: identity.username.clone(),
            content: content.to_string(),
            created_at: Utc::now(),
            is_mine: true,
            delivery: DeliveryStatus::Pending,
        }
    }

    /// Normalize a raw upstream record into a `ChatMessage`.
    ///
    /// Accepts both the `{type, payload}` envelope and flat message
    /// objects. Returns `None` for records this session must drop:
    /// non-chat envelopes, blank content, or an author that cannot be
    /// resolved from any known field.
    pub fn from_value(
        raw: &Value,
        room_id: &str,
        identity: &LocalIdentity,
        received_at: DateTime<Utc>,
    ) -> Option<Self> {
        let record = match raw.get("payload") {
            Some(payload) => {
                if let Some(kind) = raw.get("type").and_then(Value::as_str) {
                    if kind != "CHAT_MESSAGE" {
                        return None;
                    }
                }
                payload
            }
            None => raw,
        };

        let content = identity::probe_string(record, &["content", "text"])
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if content.is_empty() {
            return None;
        }

        let sender_id = identity::probe_string(record, identity::SENDER_ID_FIELDS);
        let sender_username = identity::probe_string(record, identity::SENDER_NAME_FIELDS);
        if sender_id.is_none() && sender_username.is_none() {
            return None;
        }

        let id = identity::probe_string(record, &["id", "messageId"]);
        let created_at = parse_timestamp(record).unwrap_or(received_at);
        let is_mine = identity.is_mine(sender_id.as_deref(), sender_username.as_deref());

        Some(Self {
            id,
            room_id: room_id.to_string(),
            sender_id,
            sender_username,
            content,
            created_at,
            is_mine,
            delivery: DeliveryStatus::Confirmed,
        })
    }

    /// Display name for the author
    pub fn sender_label(&self) -> &str {
        self.sender_username
            .as_deref()
            .or(self.sender_id.as_deref())
            .unwrap_or("unknown")
    }
}

/// Parse `createdAt`/`timestamp` as RFC 3339 or epoch seconds/millis
fn parse_timestamp(record: &Value) -> Option<DateTime<Utc>> {
    for field in ["createdAt", "timestamp"] {
        match record.get(field) {
            Some(Value::String(s)) => {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(s.trim()) {
                    return Some(parsed.with_timezone(&Utc));
                }
            }
            Some(Value::Number(n)) => {
                if let Some(raw) = n.as_i64() {
                    // epoch millis from roughly 2001 onwards
                    let parsed = if raw >= 1_000_000_000_000 {
                        Utc.timestamp_millis_opt(raw).single()
                    } else {
                        Utc.timestamp_opt(raw, 0).single()
                    };
                    if parsed.is_some() {
                        return parsed;
                    }
                }
            }
            _ => {}
        }
    }
    None
}
