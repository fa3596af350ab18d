/// REST client for room message history and the persistence fallback
use crate::config::ChatConfig;
use crate::error::Result;
use crate::identity::LocalIdentity;
use crate::message::ChatMessage;
use chrono::Utc;
use serde_json::Value;
use tracing::debug;

/// Thin wrapper over the backend's room-message endpoints. Records are
/// normalized through the same field probing as live frames, so history
/// entries and live entries are structurally identical.
#[derive(Clone)]
pub struct HistoryClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HistoryClient {
    pub fn new(config: &ChatConfig, token: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: config.rest_base().to_string(),
            token: token.into(),
        })
    }

    fn messages_url(&self, room_id: &str) -> String {
        format!(
            "{}/api/rooms/{}/messages",
            self.base_url,
            urlencoding::encode(room_id)
        )
    }

    /// One-shot ordered fetch of a room's past messages
    pub async fn fetch_messages(
        &self,
        room_id: &str,
        identity: &LocalIdentity,
    ) -> Result<Vec<ChatMessage>> {
        let records: Vec<Value> = self
            .http
            .get(self.messages_url(room_id))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let now = Utc::now();
        let mut messages = Vec::with_capacity(records.len());
        for record in &records {
            match ChatMessage::from_value(record, room_id, identity, now) {
                Some(message) => messages.push(message),
                None => debug!("Skipping malformed history record: {}", record),
            }
        }
        Ok(messages)
    }

    /// Persist a message over REST, independent of the live bus.
    ///
    /// Returns the stored record when the backend echoes one back.
    pub async fn persist_message(
        &self,
        room_id: &str,
        content: &str,
        identity: &LocalIdentity,
    ) -> Result<Option<ChatMessage>> {
        let response = self
            .http
            .post(self.messages_url(room_id))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "content": content.trim() }))
            .send()
            .await?
            .error_for_status()?;

        let stored = match response.json::<Value>().await {
            Ok(value) => ChatMessage::from_value(&value, room_id, identity, Utc::now()),
            Err(_) => None, // empty or non-JSON body, backend-dependent
        };
        Ok(stored)
    }

    /// Fetch the authenticated session object for identity probing
    pub async fn fetch_profile(&self) -> Result<Value> {
        let me = self
            .http
            .get(format!("{}/api/auth/me", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(me)
    }
}
