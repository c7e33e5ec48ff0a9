// External collaborators
// The core consumes session provisioning, message dispatch, cancellation, and
// the message store only through these narrow interfaces. The transport
// itself is out of scope; `HttpBackend` is the thin reqwest binding to it.

use crate::error::{DeckError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// Agent/model selection a child session inherits from its parent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InheritedSelection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAttachment {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Streaming,
    Complete,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMeta {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub status: MessageStatus,
}

/// Token and cost totals for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

/// Outbound operations against the agent backend. All calls are suspension
/// points: other callbacks may run before they resolve.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Provision a dedicated child session under `parent_session_id`.
    async fn create_child_session(
        &self,
        parent_session_id: &str,
        inherited: &InheritedSelection,
    ) -> Result<String>;

    async fn send_message(
        &self,
        instance_id: &str,
        session_id: &str,
        text: &str,
        attachments: &[FileAttachment],
        task_id: Option<&str>,
    ) -> Result<()>;

    /// Best-effort cancellation. Fire-and-forget: failures are logged, never
    /// surfaced, and callers clear their own busy state regardless.
    async fn cancel(&self, instance_id: &str, session_id: &str);
}

/// In-process message store owned by the transport layer.
pub trait MessageStore: Send + Sync {
    fn get_message(&self, message_id: &str) -> Option<MessageMeta>;
    fn session_message_ids(&self, session_id: &str) -> Vec<String>;
    fn session_usage(&self, session_id: &str) -> UsageTotals;
    fn clear_session(&self, session_id: &str);
}

// ============================================================================
// HTTP backend
// ============================================================================

pub struct HttpBackend {
    http_client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct CreateSessionBody<'a> {
    parent_session_id: &'a str,
    #[serde(flatten)]
    inherited: &'a InheritedSelection,
}

#[derive(Serialize)]
struct SendMessageBody<'a> {
    text: &'a str,
    attachments: &'a [FileAttachment],
    #[serde(skip_serializing_if = "Option::is_none")]
    task_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct SessionCreated {
    id: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SessionBackend for HttpBackend {
    async fn create_child_session(
        &self,
        parent_session_id: &str,
        inherited: &InheritedSelection,
    ) -> Result<String> {
        let url = format!("{}/api/sessions", self.base_url);
        tracing::debug!("Creating child session at: {}", url);

        let response = self
            .http_client
            .post(&url)
            .json(&CreateSessionBody {
                parent_session_id,
                inherited,
            })
            .send()
            .await
            .map_err(|e| DeckError::Backend(format!("Failed to create session: {}", e)))?;

        if !response.status().is_success() {
            return Err(DeckError::Backend(format!(
                "Failed to create session: {}",
                response.status()
            )));
        }

        let created: SessionCreated = response
            .json()
            .await
            .map_err(|e| DeckError::Backend(format!("Failed to parse session response: {}", e)))?;
        Ok(created.id)
    }

    async fn send_message(
        &self,
        instance_id: &str,
        session_id: &str,
        text: &str,
        attachments: &[FileAttachment],
        task_id: Option<&str>,
    ) -> Result<()> {
        let url = format!(
            "{}/api/workspaces/{}/sessions/{}/messages",
            self.base_url, instance_id, session_id
        );

        let response = self
            .http_client
            .post(&url)
            .json(&SendMessageBody {
                text,
                attachments,
                task_id,
            })
            .send()
            .await
            .map_err(|e| DeckError::Backend(format!("Failed to send message: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(DeckError::Backend(format!(
                "Failed to send message: {}",
                response.status()
            )))
        }
    }

    async fn cancel(&self, instance_id: &str, session_id: &str) {
        let url = format!(
            "{}/api/workspaces/{}/sessions/{}/cancel",
            self.base_url, instance_id, session_id
        );
        tracing::info!("Cancelling session: {}", session_id);

        let response = self
            .http_client
            .post(&url)
            .timeout(Duration::from_secs(5)) // Short timeout for cancel
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!("Cancel request accepted for session {}", session_id);
            }
            Ok(resp) => {
                // The caller stops listening either way; don't surface this.
                tracing::warn!("Cancel request rejected: {}", resp.status());
            }
            Err(e) => {
                tracing::warn!("Failed to send cancel request: {}", e);
            }
        }
    }
}

// ============================================================================
// In-memory message store
// ============================================================================

#[derive(Default)]
struct StoreInner {
    messages: HashMap<String, Vec<MessageMeta>>,
    usage: HashMap<String, UsageTotals>,
}

/// Reference `MessageStore` used in tests and by embedders that keep message
/// state in process.
#[derive(Default)]
pub struct InMemoryMessageStore {
    inner: RwLock<StoreInner>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_message(&self, meta: MessageMeta) {
        let mut inner = self.inner.write().unwrap();
        inner
            .messages
            .entry(meta.session_id.clone())
            .or_default()
            .push(meta);
    }

    pub fn set_status(&self, message_id: &str, status: MessageStatus) {
        let mut inner = self.inner.write().unwrap();
        for messages in inner.messages.values_mut() {
            if let Some(meta) = messages.iter_mut().find(|m| m.id == message_id) {
                meta.status = status;
                return;
            }
        }
    }

    pub fn set_usage(&self, session_id: &str, usage: UsageTotals) {
        self.inner
            .write()
            .unwrap()
            .usage
            .insert(session_id.to_string(), usage);
    }

    pub fn session_count(&self) -> usize {
        self.inner.read().unwrap().messages.len()
    }
}

impl MessageStore for InMemoryMessageStore {
    fn get_message(&self, message_id: &str) -> Option<MessageMeta> {
        let inner = self.inner.read().unwrap();
        inner
            .messages
            .values()
            .flat_map(|m| m.iter())
            .find(|m| m.id == message_id)
            .cloned()
    }

    fn session_message_ids(&self, session_id: &str) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        inner
            .messages
            .get(session_id)
            .map(|m| m.iter().map(|meta| meta.id.clone()).collect())
            .unwrap_or_default()
    }

    fn session_usage(&self, session_id: &str) -> UsageTotals {
        let inner = self.inner.read().unwrap();
        inner.usage.get(session_id).copied().unwrap_or_default()
    }

    fn clear_session(&self, session_id: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.messages.remove(session_id);
        inner.usage.remove(session_id);
    }
}

// ============================================================================
// Test doubles
// ============================================================================
