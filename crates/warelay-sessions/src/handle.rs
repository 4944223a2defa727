//! Session handle: one messaging client bound to an instance id.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use warelay_core::{
    error::RelayError,
    session::{LifecycleEvent, SessionEffect, SessionState},
    traits::SessionClient,
};

use crate::recipient::normalize_recipient;

/// Snapshot of a session for status reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub instance_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub has_qr: bool,
}

/// A session owned by the instance registry.
///
/// The client is attached once the backend has opened it; until then the
/// handle sits in `Initializing` and refuses sends and logouts.
pub struct SessionHandle {
    identity: String,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    client: Mutex<Option<Arc<dyn SessionClient>>>,
}

impl SessionHandle {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            created_at: Utc::now(),
            state: Mutex::new(SessionState::Initializing),
            client: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    pub(crate) async fn attach(&self, client: Arc<dyn SessionClient>) {
        *self.client.lock().await = Some(client);
    }

    /// Apply a lifecycle event and return the effect the owner must execute.
    pub async fn apply(&self, event: LifecycleEvent) -> SessionEffect {
        let kind = event.kind();
        let mut state = self.state.lock().await;
        let (next, effect) = state.apply(event);
        if next != *state {
            info!("session {}: {kind} ({} -> {next})", self.identity, *state);
        } else {
            debug!("session {}: {kind} (state {next})", self.identity);
        }
        *state = next;
        effect
    }

    /// Force the session into `Failed`, e.g. after the client stopped responding.
    pub(crate) async fn mark_failed(&self) {
        *self.state.lock().await = SessionState::Failed;
    }

    /// Send `body` to `recipient`, normalizing the address first.
    pub async fn send_message(
        &self,
        recipient: &str,
        body: &str,
        timeout: Duration,
    ) -> Result<(), RelayError> {
        let chat_id = normalize_recipient(recipient)?;

        let state = self.state().await;
        if state != SessionState::Ready {
            return Err(RelayError::SendFailed(format!(
                "session '{}' is not ready (state: {state})",
                self.identity
            )));
        }

        let client = self.client.lock().await.clone().ok_or_else(|| {
            RelayError::SendFailed(format!("session '{}' has no client", self.identity))
        })?;

        match tokio::time::timeout(timeout, client.send_text(&chat_id, body)).await {
            Ok(Ok(())) => {
                info!("session {}: message sent to {chat_id}", self.identity);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("session {}: send to {chat_id} failed: {e}", self.identity);
                Err(RelayError::SendFailed(underlying(e)))
            }
            Err(_) => {
                warn!(
                    "session {}: send to {chat_id} timed out after {}s",
                    self.identity,
                    timeout.as_secs()
                );
                self.mark_failed().await;
                Err(RelayError::SendFailed(format!(
                    "send timed out after {}s",
                    timeout.as_secs()
                )))
            }
        }
    }

    /// Log out through the underlying client.
    pub async fn logout(&self, timeout: Duration) -> Result<(), RelayError> {
        let client = self.client.lock().await.clone().ok_or_else(|| {
            RelayError::LogoutFailed(format!(
                "session '{}' is still initializing",
                self.identity
            ))
        })?;

        match tokio::time::timeout(timeout, client.logout()).await {
            Ok(Ok(())) => {
                info!("session {}: logged out", self.identity);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("session {}: logout failed: {e}", self.identity);
                Err(RelayError::LogoutFailed(underlying(e)))
            }
            Err(_) => {
                warn!(
                    "session {}: logout timed out after {}s",
                    self.identity,
                    timeout.as_secs()
                );
                self.mark_failed().await;
                Err(RelayError::LogoutFailed(format!(
                    "logout timed out after {}s",
                    timeout.as_secs()
                )))
            }
        }
    }

    /// Detach and stop the client, if one is attached.
    pub async fn close(&self) {
        let client = self.client.lock().await.take();
        if let Some(client) = client {
            client.close().await;
            debug!("session {}: client closed", self.identity);
        }
    }

    pub async fn status(&self, has_qr: bool) -> InstanceStatus {
        InstanceStatus {
            instance_id: self.identity.clone(),
            state: self.state().await,
            created_at: self.created_at,
            has_qr,
        }
    }
}

/// Strip our own wrapping so callers see the client's message verbatim.
pub(crate) fn underlying(err: RelayError) -> String {
    match err {
        RelayError::Backend(msg) | RelayError::SendFailed(msg) | RelayError::LogoutFailed(msg) => {
            msg
        }
        other => other.to_string(),
    }
}
