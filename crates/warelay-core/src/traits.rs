use crate::{error::RelayError, session::LifecycleEvent};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Messaging backend trait: opens client sessions.
///
/// The production backend drives WhatsApp Web; tests plug in a fake.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Open a session bound to `identity`.
    ///
    /// Resolves once the client has started; login progress is reported
    /// afterwards through the returned event stream.
    async fn open(&self, identity: &str) -> Result<OpenedSession, RelayError>;
}

/// A started client plus its lifecycle event stream.
pub struct OpenedSession {
    pub client: Arc<dyn SessionClient>,
    pub events: mpsc::Receiver<LifecycleEvent>,
}

/// Operations on one running messaging client.
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Deliver `body` to an already-normalized chat id (e.g. `123@c.us`).
    async fn send_text(&self, chat_id: &str, body: &str) -> Result<(), RelayError>;

    /// Log out and invalidate the stored credentials.
    async fn logout(&self) -> Result<(), RelayError>;

    /// Stop the client without invalidating credentials.
    ///
    /// Must disconnect the live connection before returning, and drop the
    /// event sender so the event stream terminates. Idempotent.
    async fn close(&self);
}
