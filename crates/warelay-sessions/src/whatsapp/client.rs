//! SessionClient implementation for a running WhatsApp bot.

use super::to_protocol_jid;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::info;
use wacore_binary::jid::Jid;
use warelay_core::{error::RelayError, session::LifecycleEvent, traits::SessionClient};
use whatsapp_rust::client::Client;

/// Handle to one running bot.
pub struct WhatsAppClient {
    identity: String,
    session_dir: PathBuf,
    client: Mutex<Option<Arc<Client>>>,
    run_handle: Mutex<Option<JoinHandle<()>>>,
    events: Arc<Mutex<Option<mpsc::Sender<LifecycleEvent>>>>,
}

impl WhatsAppClient {
    pub(super) fn new(
        identity: &str,
        session_dir: PathBuf,
        client: Arc<Client>,
        run_handle: JoinHandle<()>,
        events: Arc<Mutex<Option<mpsc::Sender<LifecycleEvent>>>>,
    ) -> Self {
        Self {
            identity: identity.to_string(),
            session_dir,
            client: Mutex::new(Some(client)),
            run_handle: Mutex::new(Some(run_handle)),
            events,
        }
    }
}

#[async_trait]
impl SessionClient for WhatsAppClient {
    async fn send_text(&self, chat_id: &str, body: &str) -> Result<(), RelayError> {
        let client = self
            .client
            .lock()
            .await
            .clone()
            .ok_or_else(|| RelayError::Backend("whatsapp client not connected".into()))?;

        let jid_str = to_protocol_jid(chat_id);
        let jid: Jid = jid_str
            .parse()
            .map_err(|e| RelayError::Backend(format!("invalid whatsapp JID '{jid_str}': {e}")))?;

        let msg = waproto::whatsapp::Message {
            conversation: Some(body.to_string()),
            ..Default::default()
        };
        let msg_id = client
            .send_message(jid, msg)
            .await
            .map_err(|e| RelayError::Backend(format!("whatsapp send failed: {e}")))?;

        info!("WhatsApp {}: sent message {msg_id}", self.identity);
        Ok(())
    }

    async fn logout(&self) -> Result<(), RelayError> {
        // Disconnect before wiping the store the live connection writes to.
        self.close().await;

        // Drop the stored credentials so the next session for this identity
        // starts from a fresh QR login.
        if tokio::fs::try_exists(&self.session_dir).await? {
            tokio::fs::remove_dir_all(&self.session_dir)
                .await
                .map_err(|e| {
                    RelayError::Backend(format!(
                        "failed to remove session at {}: {e}",
                        self.session_dir.display()
                    ))
                })?;
            info!(
                "WhatsApp {}: deleted session at {}",
                self.identity,
                self.session_dir.display()
            );
        }
        Ok(())
    }

    async fn close(&self) {
        self.events.lock().await.take();
        // The keepalive task holds its own `Arc<Client>`; only `disconnect`
        // drops the socket and ends it.
        let client = self.client.lock().await.take();
        if let Some(client) = client {
            client.disconnect().await;
            info!("WhatsApp {}: disconnected", self.identity);
        }
        if let Some(handle) = self.run_handle.lock().await.take() {
            handle.abort();
            info!("WhatsApp {}: bot stopped", self.identity);
        }
    }
}
