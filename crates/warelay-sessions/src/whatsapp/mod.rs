//! WhatsApp backend: linked-device sessions via `whatsapp-rust`.
//!
//! Uses the WhatsApp Web protocol (Noise handshake + Signal encryption).
//! Login is done by scanning a QR code from the phone's "Linked devices" screen.
//! Each identity persists its credentials to
//! `{data_dir}/sessions/{identity}/whatsapp.db`.

mod bot;
mod client;


pub use client::WhatsAppClient;

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;
use warelay_core::{
    config::shellexpand,
    error::RelayError,
    traits::{OpenedSession, SessionBackend},
};

use crate::registry::validate_instance_id;

/// Server part the HTTP API uses for individual contacts.
const API_CONTACT_SERVER: &str = "c.us";
/// Server part the protocol uses for individual contacts.
const PROTOCOL_CONTACT_SERVER: &str = "s.whatsapp.net";

/// Opens one `whatsapp-rust` bot per identity.
pub struct WhatsAppBackend {
    data_dir: String,
    device_name: String,
}

impl WhatsAppBackend {
    pub fn new(data_dir: &str, device_name: &str) -> Self {
        Self {
            data_dir: data_dir.to_string(),
            device_name: device_name.to_string(),
        }
    }

    /// Directory holding `identity`'s credentials.
    pub fn session_dir(&self, identity: &str) -> PathBuf {
        PathBuf::from(shellexpand(&self.data_dir))
            .join("sessions")
            .join(identity)
    }
}

#[async_trait]
impl SessionBackend for WhatsAppBackend {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn open(&self, identity: &str) -> Result<OpenedSession, RelayError> {
        validate_instance_id(identity)?;
        let session_dir = self.session_dir(identity);
        tokio::fs::create_dir_all(&session_dir).await?;
        info!(
            "WhatsApp session {identity} starting (store: {})",
            session_dir.display()
        );
        bot::start(identity, session_dir, &self.device_name).await
    }
}

/// Translate an API chat id (`123@c.us`) into the protocol's JID form
/// (`123@s.whatsapp.net`). Other servers (groups, broadcasts) pass through.
pub(crate) fn to_protocol_jid(chat_id: &str) -> String {
    match chat_id.rsplit_once('@') {
        Some((user, API_CONTACT_SERVER)) => format!("{user}@{PROTOCOL_CONTACT_SERVER}"),
        _ => chat_id.to_string(),
    }
}
