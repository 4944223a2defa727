//! Bot lifecycle: building and running one WhatsApp bot per session.

use super::client::WhatsAppClient;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use wacore::types::events::Event;
use warelay_core::{error::RelayError, session::LifecycleEvent, traits::OpenedSession};
use whatsapp_rust::bot::Bot;
use whatsapp_rust_sqlite_storage::SqliteStore;
use whatsapp_rust_tokio_transport::TokioWebSocketTransportFactory;
use whatsapp_rust_ureq_http_client::UreqHttpClient;

/// Build a bot for `identity`, run it in the background, and hand back
/// the client plus its lifecycle event stream.
pub(super) async fn start(
    identity: &str,
    session_dir: PathBuf,
    device_name: &str,
) -> Result<OpenedSession, RelayError> {
    let db_path = session_dir.join("whatsapp.db");
    let backend = Arc::new(
        SqliteStore::new(&db_path.to_string_lossy())
            .await
            .map_err(|e| RelayError::Backend(format!("whatsapp store init failed: {e}")))?,
    );

    let (tx, rx) = mpsc::channel::<LifecycleEvent>(16);
    // Shared with the event handler; `close()` takes it to end the stream.
    let events: Arc<Mutex<Option<mpsc::Sender<LifecycleEvent>>>> = Arc::new(Mutex::new(Some(tx)));

    let events_for_handler = events.clone();
    let id = identity.to_string();

    let mut bot = Bot::builder()
        .with_backend(backend)
        .with_transport_factory(TokioWebSocketTransportFactory::new())
        .with_http_client(UreqHttpClient::new())
        .with_device_props(
            Some(device_name.to_string()),
            None,
            Some(waproto::whatsapp::device_props::PlatformType::Desktop),
        )
        .on_event(move |event, _client| {
            let events = events_for_handler.clone();
            let id = id.clone();
            async move {
                let mapped = match event {
                    Event::PairingQrCode { code, .. } => {
                        debug!("WhatsApp {id}: QR data: {code}");
                        LifecycleEvent::QrIssued(code)
                    }
                    Event::PairSuccess(_) => {
                        info!("WhatsApp {id}: pairing successful");
                        return;
                    }
                    Event::Connected(_) => LifecycleEvent::Ready,
                    Event::LoggedOut(_) => {
                        LifecycleEvent::AuthFailed("logged out from the phone".into())
                    }
                    Event::Disconnected(_) => {
                        LifecycleEvent::Disconnected("connection lost".into())
                    }
                    _ => return,
                };
                let sender = events.lock().await.clone();
                if let Some(sender) = sender {
                    if sender.send(mapped).await.is_err() {
                        warn!("WhatsApp {id}: lifecycle receiver dropped");
                    }
                }
            }
        })
        .build()
        .await
        .map_err(|e| RelayError::Backend(format!("whatsapp bot build failed: {e}")))?;

    let client = bot.client();

    let run_handle = bot
        .run()
        .await
        .map_err(|e| RelayError::Backend(format!("whatsapp bot run failed: {e}")))?;

    info!("WhatsApp session {identity} bot started");

    Ok(OpenedSession {
        client: Arc::new(WhatsAppClient::new(
            identity,
            session_dir,
            client,
            run_handle,
            events,
        )),
        events: rx,
    })
}
