//! Instance registry: owns every live session and its login QR.
//!
//! Created once at startup and handed to the router. Lifecycle events from
//! each client are pumped through the session's state machine on a
//! background task; failures and disconnects purge the entry.


use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use warelay_core::{
    config::SessionsConfig,
    error::RelayError,
    session::{LifecycleEvent, SessionEffect},
    traits::SessionBackend,
};

use crate::handle::{underlying, InstanceStatus, SessionHandle};
use crate::qr::qr_data_url;
use crate::qr_cache::QrCache;

/// Called with `(instance_id, raw_payload)` whenever a session issues a QR.
pub type QrListener = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Instance ids double as on-disk session names: 1-64 ASCII alphanumerics, `-` or `_`.
pub fn validate_instance_id(instance_id: &str) -> Result<(), RelayError> {
    let valid = !instance_id.is_empty()
        && instance_id.len() <= 64
        && instance_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(RelayError::BadRequest(format!(
            "invalid instance id '{instance_id}'"
        )))
    }
}

fn maps_to(sessions: &HashMap<String, Arc<SessionHandle>>, handle: &Arc<SessionHandle>) -> bool {
    sessions
        .get(handle.identity())
        .is_some_and(|current| Arc::ptr_eq(current, handle))
}

/// Limits and timeouts applied to every session.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub max_instances: usize,
    pub init_timeout: Duration,
    pub send_timeout: Duration,
    pub logout_timeout: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self::from(&SessionsConfig::default())
    }
}

impl From<&SessionsConfig> for RegistryOptions {
    fn from(cfg: &SessionsConfig) -> Self {
        Self {
            max_instances: cfg.max_instances,
            init_timeout: cfg.init_timeout(),
            send_timeout: cfg.send_timeout(),
            logout_timeout: cfg.logout_timeout(),
        }
    }
}

struct Inner {
    backend: Arc<dyn SessionBackend>,
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
    qr: QrCache,
    options: RegistryOptions,
    qr_listener: Option<QrListener>,
}

/// Map of instance id → session handle with a capacity ceiling.
#[derive(Clone)]
pub struct InstanceRegistry {
    inner: Arc<Inner>,
}

impl InstanceRegistry {
    pub fn new(backend: Arc<dyn SessionBackend>, options: RegistryOptions) -> Self {
        Self::build(backend, options, None)
    }

    /// Like [`InstanceRegistry::new`], additionally reporting raw QR payloads
    /// to `listener` (e.g. to print them on a terminal).
    pub fn with_qr_listener(
        backend: Arc<dyn SessionBackend>,
        options: RegistryOptions,
        listener: impl Fn(&str, &str) + Send + Sync + 'static,
    ) -> Self {
        Self::build(backend, options, Some(Arc::new(listener)))
    }

    fn build(
        backend: Arc<dyn SessionBackend>,
        options: RegistryOptions,
        qr_listener: Option<QrListener>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                sessions: Mutex::new(HashMap::new()),
                qr: QrCache::new(),
                options,
                qr_listener,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.options.max_instances
    }

    pub async fn len(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.sessions.lock().await.is_empty()
    }

    pub async fn contains(&self, instance_id: &str) -> bool {
        self.inner.sessions.lock().await.contains_key(instance_id)
    }

    /// Provision a session for `instance_id` and wait for its client to start.
    ///
    /// Re-provisioning an existing id returns the existing handle. The entry
    /// is registered before the client opens so in-flight sessions count
    /// toward capacity; a failed or timed-out open leaves no entry behind.
    pub async fn create(&self, instance_id: &str) -> Result<Arc<SessionHandle>, RelayError> {
        validate_instance_id(instance_id)?;
        let handle = {
            let mut sessions = self.inner.sessions.lock().await;
            if let Some(existing) = sessions.get(instance_id) {
                info!("instance {instance_id} already provisioned, reusing");
                return Ok(existing.clone());
            }
            let limit = self.inner.options.max_instances;
            if sessions.len() >= limit {
                warn!("instance {instance_id} rejected: {limit} session(s) already active");
                return Err(RelayError::CapacityExceeded { limit });
            }
            let handle = Arc::new(SessionHandle::new(instance_id));
            sessions.insert(instance_id.to_string(), handle.clone());
            handle
        };

        info!(
            "instance {instance_id}: initializing via {} backend",
            self.inner.backend.name()
        );

        let init_timeout = self.inner.options.init_timeout;
        let opened =
            match tokio::time::timeout(init_timeout, self.inner.backend.open(instance_id)).await {
                Ok(Ok(opened)) => opened,
                Ok(Err(e)) => {
                    error!("instance {instance_id}: initialization failed: {e}");
                    self.remove_if_current(&handle).await;
                    return Err(RelayError::InitializationFailed(underlying(e)));
                }
                Err(_) => {
                    error!(
                        "instance {instance_id}: initialization timed out after {}s",
                        init_timeout.as_secs()
                    );
                    self.remove_if_current(&handle).await;
                    return Err(RelayError::InitializationFailed(format!(
                        "timed out after {}s",
                        init_timeout.as_secs()
                    )));
                }
            };

        handle.attach(opened.client.clone()).await;

        // Removed while opening (shutdown or a concurrent logout).
        if !self.is_current(&handle).await {
            opened.client.close().await;
            return Err(RelayError::InitializationFailed(format!(
                "instance '{instance_id}' was removed during initialization"
            )));
        }

        self.spawn_event_pump(handle.clone(), opened.events);
        info!("instance {instance_id}: client started");
        Ok(handle)
    }

    /// Look up a session.
    pub async fn get(&self, instance_id: &str) -> Result<Arc<SessionHandle>, RelayError> {
        self.inner
            .sessions
            .lock()
            .await
            .get(instance_id)
            .cloned()
            .ok_or_else(|| RelayError::NotFound(instance_id.to_string()))
    }

    /// Delete the entry and its cached QR. Idempotent.
    ///
    /// The removed handle is returned so the caller can close its client.
    pub async fn remove(&self, instance_id: &str) -> Option<Arc<SessionHandle>> {
        let removed = {
            let mut sessions = self.inner.sessions.lock().await;
            let removed = sessions.remove(instance_id);
            self.inner.qr.evict(instance_id).await;
            removed
        };
        if removed.is_some() {
            info!("instance {instance_id} removed");
        }
        removed
    }

    /// Latest QR image (data URL) for `instance_id`, if one is waiting to be scanned.
    pub async fn qr(&self, instance_id: &str) -> Option<String> {
        self.inner.qr.get(instance_id).await
    }

    pub async fn status(&self, instance_id: &str) -> Result<InstanceStatus, RelayError> {
        let handle = self.get(instance_id).await?;
        let has_qr = self.inner.qr.contains(instance_id).await;
        Ok(handle.status(has_qr).await)
    }

    /// Send a message through `instance_id`'s session.
    pub async fn send(
        &self,
        instance_id: &str,
        recipient: &str,
        body: &str,
    ) -> Result<(), RelayError> {
        let handle = self.get(instance_id).await?;
        let result = handle
            .send_message(recipient, body, self.inner.options.send_timeout)
            .await;
        if result.is_err() && handle.state().await.is_terminal() {
            self.purge(&handle).await;
        }
        result
    }

    /// Log `instance_id` out and drop it from the registry.
    ///
    /// On failure the entry stays in place, unless the client stopped
    /// responding altogether.
    pub async fn logout(&self, instance_id: &str) -> Result<(), RelayError> {
        let handle = self.get(instance_id).await?;
        match handle.logout(self.inner.options.logout_timeout).await {
            Ok(()) => {
                self.purge(&handle).await;
                Ok(())
            }
            Err(e) => {
                if handle.state().await.is_terminal() {
                    self.purge(&handle).await;
                }
                Err(e)
            }
        }
    }

    /// Close every session and clear both maps.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<SessionHandle>> = {
            let mut sessions = self.inner.sessions.lock().await;
            self.inner.qr.clear().await;
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            info!("closing instance {}", handle.identity());
            handle.close().await;
        }
    }

    async fn is_current(&self, handle: &Arc<SessionHandle>) -> bool {
        maps_to(&*self.inner.sessions.lock().await, handle)
    }

    /// Remove `handle` only if its id still maps to it, so a stale session
    /// can never purge a re-provisioned one.
    async fn remove_if_current(&self, handle: &Arc<SessionHandle>) -> bool {
        let id = handle.identity();
        {
            let mut sessions = self.inner.sessions.lock().await;
            if !maps_to(&sessions, handle) {
                return false;
            }
            sessions.remove(id);
            self.inner.qr.evict(id).await;
        }
        info!("instance {id} removed");
        true
    }

    async fn purge(&self, handle: &Arc<SessionHandle>) {
        self.remove_if_current(handle).await;
        handle.close().await;
    }

    async fn cache_qr(&self, handle: &Arc<SessionHandle>, payload: &str) {
        let id = handle.identity();
        if let Some(listener) = &self.inner.qr_listener {
            listener(id, payload);
        }
        let data_url = match qr_data_url(payload) {
            Ok(data_url) => data_url,
            Err(e) => {
                warn!("instance {id}: QR encoding failed: {e}");
                return;
            }
        };

        // Cache writes happen under the sessions lock so a concurrent
        // removal cannot be followed by a stale put.
        let sessions = self.inner.sessions.lock().await;
        if maps_to(&sessions, handle) {
            self.inner.qr.put(id, data_url).await;
            info!("instance {id}: QR code issued (scan to log in)");
        }
    }

    async fn clear_qr(&self, handle: &Arc<SessionHandle>) {
        let sessions = self.inner.sessions.lock().await;
        if maps_to(&sessions, handle) {
            self.inner.qr.evict(handle.identity()).await;
        }
    }

    fn spawn_event_pump(
        &self,
        handle: Arc<SessionHandle>,
        mut events: mpsc::Receiver<LifecycleEvent>,
    ) {
        let registry = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match handle.apply(event).await {
                    SessionEffect::None => {}
                    SessionEffect::CacheQr(payload) => registry.cache_qr(&handle, &payload).await,
                    SessionEffect::ClearQr => registry.clear_qr(&handle).await,
                    SessionEffect::Remove(reason) => {
                        warn!("instance {}: session ended ({reason})", handle.identity());
                        registry.purge(&handle).await;
                        break;
                    }
                }
            }
            debug!("instance {}: event stream closed", handle.identity());
        });
    }
}
