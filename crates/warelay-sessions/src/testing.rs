//! In-process fake backend for exercising the registry and router
//! without a live WhatsApp connection.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use warelay_core::{
    error::RelayError,
    session::LifecycleEvent,
    traits::{OpenedSession, SessionBackend, SessionClient},
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A scripted client that records what it was asked to do.
#[derive(Default)]
pub struct FakeClient {
    sent: Mutex<Vec<(String, String)>>,
    send_error: Mutex<Option<String>>,
    logout_error: Mutex<Option<String>>,
    hang: AtomicBool,
    closed: AtomicBool,
    disconnects: AtomicUsize,
    logged_out: AtomicBool,
    events: Mutex<Option<mpsc::Sender<LifecycleEvent>>>,
}

impl FakeClient {
    /// Every subsequent send fails with `reason`.
    pub fn fail_sends(&self, reason: &str) {
        *lock(&self.send_error) = Some(reason.to_string());
    }

    /// The next logouts fail with `reason`.
    pub fn fail_logout(&self, reason: &str) {
        *lock(&self.logout_error) = Some(reason.to_string());
    }

    /// Sends and logouts never complete.
    pub fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    /// `(chat_id, body)` pairs delivered so far.
    pub fn sent(&self) -> Vec<(String, String)> {
        lock(&self.sent).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// How many times the live connection was torn down.
    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn is_logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }

    async fn stall_if_hung(&self) {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl SessionClient for FakeClient {
    async fn send_text(&self, chat_id: &str, body: &str) -> Result<(), RelayError> {
        self.stall_if_hung().await;
        if let Some(reason) = lock(&self.send_error).clone() {
            return Err(RelayError::Backend(reason));
        }
        lock(&self.sent).push((chat_id.to_string(), body.to_string()));
        Ok(())
    }

    async fn logout(&self) -> Result<(), RelayError> {
        self.stall_if_hung().await;
        if let Some(reason) = lock(&self.logout_error).clone() {
            return Err(RelayError::Backend(reason));
        }
        self.close().await;
        self.logged_out.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
        lock(&self.events).take();
    }
}

/// A backend whose sessions are driven by the test through [`FakeBackend::emit`].
#[derive(Default)]
pub struct FakeBackend {
    clients: Mutex<HashMap<String, Arc<FakeClient>>>,
    open_error: Mutex<Option<String>>,
    open_hang: AtomicBool,
    initial_events: Mutex<Vec<LifecycleEvent>>,
    opened: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent `open` fails with `reason`.
    pub fn fail_open(&self, reason: &str) {
        *lock(&self.open_error) = Some(reason.to_string());
    }

    /// Every subsequent `open` never resolves.
    pub fn hang_open(&self) {
        self.open_hang.store(true, Ordering::SeqCst);
    }

    /// Events queued on every newly opened session before `open` returns.
    pub fn with_initial_events(self, events: Vec<LifecycleEvent>) -> Self {
        *lock(&self.initial_events) = events;
        self
    }

    /// Number of successful `open` calls.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// The most recent client opened for `identity`.
    pub fn client(&self, identity: &str) -> Option<Arc<FakeClient>> {
        lock(&self.clients).get(identity).cloned()
    }

    /// Push a lifecycle event into `identity`'s session. Returns false if
    /// the session is unknown or its stream is already closed.
    pub async fn emit(&self, identity: &str, event: LifecycleEvent) -> bool {
        let tx = self.client(identity).and_then(|client| {
            let tx = lock(&client.events).clone();
            tx
        });
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl SessionBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    async fn open(&self, identity: &str) -> Result<OpenedSession, RelayError> {
        if self.open_hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if let Some(reason) = lock(&self.open_error).clone() {
            return Err(RelayError::Backend(reason));
        }

        let (tx, rx) = mpsc::channel(16);
        for event in lock(&self.initial_events).iter().cloned() {
            let _ = tx.try_send(event);
        }

        let client = Arc::new(FakeClient::default());
        *lock(&client.events) = Some(tx);
        lock(&self.clients).insert(identity.to_string(), client.clone());
        self.opened.fetch_add(1, Ordering::SeqCst);

        Ok(OpenedSession {
            client,
            events: rx,
        })
    }
}

/// Poll `check` until it returns true or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
