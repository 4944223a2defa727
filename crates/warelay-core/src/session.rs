//! Session lifecycle: events emitted by a messaging client and the
//! state machine they drive.

use serde::{Deserialize, Serialize};

/// A lifecycle notification from the underlying messaging client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A login QR payload was issued (rotates until scanned).
    QrIssued(String),
    /// The session is authenticated and can send.
    Ready,
    /// Authentication failed or the device was unlinked.
    AuthFailed(String),
    /// The connection was lost.
    Disconnected(String),
}

impl LifecycleEvent {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QrIssued(_) => "qr-issued",
            Self::Ready => "ready",
            Self::AuthFailed(_) => "auth-failed",
            Self::Disconnected(_) => "disconnected",
        }
    }
}

/// Where a session is in its login lifecycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    #[default]
    Initializing,
    AwaitingQrScan,
    Ready,
    Failed,
    Disconnected,
}

/// Side effect the owner of a session must carry out after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEffect {
    None,
    /// Encode and cache this QR payload.
    CacheQr(String),
    /// Drop any cached QR.
    ClearQr,
    /// Purge the session from the registry and QR cache.
    Remove(String),
}

impl SessionState {
    /// `Failed` and `Disconnected` accept no further events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Disconnected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::AwaitingQrScan => "awaiting-qr-scan",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Disconnected => "disconnected",
        }
    }

    /// Apply an event, returning the next state and the effect to execute.
    pub fn apply(self, event: LifecycleEvent) -> (SessionState, SessionEffect) {
        if self.is_terminal() {
            return (self, SessionEffect::None);
        }
        match event {
            LifecycleEvent::QrIssued(payload) => {
                (Self::AwaitingQrScan, SessionEffect::CacheQr(payload))
            }
            LifecycleEvent::Ready => (Self::Ready, SessionEffect::ClearQr),
            LifecycleEvent::AuthFailed(reason) => (Self::Failed, SessionEffect::Remove(reason)),
            LifecycleEvent::Disconnected(reason) => {
                (Self::Disconnected, SessionEffect::Remove(reason))
            }
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
