//! # warelay-sessions
//!
//! Per-instance WhatsApp sessions: the QR login flow, the instance
//! registry, and the backends that drive the actual messaging client.

pub mod handle;
pub mod qr;
pub mod qr_cache;
pub mod recipient;
pub mod registry;
#[doc(hidden)]
pub mod testing;
pub mod whatsapp;

pub use handle::{InstanceStatus, SessionHandle};
pub use qr_cache::QrCache;
pub use recipient::normalize_recipient;
pub use registry::{validate_instance_id, InstanceRegistry, RegistryOptions};
