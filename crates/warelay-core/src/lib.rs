//! # warelay-core
//!
//! Core types, traits, configuration, and error handling for warelay.

pub mod config;
pub mod error;
pub mod session;
pub mod traits;
