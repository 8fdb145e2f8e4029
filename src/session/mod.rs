//! Remote session lifecycle and durable client identity.

pub mod client;
pub mod identity;

pub use client::{HeartbeatOutcome, SessionClient};
pub use identity::ClientIdentity;
