//! Offline-capable chat sync for host/cleaner conversations.
//!
//! [`ChatEngine`] ties a local SQLite cache to the remote message API:
//! cached history shows immediately, sends are optimistic and survive
//! restarts through a persistent outbox, and a background loop delivers
//! whatever is queued once the device is back online.

pub mod app;
pub mod config;
pub mod core;

pub use app::{ChatEngine, Conversation, SendReport};
