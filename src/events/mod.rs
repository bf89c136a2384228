//! Event stream: the closed event taxonomy, append-only log store, and
//! session-scoped plus global publish channels.
//!
//! The event stream is the canonical coordination medium between components;
//! observers subscribe instead of being wired in directly.

pub mod store;
pub mod types;

pub use store::{LogStore, MemoryLogStore};
pub use types::{EventType, LogEntry, LogFilter};
