//! Peal signaling core.
//!
//! The authoritative state machine for two-party audio calls: a persistent
//! call record store, the mutation/query surface over it, the per-role
//! candidate relay, and a broadcast change feed that negotiation engines
//! subscribe to. All record writes go through [`CallService`]; engines never
//! touch the store directly.

#![forbid(unsafe_code)]

pub mod guard;
pub mod service;
pub mod store;

pub use service::{CallService, CandidateOutcome};
