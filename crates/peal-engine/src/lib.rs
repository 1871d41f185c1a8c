//! Per-party negotiation engine.
//!
//! One engine instance drives one participant's side of a call: it acquires
//! local media, creates and applies session descriptions, relays and buffers
//! connectivity candidates, and reports connectivity transitions back to the
//! signaling service. It reconciles exclusively against record snapshots
//! from the service's change feed; it never writes call state directly.

#![forbid(unsafe_code)]

pub mod engine;
pub mod media;
pub mod transport;

pub use engine::CallEngine;
pub use media::{AudioTrack, MediaSource};
pub use transport::{PeerTransport, TransportEvent, TransportFactory};
