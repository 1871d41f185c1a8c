//! Peer transport seam.
//!
//! The engine drives the local side of the peer-to-peer transport through
//! this trait and hears back through an event channel handed to the factory
//! at creation time, so a transport implementation never calls into the
//! engine directly.

use tokio::sync::mpsc;

use peal_common::{IceCandidate, Result, SessionDescription};

use crate::media::AudioTrack;

/// Events a local transport session reports back to its engine.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A locally gathered connectivity candidate to relay to the peer.
    Candidate(IceCandidate),
    /// The peer connection reached a live state.
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// One local transport session for one call.
pub trait PeerTransport: Send {
    fn add_local_audio(&mut self, track: &AudioTrack) -> Result<()>;
    fn create_offer(&mut self) -> Result<SessionDescription>;
    fn create_answer(&mut self) -> Result<SessionDescription>;
    fn apply_remote_description(&mut self, description: &SessionDescription) -> Result<()>;
    fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<()>;
    /// Tear the session down. Safe to call more than once.
    fn close(&mut self);
}

/// Creates a transport session wired to the engine's event channel.
pub trait TransportFactory: Send {
    fn create(&self, events: mpsc::Sender<TransportEvent>) -> Result<Box<dyn PeerTransport>>;
}
