//! Local media acquisition seam.

use peal_common::Result;

/// Handle on an acquired local audio capture.
#[derive(Debug)]
pub struct AudioTrack {
    id: String,
    stopped: bool,
}

impl AudioTrack {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stopped: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Release the underlying capture. Safe to call more than once.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

/// Source of local audio tracks.
///
/// Acquisition may be denied by the user or the OS; that surfaces as a
/// media-access error and must never crash the engine.
pub trait MediaSource: Send {
    fn acquire(&mut self) -> Result<AudioTrack>;
}
