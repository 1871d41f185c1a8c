use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identity of a registered user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifier of a call record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id for a new call record.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Which side of the call a party is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Callee,
}

impl CallRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallRole::Caller => "caller",
            CallRole::Callee => "callee",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "caller" => Some(CallRole::Caller),
            "callee" => Some(CallRole::Callee),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            CallRole::Caller => CallRole::Callee,
            CallRole::Callee => CallRole::Caller,
        }
    }
}

impl std::fmt::Display for CallRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a call record.
///
/// The set is closed: unknown status text coming out of the store is a
/// decode error, never a silent passthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Created by initiate; waiting for the callee.
    Ringing,
    /// Callee accepted and published an answer; transport still connecting.
    Answered,
    /// Either party observed a live peer connection.
    Connected,
    /// Declined by the callee or cancelled by the caller while ringing.
    Declined,
    /// Torn down from an active state by either party.
    Ended,
    /// Recorded when the callee was already in another call. Never produced
    /// by the current operations (initiate rejects with a busy error before
    /// any record exists); kept for store parity with recorded history.
    Busy,
    /// Reserved for a server-side failure classifier.
    Failed,
    /// Ring timeout elapsed before the callee answered.
    Missed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Answered => "answered",
            CallStatus::Connected => "connected",
            CallStatus::Declined => "declined",
            CallStatus::Ended => "ended",
            CallStatus::Busy => "busy",
            CallStatus::Failed => "failed",
            CallStatus::Missed => "missed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ringing" => Some(CallStatus::Ringing),
            "answered" => Some(CallStatus::Answered),
            "connected" => Some(CallStatus::Connected),
            "declined" => Some(CallStatus::Declined),
            "ended" => Some(CallStatus::Ended),
            "busy" => Some(CallStatus::Busy),
            "failed" => Some(CallStatus::Failed),
            "missed" => Some(CallStatus::Missed),
            _ => None,
        }
    }

    /// A session the busy guard counts against its participants.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            CallStatus::Ringing | CallStatus::Answered | CallStatus::Connected
        )
    }

    /// No further transition is permitted out of these states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Declined | CallStatus::Ended | CallStatus::Missed | CallStatus::Failed
        )
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification tags recorded when a call reaches a terminal status.
pub mod end_reason {
    pub const DECLINED_BY_CALLEE: &str = "declined_by_callee";
    pub const CANCELLED_BY_CALLER: &str = "cancelled_by_caller";
    pub const ENDED_BY_CALLER: &str = "ended_by_caller";
    pub const ENDED_BY_CALLEE: &str = "ended_by_callee";
    pub const RING_TIMEOUT: &str = "ring_timeout";
}

/// Whether a session description proposes or accepts a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A party's proposed media session parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One possible network path endpoint for the peer-to-peer transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Full state of one call record as stored by the signaling service.
///
/// This is the unit the record store persists and the change feed publishes;
/// engines reconcile exclusively against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSnapshot {
    pub id: CallId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub status: CallStatus,
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
    pub caller_candidates: Vec<IceCandidate>,
    pub callee_candidates: Vec<IceCandidate>,
    pub ended_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CallSnapshot {
    pub fn participant_role(&self, user: &UserId) -> Option<CallRole> {
        if &self.caller_id == user {
            Some(CallRole::Caller)
        } else if &self.callee_id == user {
            Some(CallRole::Callee)
        } else {
            None
        }
    }

    pub fn is_participant(&self, user: &UserId) -> bool {
        self.participant_role(user).is_some()
    }

    pub fn candidates_for(&self, role: CallRole) -> &[IceCandidate] {
        match role {
            CallRole::Caller => &self.caller_candidates,
            CallRole::Callee => &self.callee_candidates,
        }
    }
}

/// Messages on the gateway's record-subscription socket.
///
/// A client binds with its session token, then receives a `Call` snapshot
/// every time a record it participates in changes.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", content = "payload")]
pub enum FeedMessage {
    Bind { token: String },
    Bound,
    Call { call: CallSnapshot },
    Error { message: String },
}
