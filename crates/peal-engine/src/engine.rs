//! The reactive call engine.
//!
//! Single task per participant. Inputs are record snapshots from the
//! signaling feed and events from the local transport; every state change
//! flows through [`CallEngine::handle_snapshot`] or
//! [`CallEngine::handle_transport_event`], so the ordering of local effects
//! is exactly the arrival order of those inputs.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use peal_common::{
    CallId, CallRole, CallSnapshot, CallStatus, Error, IceCandidate, Result, UserId,
};
use peal_core::{CallService, CandidateOutcome};

use crate::media::{AudioTrack, MediaSource};
use crate::transport::{PeerTransport, TransportEvent, TransportFactory};

const TRANSPORT_EVENT_CAPACITY: usize = 64;

/// Per-call local state. Exists from the moment a call is started or an
/// incoming ring is observed until teardown.
struct CallSession {
    id: CallId,
    role: CallRole,
    transport: Option<Box<dyn PeerTransport>>,
    track: Option<AudioTrack>,
    /// Whether the remote description has been applied to the transport.
    remote_applied: bool,
    /// Remote candidates that arrived before the remote description,
    /// tagged with the role they came from, in arrival order.
    pending: Vec<(CallRole, IceCandidate)>,
    /// How many of the remote role's stored candidates have been taken
    /// (applied or buffered). Snapshots re-deliver the full list, so the
    /// cursor is what makes application exactly-once.
    consumed_remote: usize,
    /// Connectivity has been reported upstream once.
    promoted: bool,
    snapshot: Option<CallSnapshot>,
}

impl CallSession {
    fn incoming(snapshot: CallSnapshot) -> Self {
        Self {
            id: snapshot.id.clone(),
            role: CallRole::Callee,
            transport: None,
            track: None,
            remote_applied: false,
            pending: Vec::new(),
            consumed_remote: 0,
            promoted: false,
            snapshot: Some(snapshot),
        }
    }

    fn outgoing(id: CallId, transport: Box<dyn PeerTransport>, track: AudioTrack) -> Self {
        Self {
            id,
            role: CallRole::Caller,
            transport: Some(transport),
            track: Some(track),
            remote_applied: false,
            pending: Vec::new(),
            consumed_remote: 0,
            promoted: false,
            snapshot: None,
        }
    }

    fn status(&self) -> Option<CallStatus> {
        self.snapshot.as_ref().map(|s| s.status)
    }
}

pub struct CallEngine {
    me: UserId,
    service: Arc<CallService>,
    updates: Option<broadcast::Receiver<CallSnapshot>>,
    factory: Box<dyn TransportFactory>,
    media: Box<dyn MediaSource>,
    transport_events_tx: mpsc::Sender<TransportEvent>,
    transport_events: Option<mpsc::Receiver<TransportEvent>>,
    session: Option<CallSession>,
    status_mirror: Option<CallStatus>,
    last_error: Option<String>,
}

impl CallEngine {
    pub fn new(
        me: UserId,
        service: Arc<CallService>,
        factory: Box<dyn TransportFactory>,
        media: Box<dyn MediaSource>,
    ) -> Self {
        let updates = service.subscribe();
        let (transport_events_tx, transport_events) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
        Self {
            me,
            service,
            updates: Some(updates),
            factory,
            media,
            transport_events_tx,
            transport_events: Some(transport_events),
            session: None,
            status_mirror: None,
            last_error: None,
        }
    }

    /// UI-facing status mirror; `None` outside a call.
    pub fn status(&self) -> Option<CallStatus> {
        self.status_mirror
    }

    pub fn current_call(&self) -> Option<&CallSnapshot> {
        self.session.as_ref().and_then(|s| s.snapshot.as_ref())
    }

    /// A ringing call naming this party as callee, not yet accepted.
    pub fn incoming_call(&self) -> Option<&CallSnapshot> {
        let session = self.session.as_ref()?;
        if session.role == CallRole::Callee && session.transport.is_none() {
            session
                .snapshot
                .as_ref()
                .filter(|s| s.status == CallStatus::Ringing)
        } else {
            None
        }
    }

    pub fn microphone_busy(&self) -> bool {
        self.session
            .as_ref()
            .map(|s| s.track.is_some())
            .unwrap_or(false)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Place an outgoing call: acquire media, create the local offer, then
    /// register the call with the signaling service.
    ///
    /// Refuses locally while any session or media handle is still held,
    /// without a round trip to the service.
    pub async fn start_call(&mut self, callee: &UserId) -> Result<CallId> {
        if self.session.is_some() || self.microphone_busy() {
            return Err(Error::Busy {
                role: CallRole::Caller,
            });
        }

        let mut track = self.media.acquire()?;
        let mut transport = match self.factory.create(self.transport_events_tx.clone()) {
            Ok(transport) => transport,
            Err(err) => {
                track.stop();
                return Err(err);
            }
        };

        let offer = transport
            .add_local_audio(&track)
            .and_then(|()| transport.create_offer());
        let offer = match offer {
            Ok(offer) => offer,
            Err(err) => {
                transport.close();
                track.stop();
                return Err(err);
            }
        };

        match self.service.initiate(&self.me, callee, offer).await {
            Ok(id) => {
                debug!(call = %id, callee = %callee, "outgoing call started");
                self.session = Some(CallSession::outgoing(id.clone(), transport, track));
                self.status_mirror = Some(CallStatus::Ringing);
                Ok(id)
            }
            Err(err) => {
                transport.close();
                track.stop();
                Err(err)
            }
        }
    }

    /// Accept the currently ringing incoming call: acquire media, apply the
    /// stored offer as the remote description, publish the local answer.
    pub async fn accept(&mut self) -> Result<()> {
        let (call_id, offer) = {
            let Some(session) = self.session.as_ref() else {
                return Err(Error::not_found("no incoming call"));
            };
            if session.role != CallRole::Callee || session.transport.is_some() {
                return Err(Error::InvalidState {
                    status: session.status().unwrap_or(CallStatus::Ringing),
                });
            }
            let offer = session
                .snapshot
                .as_ref()
                .and_then(|s| s.offer.clone())
                .ok_or_else(|| Error::connectivity("call has no offer to apply"))?;
            (session.id.clone(), offer)
        };

        let mut track = match self.media.acquire() {
            Ok(track) => track,
            Err(err) => {
                self.last_error = Some("microphone denied or unavailable".to_string());
                self.fail_call("media acquisition").await;
                return Err(err);
            }
        };

        let setup = (|| {
            let mut transport = self.factory.create(self.transport_events_tx.clone())?;
            transport.add_local_audio(&track)?;
            transport.apply_remote_description(&offer)?;
            let answer = transport.create_answer()?;
            Ok::<_, Error>((transport, answer))
        })();
        let (transport, answer) = match setup {
            Ok(parts) => parts,
            Err(err) => {
                track.stop();
                self.last_error = Some("failed to set up call resources".to_string());
                self.fail_call("transport setup").await;
                return Err(err);
            }
        };

        {
            let session = self
                .session
                .as_mut()
                .expect("session disappeared during accept");
            session.track = Some(track);
            session.transport = Some(transport);
            session.remote_applied = true;
            Self::flush_pending(session);
        }

        if let Err(err) = self.service.answer(&self.me, &call_id, answer).await {
            self.last_error = Some("answer was not accepted".to_string());
            self.fail_call("answer rejected").await;
            return Err(err);
        }
        self.status_mirror = Some(CallStatus::Answered);
        Ok(())
    }

    /// Decline the current ringing call (or cancel it, on the caller side).
    /// Local resources are released before the service round trip.
    pub async fn decline(&mut self) -> Result<()> {
        let Some(id) = self.session.as_ref().map(|s| s.id.clone()) else {
            return Ok(());
        };
        self.teardown();
        let result = self.service.decline(&self.me, &id).await;
        if let Err(err) = &result {
            warn!(call = %id, "decline did not reach the service: {err}");
        }
        result
    }

    /// End the current call. Local resources are released before the
    /// service round trip; a duplicate hang-up is a no-op.
    pub async fn hang_up(&mut self) -> Result<()> {
        let Some(id) = self.session.as_ref().map(|s| s.id.clone()) else {
            return Ok(());
        };
        self.teardown();
        let result = self.service.end(&self.me, &id).await;
        if let Err(err) = &result {
            warn!(call = %id, "hang-up did not reach the service: {err}");
        }
        result
    }

    /// Clear a surfaced error and release anything still held.
    pub fn dismiss_error(&mut self) {
        self.last_error = None;
        self.teardown();
    }

    /// Feed one record snapshot through the engine.
    pub async fn handle_snapshot(&mut self, snapshot: CallSnapshot) {
        if !snapshot.is_participant(&self.me) {
            return;
        }

        let current = self.session.as_ref().map(|s| s.id.clone());
        match current {
            None => {
                if snapshot.callee_id == self.me && snapshot.status == CallStatus::Ringing {
                    debug!(call = %snapshot.id, caller = %snapshot.caller_id, "incoming call");
                    self.status_mirror = Some(CallStatus::Ringing);
                    self.session = Some(CallSession::incoming(snapshot));
                }
                // Anything else without a session is a stale record.
            }
            Some(id) if id == snapshot.id => self.apply_snapshot(snapshot),
            Some(_) => {
                debug!(call = %snapshot.id, "snapshot for another call while one is active");
            }
        }
    }

    fn apply_snapshot(&mut self, snapshot: CallSnapshot) {
        if snapshot.status.is_terminal() {
            debug!(call = %snapshot.id, status = %snapshot.status, "call reached terminal status");
            self.teardown();
            return;
        }
        self.status_mirror = Some(snapshot.status);

        let session = self
            .session
            .as_mut()
            .expect("apply_snapshot requires a session");

        // Caller side: the answer is the remote description, applied once.
        if session.role == CallRole::Caller && !session.remote_applied {
            if let (Some(answer), Some(transport)) =
                (snapshot.answer.as_ref(), session.transport.as_mut())
            {
                match transport.apply_remote_description(answer) {
                    Ok(()) => {
                        session.remote_applied = true;
                        Self::flush_pending(session);
                    }
                    Err(err) => {
                        warn!(call = %snapshot.id, "failed to apply remote answer: {err}");
                        self.last_error = Some("failed to process call answer".to_string());
                        return;
                    }
                }
            }
        }

        // Take only the tail of the remote role's list beyond the cursor;
        // earlier entries were already applied or buffered.
        let remote_role = session.role.opposite();
        let remote = snapshot.candidates_for(remote_role);
        if session.consumed_remote < remote.len() {
            for candidate in &remote[session.consumed_remote..] {
                if session.remote_applied {
                    if let Some(transport) = session.transport.as_mut() {
                        if let Err(err) = transport.add_remote_candidate(candidate) {
                            warn!(call = %snapshot.id, "failed to apply remote candidate: {err}");
                        }
                    }
                } else {
                    session.pending.push((remote_role, candidate.clone()));
                }
            }
            session.consumed_remote = remote.len();
        }

        session.snapshot = Some(snapshot);
    }

    /// Feed one local transport event through the engine.
    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Candidate(candidate) => self.relay_local_candidate(candidate).await,
            TransportEvent::Connected => self.promote_connected().await,
            TransportEvent::Disconnected => self.handle_transport_loss("disconnected").await,
            TransportEvent::Failed => self.handle_transport_loss("failed").await,
            TransportEvent::Closed => self.handle_transport_loss("closed").await,
        }
    }

    async fn relay_local_candidate(&mut self, candidate: IceCandidate) {
        let Some((id, role)) = self.session.as_ref().map(|s| (s.id.clone(), s.role)) else {
            debug!("dropping local candidate with no active call");
            return;
        };
        match self
            .service
            .send_candidate(&self.me, &id, role, candidate)
            .await
        {
            Ok(CandidateOutcome::Stored) => {}
            Ok(CandidateOutcome::Ignored) => {
                debug!(call = %id, "local candidate ignored after teardown")
            }
            Err(err) => warn!(call = %id, "failed to relay local candidate: {err}"),
        }
    }

    async fn promote_connected(&mut self) {
        let id = {
            let Some(session) = self.session.as_mut() else {
                return;
            };
            if session.promoted {
                // A second live-connection report changes nothing.
                return;
            }
            let status = session.status().or(self.status_mirror);
            let eligible = match status {
                Some(CallStatus::Answered) => true,
                // The caller's transport can come up before the answered
                // mutation lands.
                Some(CallStatus::Ringing) => session.role == CallRole::Caller,
                _ => false,
            };
            if !eligible {
                return;
            }
            session.promoted = true;
            session.id.clone()
        };

        match self.service.mark_connected(&self.me, &id).await {
            Ok(true) => self.status_mirror = Some(CallStatus::Connected),
            Ok(false) => debug!(call = %id, "connect report not applied by the service"),
            Err(err) => warn!(call = %id, "failed to report connectivity: {err}"),
        }
    }

    async fn handle_transport_loss(&mut self, label: &str) {
        if self.session.is_none() {
            return;
        }
        self.last_error = Some(format!("call {label}"));
        self.fail_call(label).await;
    }

    /// Release local resources, then best-effort end the call upstream.
    /// Release never waits on the service acknowledging anything.
    async fn fail_call(&mut self, context: &str) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let id = session.id.clone();
        let terminal = session
            .status()
            .map(|status| status.is_terminal())
            .unwrap_or(false);
        self.teardown();
        if !terminal {
            if let Err(err) = self.service.end(&self.me, &id).await {
                warn!(call = %id, context, "failed to end call during local failure: {err}");
            }
        }
    }

    /// Release the transport session and the media track, drop any buffered
    /// candidates, and clear the status mirror. Safe from any state, any
    /// number of times.
    pub fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Some(mut transport) = session.transport.take() {
                transport.close();
            }
            if let Some(mut track) = session.track.take() {
                track.stop();
            }
        }
        self.status_mirror = None;
    }

    fn flush_pending(session: &mut CallSession) {
        if session.pending.is_empty() {
            return;
        }
        let Some(transport) = session.transport.as_mut() else {
            return;
        };
        for (role, candidate) in session.pending.drain(..) {
            if let Err(err) = transport.add_remote_candidate(&candidate) {
                warn!(%role, "failed to apply buffered candidate: {err}");
            }
        }
    }

    /// Event loop: consume the record feed and transport events until the
    /// feed closes. May only be called once per engine.
    pub async fn run(&mut self) {
        let mut updates = self.updates.take().expect("run may only be called once");
        let mut transport_events = self
            .transport_events
            .take()
            .expect("run may only be called once");

        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Ok(snapshot) => self.handle_snapshot(snapshot).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "record feed lagged, resyncing from the store");
                        self.resync().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = transport_events.recv() => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => break,
                },
            }
        }
    }

    /// Re-read authoritative state after missing feed messages.
    async fn resync(&mut self) {
        let fetched = match self.session.as_ref() {
            Some(session) => self.service.call_details(&self.me, &session.id).await,
            None => self.service.my_active_call(&self.me).await,
        };
        match fetched {
            Ok(Some(snapshot)) => self.handle_snapshot(snapshot).await,
            Ok(None) => {}
            Err(err) => warn!("failed to resync after feed lag: {err}"),
        }
    }
}
