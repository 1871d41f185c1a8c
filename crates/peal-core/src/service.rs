//! The authoritative mutation/query surface over the call record store.
//!
//! Every operation authorizes the actor against the record's participants
//! before touching it, runs its read-modify-write inside one transaction,
//! and publishes the resulting record snapshot on the change feed. Late
//! teardown calls against already-terminal records succeed as no-ops so two
//! parties racing to end the same call both get a clean result.

use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use peal_common::{
    end_reason, CallId, CallRole, CallSnapshot, CallStatus, Error, IceCandidate, Result,
    SessionDescription, UserId,
};

use crate::guard::UserLocks;
use crate::store;

/// How long a call may ring before the sweep marks it missed.
pub const DEFAULT_RING_TIMEOUT: Duration = Duration::from_secs(30);

const FEED_CAPACITY: usize = 256;

/// Outcome of a candidate submission.
///
/// `Ignored` is the benign case: a candidate that arrived after teardown is
/// expected and dropped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Stored,
    Ignored,
}

pub struct CallService {
    pool: SqlitePool,
    locks: UserLocks,
    feed: broadcast::Sender<CallSnapshot>,
    ring_timeout: Duration,
}

impl CallService {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_ring_timeout(pool, DEFAULT_RING_TIMEOUT)
    }

    pub fn with_ring_timeout(pool: SqlitePool, ring_timeout: Duration) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            pool,
            locks: UserLocks::default(),
            feed,
            ring_timeout,
        }
    }

    /// Subscribe to record snapshots published after every committed
    /// mutation. Each engine holds exactly one subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<CallSnapshot> {
        self.feed.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.feed.receiver_count()
    }

    pub fn ring_timeout(&self) -> Duration {
        self.ring_timeout
    }

    /// Create a new ringing call after checking that neither party already
    /// holds an active one.
    ///
    /// The active-call check and the insert span two records, so they run
    /// under both parties' advisory locks in addition to the transaction.
    pub async fn initiate(
        &self,
        caller: &UserId,
        callee: &UserId,
        offer: SessionDescription,
    ) -> Result<CallId> {
        if caller == callee {
            return Err(Error::SelfCall);
        }

        let _held = self.locks.lock_pair(caller, callee).await;
        let mut tx = self.pool.begin().await.map_err(Error::storage)?;

        if store::active_count_for_user(&mut tx, callee)
            .await
            .map_err(Error::storage)?
            > 0
        {
            return Err(Error::Busy {
                role: CallRole::Callee,
            });
        }
        if store::active_count_for_user(&mut tx, caller)
            .await
            .map_err(Error::storage)?
            > 0
        {
            return Err(Error::Busy {
                role: CallRole::Caller,
            });
        }

        let id = CallId::generate();
        store::insert_call(&mut tx, &id, caller, callee, &offer, Utc::now())
            .await
            .map_err(Error::storage)?;
        tx.commit().await.map_err(Error::storage)?;

        debug!(call = %id, caller = %caller, callee = %callee, "call initiated");
        self.publish(&id).await;
        Ok(id)
    }

    /// Callee accepts a ringing call with its answer description.
    pub async fn answer(
        &self,
        actor: &UserId,
        call_id: &CallId,
        answer: SessionDescription,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::storage)?;
        let row = store::call_row(&mut tx, call_id)
            .await
            .map_err(Error::storage)?
            .ok_or_else(|| Error::not_found(call_id))?;

        if row.callee_id != actor.as_str() {
            return Err(Error::not_authorized("only the callee can answer"));
        }
        let status = row.status().map_err(Error::storage)?;
        if status != CallStatus::Ringing {
            return Err(Error::InvalidState { status });
        }

        let updated = store::set_answered(&mut tx, call_id, &answer)
            .await
            .map_err(Error::storage)?;
        if updated == 0 {
            return Err(Error::InvalidState { status });
        }
        tx.commit().await.map_err(Error::storage)?;

        debug!(call = %call_id, "call answered");
        self.publish(call_id).await;
        Ok(())
    }

    /// Record that the peer transport came up. Only the `answered` to
    /// `connected` edge mutates; anything else is reported as `false`
    /// rather than an error, since both sides race to report first.
    pub async fn mark_connected(&self, actor: &UserId, call_id: &CallId) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(Error::storage)?;
        let row = store::call_row(&mut tx, call_id)
            .await
            .map_err(Error::storage)?
            .ok_or_else(|| Error::not_found(call_id))?;

        if row.caller_id != actor.as_str() && row.callee_id != actor.as_str() {
            return Err(Error::not_authorized("not a participant of this call"));
        }
        let status = row.status().map_err(Error::storage)?;
        if status != CallStatus::Answered {
            warn!(call = %call_id, %status, "connect reported outside answered");
            return Ok(false);
        }

        let updated = store::transition_status(
            &mut tx,
            call_id,
            &[CallStatus::Answered],
            CallStatus::Connected,
            None,
        )
        .await
        .map_err(Error::storage)?;
        if updated == 0 {
            return Ok(false);
        }
        tx.commit().await.map_err(Error::storage)?;

        self.publish(call_id).await;
        Ok(true)
    }

    /// Append a connectivity candidate to the sender's role list.
    pub async fn send_candidate(
        &self,
        actor: &UserId,
        call_id: &CallId,
        role: CallRole,
        candidate: IceCandidate,
    ) -> Result<CandidateOutcome> {
        let mut tx = self.pool.begin().await.map_err(Error::storage)?;
        let row = store::call_row(&mut tx, call_id)
            .await
            .map_err(Error::storage)?
            .ok_or_else(|| Error::not_found(call_id))?;

        let expected = match role {
            CallRole::Caller => &row.caller_id,
            CallRole::Callee => &row.callee_id,
        };
        if expected != actor.as_str() {
            return Err(Error::not_authorized(format!(
                "actor does not hold the {role} role"
            )));
        }

        let status = row.status().map_err(Error::storage)?;
        if !status.is_active() {
            // Candidates trailing in after teardown are expected.
            debug!(call = %call_id, %status, "dropping late candidate");
            return Ok(CandidateOutcome::Ignored);
        }

        store::append_candidate(&mut tx, call_id, role, &candidate, Utc::now())
            .await
            .map_err(Error::storage)?;
        tx.commit().await.map_err(Error::storage)?;

        self.publish(call_id).await;
        Ok(CandidateOutcome::Stored)
    }

    /// Decline (callee) or cancel (caller) a ringing call.
    pub async fn decline(&self, actor: &UserId, call_id: &CallId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::storage)?;
        let row = store::call_row(&mut tx, call_id)
            .await
            .map_err(Error::storage)?
            .ok_or_else(|| Error::not_found(call_id))?;

        if row.caller_id != actor.as_str() && row.callee_id != actor.as_str() {
            return Err(Error::not_authorized("not a participant of this call"));
        }
        let status = row.status().map_err(Error::storage)?;
        if status.is_terminal() {
            // Duplicate teardown from the other side already landed.
            return Ok(());
        }
        if status != CallStatus::Ringing {
            return Err(Error::InvalidState { status });
        }

        let reason = if row.callee_id == actor.as_str() {
            end_reason::DECLINED_BY_CALLEE
        } else {
            end_reason::CANCELLED_BY_CALLER
        };
        let updated = store::transition_status(
            &mut tx,
            call_id,
            &[CallStatus::Ringing],
            CallStatus::Declined,
            Some(reason),
        )
        .await
        .map_err(Error::storage)?;
        if updated == 0 {
            return Err(Error::InvalidState { status });
        }
        tx.commit().await.map_err(Error::storage)?;

        debug!(call = %call_id, reason, "call declined");
        self.publish(call_id).await;
        Ok(())
    }

    /// End a ringing, answered, or connected call. Idempotent on terminal
    /// records: the stored reason is never overwritten by a late call.
    pub async fn end(&self, actor: &UserId, call_id: &CallId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::storage)?;
        let row = store::call_row(&mut tx, call_id)
            .await
            .map_err(Error::storage)?
            .ok_or_else(|| Error::not_found(call_id))?;

        if row.caller_id != actor.as_str() && row.callee_id != actor.as_str() {
            return Err(Error::not_authorized("not a participant of this call"));
        }
        let status = row.status().map_err(Error::storage)?;
        if status.is_terminal() {
            return Ok(());
        }
        if !status.is_active() {
            return Err(Error::InvalidState { status });
        }

        let reason = if row.caller_id == actor.as_str() {
            end_reason::ENDED_BY_CALLER
        } else {
            end_reason::ENDED_BY_CALLEE
        };
        let updated = store::transition_status(
            &mut tx,
            call_id,
            &[
                CallStatus::Ringing,
                CallStatus::Answered,
                CallStatus::Connected,
            ],
            CallStatus::Ended,
            Some(reason),
        )
        .await
        .map_err(Error::storage)?;
        if updated == 0 {
            return Err(Error::InvalidState { status });
        }
        tx.commit().await.map_err(Error::storage)?;

        debug!(call = %call_id, reason, "call ended");
        self.publish(call_id).await;
        Ok(())
    }

    /// Full record for a participant; `None` for an unknown id.
    pub async fn call_details(
        &self,
        actor: &UserId,
        call_id: &CallId,
    ) -> Result<Option<CallSnapshot>> {
        let mut conn = self.pool.acquire().await.map_err(Error::storage)?;
        let Some(snapshot) = store::load_snapshot(&mut conn, call_id)
            .await
            .map_err(Error::storage)?
        else {
            return Ok(None);
        };
        if !snapshot.is_participant(actor) {
            return Err(Error::not_authorized("not a participant of this call"));
        }
        Ok(Some(snapshot))
    }

    /// The single non-terminal call the actor participates in, if any.
    ///
    /// An incoming ringing call takes precedence over anything else so a
    /// callee's engine always surfaces the ring first.
    pub async fn my_active_call(&self, actor: &UserId) -> Result<Option<CallSnapshot>> {
        let mut conn = self.pool.acquire().await.map_err(Error::storage)?;

        let row = match store::first_ringing_as_callee(&mut conn, actor)
            .await
            .map_err(Error::storage)?
        {
            Some(row) => Some(row),
            None => match store::first_active_as_caller(&mut conn, actor)
                .await
                .map_err(Error::storage)?
            {
                Some(row) => Some(row),
                None => store::first_settled_as_callee(&mut conn, actor)
                    .await
                    .map_err(Error::storage)?,
            },
        };

        match row {
            Some(row) => {
                let id = CallId::new(row.id.clone());
                store::load_snapshot(&mut conn, &id)
                    .await
                    .map_err(Error::storage)
            }
            None => Ok(None),
        }
    }

    /// Move ringing calls older than the ring timeout to `missed`.
    /// Returns how many were expired.
    pub async fn sweep_ring_timeouts(&self) -> Result<usize> {
        let timeout = chrono::Duration::from_std(self.ring_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let cutoff = Utc::now() - timeout;

        let mut tx = self.pool.begin().await.map_err(Error::storage)?;
        let expired = store::expire_ringing_before(&mut tx, cutoff, end_reason::RING_TIMEOUT)
            .await
            .map_err(Error::storage)?;
        tx.commit().await.map_err(Error::storage)?;

        for id in &expired {
            let id = CallId::new(id.clone());
            warn!(call = %id, "ring timeout, call missed");
            self.publish(&id).await;
        }
        Ok(expired.len())
    }

    async fn publish(&self, call_id: &CallId) {
        let snapshot = async {
            let mut conn = self.pool.acquire().await?;
            store::load_snapshot(&mut conn, call_id).await
        }
        .await;
        match snapshot {
            Ok(Some(snapshot)) => {
                // Send fails only when nobody is subscribed.
                let _ = self.feed.send(snapshot);
            }
            Ok(None) => {}
            Err(err) => warn!(call = %call_id, "failed to load snapshot for feed: {err}"),
        }
    }
}
