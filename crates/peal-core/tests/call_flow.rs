//! Integration tests for the signaling state machine.
//!
//! Covers the full two-party lifecycle, the busy guard under concurrent
//! initiates, candidate ordering, authorization, teardown idempotency, and
//! the ring-timeout sweep.

use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;

use peal_common::{
    end_reason, CallRole, CallStatus, Error, IceCandidate, SessionDescription, UserId,
};
use peal_core::{store, CallService, CandidateOutcome};

async fn service() -> CallService {
    service_with_ring_timeout(Duration::from_secs(30)).await
}

async fn service_with_ring_timeout(ring_timeout: Duration) -> CallService {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("failed to open in-memory database");
    store::init_schema(&pool).await.expect("failed to create schema");
    CallService::with_ring_timeout(pool, ring_timeout)
}

fn alice() -> UserId {
    UserId::from("alice")
}

fn bob() -> UserId {
    UserId::from("bob")
}

fn carol() -> UserId {
    UserId::from("carol")
}

#[tokio::test]
async fn initiate_creates_ringing_record() {
    let service = service().await;
    let offer = SessionDescription::offer("v=0 caller-sdp");
    let id = service.initiate(&alice(), &bob(), offer.clone()).await.unwrap();

    let call = service
        .call_details(&alice(), &id)
        .await
        .unwrap()
        .expect("record should exist");
    assert_eq!(call.status, CallStatus::Ringing);
    assert_eq!(call.caller_id, alice());
    assert_eq!(call.callee_id, bob());
    assert_eq!(call.offer, Some(offer));
    assert_eq!(call.answer, None);
    assert_eq!(call.ended_reason, None);

    // The callee sees the ring through the active-call query.
    let incoming = service.my_active_call(&bob()).await.unwrap().unwrap();
    assert_eq!(incoming.id, id);
}

#[tokio::test]
async fn initiate_rejects_self_call() {
    let service = service().await;
    let err = service
        .initiate(&alice(), &alice(), SessionDescription::offer("sdp"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SelfCall));
}

#[tokio::test]
async fn busy_guard_blocks_either_party() {
    let service = service().await;
    service
        .initiate(&alice(), &bob(), SessionDescription::offer("sdp"))
        .await
        .unwrap();

    // Bob is ringing, so a third party cannot reach him.
    let err = service
        .initiate(&carol(), &bob(), SessionDescription::offer("sdp"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Busy {
            role: CallRole::Callee
        }
    ));

    // Alice already has an outgoing call, so she cannot start another.
    let err = service
        .initiate(&alice(), &carol(), SessionDescription::offer("sdp"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Busy {
            role: CallRole::Caller
        }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_initiates_produce_single_active_call() {
    let service = Arc::new(service().await);

    // Two callers racing for the same callee: exactly one may win.
    let s1 = service.clone();
    let s2 = service.clone();
    let first = tokio::spawn(async move {
        s1.initiate(&alice(), &bob(), SessionDescription::offer("sdp-a")).await
    });
    let second = tokio::spawn(async move {
        s2.initiate(&carol(), &bob(), SessionDescription::offer("sdp-c")).await
    });
    let results = [first.await.unwrap(), second.await.unwrap()];
    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1, "exactly one initiate must pass the guard");
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(Error::Busy { .. }))));

    let active = service.my_active_call(&bob()).await.unwrap().unwrap();
    assert_eq!(active.status, CallStatus::Ringing);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn caller_cannot_race_two_outgoing_calls() {
    let service = Arc::new(service().await);

    let s1 = service.clone();
    let s2 = service.clone();
    let first = tokio::spawn(async move {
        s1.initiate(&alice(), &bob(), SessionDescription::offer("sdp-1")).await
    });
    let second = tokio::spawn(async move {
        s2.initiate(&alice(), &carol(), SessionDescription::offer("sdp-2")).await
    });
    let results = [first.await.unwrap(), second.await.unwrap()];
    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1, "a caller may only hold one active call");

    let active = service.my_active_call(&alice()).await.unwrap();
    assert!(active.is_some());
}

#[tokio::test]
async fn answer_requires_ringing_and_callee() {
    let service = service().await;
    let id = service
        .initiate(&alice(), &bob(), SessionDescription::offer("sdp"))
        .await
        .unwrap();

    // The caller cannot answer their own call.
    let err = service
        .answer(&alice(), &id, SessionDescription::answer("sdp-a"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotAuthorized(_)));

    service
        .answer(&bob(), &id, SessionDescription::answer("sdp-a"))
        .await
        .unwrap();
    let call = service.call_details(&bob(), &id).await.unwrap().unwrap();
    assert_eq!(call.status, CallStatus::Answered);
    assert_eq!(call.answer, Some(SessionDescription::answer("sdp-a")));

    // A second answer hits a state conflict.
    let err = service
        .answer(&bob(), &id, SessionDescription::answer("again"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidState {
            status: CallStatus::Answered
        }
    ));
}

#[tokio::test]
async fn mark_connected_only_from_answered() {
    let service = service().await;
    let id = service
        .initiate(&alice(), &bob(), SessionDescription::offer("sdp"))
        .await
        .unwrap();

    // Still ringing: benign false, no transition.
    assert!(!service.mark_connected(&alice(), &id).await.unwrap());

    service
        .answer(&bob(), &id, SessionDescription::answer("sdp-a"))
        .await
        .unwrap();
    assert!(service.mark_connected(&bob(), &id).await.unwrap());
    let call = service.call_details(&bob(), &id).await.unwrap().unwrap();
    assert_eq!(call.status, CallStatus::Connected);

    // Both sides race to report; the loser sees false, not an error.
    assert!(!service.mark_connected(&alice(), &id).await.unwrap());

    let err = service.mark_connected(&carol(), &id).await.unwrap_err();
    assert!(matches!(err, Error::NotAuthorized(_)));
}

#[tokio::test]
async fn decline_records_role_specific_reason() {
    let service = service().await;

    let id = service
        .initiate(&alice(), &bob(), SessionDescription::offer("sdp"))
        .await
        .unwrap();
    service.decline(&bob(), &id).await.unwrap();
    let call = service.call_details(&bob(), &id).await.unwrap().unwrap();
    assert_eq!(call.status, CallStatus::Declined);
    assert_eq!(
        call.ended_reason.as_deref(),
        Some(end_reason::DECLINED_BY_CALLEE)
    );

    // Answering a declined call is a state conflict.
    let err = service
        .answer(&bob(), &id, SessionDescription::answer("late"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));

    // Declining again is a harmless duplicate.
    service.decline(&alice(), &id).await.unwrap();
    let call = service.call_details(&bob(), &id).await.unwrap().unwrap();
    assert_eq!(
        call.ended_reason.as_deref(),
        Some(end_reason::DECLINED_BY_CALLEE)
    );

    // Caller cancelling a fresh ring records its own reason.
    let id = service
        .initiate(&alice(), &bob(), SessionDescription::offer("sdp"))
        .await
        .unwrap();
    service.decline(&alice(), &id).await.unwrap();
    let call = service.call_details(&alice(), &id).await.unwrap().unwrap();
    assert_eq!(
        call.ended_reason.as_deref(),
        Some(end_reason::CANCELLED_BY_CALLER)
    );
}

#[tokio::test]
async fn decline_rejected_once_answered() {
    let service = service().await;
    let id = service
        .initiate(&alice(), &bob(), SessionDescription::offer("sdp"))
        .await
        .unwrap();
    service
        .answer(&bob(), &id, SessionDescription::answer("sdp-a"))
        .await
        .unwrap();

    let err = service.decline(&bob(), &id).await.unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidState {
            status: CallStatus::Answered
        }
    ));
}

#[tokio::test]
async fn candidates_append_in_arrival_order() {
    let service = service().await;
    let id = service
        .initiate(&alice(), &bob(), SessionDescription::offer("sdp"))
        .await
        .unwrap();

    for n in 1..=3 {
        let outcome = service
            .send_candidate(
                &alice(),
                &id,
                CallRole::Caller,
                IceCandidate::new(format!("candidate:{n}")),
            )
            .await
            .unwrap();
        assert_eq!(outcome, CandidateOutcome::Stored);
    }
    // Duplicate delivery is stored verbatim, never deduplicated.
    service
        .send_candidate(
            &alice(),
            &id,
            CallRole::Caller,
            IceCandidate::new("candidate:3"),
        )
        .await
        .unwrap();

    let call = service.call_details(&alice(), &id).await.unwrap().unwrap();
    let got: Vec<&str> = call
        .caller_candidates
        .iter()
        .map(|c| c.candidate.as_str())
        .collect();
    assert_eq!(
        got,
        vec!["candidate:1", "candidate:2", "candidate:3", "candidate:3"]
    );
    assert!(call.callee_candidates.is_empty());
}

#[tokio::test]
async fn candidate_role_must_match_actor() {
    let service = service().await;
    let id = service
        .initiate(&alice(), &bob(), SessionDescription::offer("sdp"))
        .await
        .unwrap();

    let err = service
        .send_candidate(&alice(), &id, CallRole::Callee, IceCandidate::new("c"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotAuthorized(_)));

    let err = service
        .send_candidate(&carol(), &id, CallRole::Caller, IceCandidate::new("c"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotAuthorized(_)));
}

#[tokio::test]
async fn late_candidates_are_silently_ignored() {
    let service = service().await;
    let id = service
        .initiate(&alice(), &bob(), SessionDescription::offer("sdp"))
        .await
        .unwrap();
    service.end(&alice(), &id).await.unwrap();

    let outcome = service
        .send_candidate(&alice(), &id, CallRole::Caller, IceCandidate::new("late"))
        .await
        .unwrap();
    assert_eq!(outcome, CandidateOutcome::Ignored);

    let call = service.call_details(&alice(), &id).await.unwrap().unwrap();
    assert!(call.caller_candidates.is_empty());
}

#[tokio::test]
async fn full_call_lifecycle_with_duplicate_end() {
    let service = service().await;
    let mut feed = service.subscribe();

    let id = service
        .initiate(&alice(), &bob(), SessionDescription::offer("O1"))
        .await
        .unwrap();
    assert_eq!(feed.recv().await.unwrap().status, CallStatus::Ringing);

    service
        .answer(&bob(), &id, SessionDescription::answer("A1"))
        .await
        .unwrap();
    assert_eq!(feed.recv().await.unwrap().status, CallStatus::Answered);

    service
        .send_candidate(&alice(), &id, CallRole::Caller, IceCandidate::new("C1"))
        .await
        .unwrap();
    service
        .send_candidate(&bob(), &id, CallRole::Callee, IceCandidate::new("C2"))
        .await
        .unwrap();
    assert!(service.mark_connected(&bob(), &id).await.unwrap());

    let call = service.call_details(&alice(), &id).await.unwrap().unwrap();
    assert_eq!(call.status, CallStatus::Connected);
    assert_eq!(call.caller_candidates[0].candidate, "C1");
    assert_eq!(call.callee_candidates[0].candidate, "C2");

    service.end(&alice(), &id).await.unwrap();
    let call = service.call_details(&alice(), &id).await.unwrap().unwrap();
    assert_eq!(call.status, CallStatus::Ended);
    assert_eq!(call.ended_reason.as_deref(), Some(end_reason::ENDED_BY_CALLER));

    // The other side tearing down right after must succeed without
    // rewriting the recorded reason.
    service.end(&bob(), &id).await.unwrap();
    let call = service.call_details(&bob(), &id).await.unwrap().unwrap();
    assert_eq!(call.ended_reason.as_deref(), Some(end_reason::ENDED_BY_CALLER));

    // Both parties are free again.
    assert!(service.my_active_call(&alice()).await.unwrap().is_none());
    assert!(service.my_active_call(&bob()).await.unwrap().is_none());
}

#[tokio::test]
async fn end_requires_participant_and_known_call() {
    let service = service().await;
    let id = service
        .initiate(&alice(), &bob(), SessionDescription::offer("sdp"))
        .await
        .unwrap();

    let err = service.end(&carol(), &id).await.unwrap_err();
    assert!(matches!(err, Error::NotAuthorized(_)));

    let err = service
        .end(&alice(), &peal_common::CallId::from("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn call_details_hides_other_peoples_calls() {
    let service = service().await;
    let id = service
        .initiate(&alice(), &bob(), SessionDescription::offer("sdp"))
        .await
        .unwrap();

    let err = service.call_details(&carol(), &id).await.unwrap_err();
    assert!(matches!(err, Error::NotAuthorized(_)));

    let none = service
        .call_details(&alice(), &peal_common::CallId::from("missing"))
        .await
        .unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn my_active_call_follows_the_lifecycle() {
    let service = service().await;
    let id = service
        .initiate(&alice(), &bob(), SessionDescription::offer("sdp"))
        .await
        .unwrap();

    // Ringing: both sides resolve to the same record.
    assert_eq!(service.my_active_call(&alice()).await.unwrap().unwrap().id, id);
    assert_eq!(service.my_active_call(&bob()).await.unwrap().unwrap().id, id);

    service
        .answer(&bob(), &id, SessionDescription::answer("sdp-a"))
        .await
        .unwrap();
    assert_eq!(service.my_active_call(&bob()).await.unwrap().unwrap().id, id);

    service.end(&bob(), &id).await.unwrap();
    assert!(service.my_active_call(&alice()).await.unwrap().is_none());
    assert!(service.my_active_call(&bob()).await.unwrap().is_none());
}

#[tokio::test]
async fn ring_timeout_sweep_marks_missed() {
    let service = service_with_ring_timeout(Duration::ZERO).await;
    let id = service
        .initiate(&alice(), &bob(), SessionDescription::offer("sdp"))
        .await
        .unwrap();

    let expired = service.sweep_ring_timeouts().await.unwrap();
    assert_eq!(expired, 1);

    let call = service.call_details(&bob(), &id).await.unwrap().unwrap();
    assert_eq!(call.status, CallStatus::Missed);
    assert_eq!(call.ended_reason.as_deref(), Some(end_reason::RING_TIMEOUT));

    // Missed is terminal: answering conflicts, ending is a no-op.
    let err = service
        .answer(&bob(), &id, SessionDescription::answer("late"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    service.end(&alice(), &id).await.unwrap();
    let call = service.call_details(&bob(), &id).await.unwrap().unwrap();
    assert_eq!(call.ended_reason.as_deref(), Some(end_reason::RING_TIMEOUT));
}

#[tokio::test]
async fn sweep_leaves_fresh_rings_alone() {
    let service = service().await;
    service
        .initiate(&alice(), &bob(), SessionDescription::offer("sdp"))
        .await
        .unwrap();
    assert_eq!(service.sweep_ring_timeouts().await.unwrap(), 0);
}

#[tokio::test]
async fn unknown_status_text_is_rejected_at_the_boundary() {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    store::init_schema(&pool).await.unwrap();
    sqlx::query(
        "INSERT INTO calls (id, caller_id, callee_id, status, created_at) \
         VALUES ('c1', 'alice', 'bob', 'haunted', datetime('now'))",
    )
    .execute(&pool)
    .await
    .unwrap();

    let service = CallService::new(pool);
    let err = service
        .call_details(&alice(), &peal_common::CallId::from("c1"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Storage(_)));
}
