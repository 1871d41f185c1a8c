//! HTTP handlers for the call operations.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use peal_common::{CallId, CallRole, Error, IceCandidate, SessionDescription, UserId};

use crate::{auth, AppState};

const MAX_SDP_BYTES: usize = 32 * 1024;
const MAX_CANDIDATE_BYTES: usize = 4096;

#[derive(Debug, Deserialize)]
pub struct InitiateRequest {
    pub callee_id: String,
    pub offer: SessionDescription,
}

#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    pub call_id: String,
    pub answer: SessionDescription,
}

#[derive(Debug, Deserialize)]
pub struct CallRequest {
    pub call_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CandidateRequest {
    pub call_id: String,
    pub role: CallRole,
    pub candidate: IceCandidate,
}

#[derive(Serialize)]
struct InitiateResponse {
    call_id: CallId,
}

#[derive(Serialize)]
struct OkResponse {
    ok: bool,
}

#[derive(Serialize)]
struct ConnectedResponse {
    connected: bool,
}

#[derive(Serialize)]
struct CandidateResponse {
    stored: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(err: &Error) -> Response {
    let status = match err {
        Error::Unauthenticated => StatusCode::UNAUTHORIZED,
        Error::NotAuthorized(_) => StatusCode::FORBIDDEN,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidState { .. } | Error::Busy { .. } => StatusCode::CONFLICT,
        Error::SelfCall | Error::MediaAccess(_) | Error::Connectivity(_) => {
            StatusCode::BAD_REQUEST
        }
        Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

pub async fn initiate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<InitiateRequest>,
) -> Response {
    let actor = match auth::authenticate(&state.pool, &headers).await {
        Ok(actor) => actor,
        Err(err) => return error_response(&err),
    };
    if payload.offer.sdp.is_empty() || payload.offer.sdp.len() > MAX_SDP_BYTES {
        return bad_request("Invalid offer size");
    }

    let callee = UserId::new(payload.callee_id);
    match state.service.initiate(&actor, &callee, payload.offer).await {
        Ok(call_id) => Json(InitiateResponse { call_id }).into_response(),
        Err(err) => error_response(&err),
    }
}

pub async fn answer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AnswerRequest>,
) -> Response {
    let actor = match auth::authenticate(&state.pool, &headers).await {
        Ok(actor) => actor,
        Err(err) => return error_response(&err),
    };
    if payload.answer.sdp.is_empty() || payload.answer.sdp.len() > MAX_SDP_BYTES {
        return bad_request("Invalid answer size");
    }

    let call_id = CallId::new(payload.call_id);
    match state.service.answer(&actor, &call_id, payload.answer).await {
        Ok(()) => Json(OkResponse { ok: true }).into_response(),
        Err(err) => error_response(&err),
    }
}

pub async fn mark_connected(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CallRequest>,
) -> Response {
    let actor = match auth::authenticate(&state.pool, &headers).await {
        Ok(actor) => actor,
        Err(err) => return error_response(&err),
    };
    let call_id = CallId::new(payload.call_id);
    match state.service.mark_connected(&actor, &call_id).await {
        Ok(connected) => Json(ConnectedResponse { connected }).into_response(),
        Err(err) => error_response(&err),
    }
}

pub async fn send_candidate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CandidateRequest>,
) -> Response {
    let actor = match auth::authenticate(&state.pool, &headers).await {
        Ok(actor) => actor,
        Err(err) => return error_response(&err),
    };
    if payload.candidate.candidate.is_empty()
        || payload.candidate.candidate.len() > MAX_CANDIDATE_BYTES
    {
        return bad_request("Invalid candidate size");
    }

    let call_id = CallId::new(payload.call_id);
    match state
        .service
        .send_candidate(&actor, &call_id, payload.role, payload.candidate)
        .await
    {
        Ok(outcome) => Json(CandidateResponse {
            stored: outcome == peal_core::CandidateOutcome::Stored,
        })
        .into_response(),
        Err(err) => error_response(&err),
    }
}

pub async fn decline(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CallRequest>,
) -> Response {
    let actor = match auth::authenticate(&state.pool, &headers).await {
        Ok(actor) => actor,
        Err(err) => return error_response(&err),
    };
    let call_id = CallId::new(payload.call_id);
    match state.service.decline(&actor, &call_id).await {
        Ok(()) => Json(OkResponse { ok: true }).into_response(),
        Err(err) => error_response(&err),
    }
}

pub async fn end(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CallRequest>,
) -> Response {
    let actor = match auth::authenticate(&state.pool, &headers).await {
        Ok(actor) => actor,
        Err(err) => return error_response(&err),
    };
    let call_id = CallId::new(payload.call_id);
    match state.service.end(&actor, &call_id).await {
        Ok(()) => Json(OkResponse { ok: true }).into_response(),
        Err(err) => error_response(&err),
    }
}

pub async fn details(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<CallRequest>,
) -> Response {
    let actor = match auth::authenticate(&state.pool, &headers).await {
        Ok(actor) => actor,
        Err(err) => return error_response(&err),
    };
    let call_id = CallId::new(query.call_id);
    match state.service.call_details(&actor, &call_id).await {
        Ok(call) => Json(call).into_response(),
        Err(err) => error_response(&err),
    }
}

pub async fn active(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let actor = match auth::authenticate(&state.pool, &headers).await {
        Ok(actor) => actor,
        Err(err) => return error_response(&err),
    };
    match state.service.my_active_call(&actor).await {
        Ok(call) => Json(call).into_response(),
        Err(err) => error_response(&err),
    }
}
