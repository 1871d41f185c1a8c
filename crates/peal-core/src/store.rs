//! Call record store over SQLite.
//!
//! One row per call in `calls`, candidates in an append-only side table
//! ordered by rowid so arrival order is the storage order. All functions
//! take a plain connection so callers can compose them inside a single
//! transaction.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use peal_common::{
    CallId, CallRole, CallSnapshot, CallStatus, IceCandidate, SessionDescription, UserId,
};

const ACTIVE_STATUSES: &str = "('ringing', 'answered', 'connected')";

/// Create tables and indexes if they do not exist yet.
///
/// Idempotent; run at gateway startup and by tests against `sqlite::memory:`.
pub async fn init_schema(pool: &SqlitePool) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS calls (
            id TEXT PRIMARY KEY,
            caller_id TEXT NOT NULL,
            callee_id TEXT NOT NULL,
            status TEXT NOT NULL,
            offer TEXT,
            answer TEXT,
            ended_reason TEXT,
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_calls_callee_status ON calls(callee_id, status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_calls_caller_status ON calls(caller_id, status)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS call_candidates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            call_id TEXT NOT NULL,
            role TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at DATETIME NOT NULL,
            FOREIGN KEY(call_id) REFERENCES calls(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_call_candidates_call ON call_candidates(call_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[derive(Debug, sqlx::FromRow)]
pub struct CallRow {
    pub id: String,
    pub caller_id: String,
    pub callee_id: String,
    pub status: String,
    pub offer: Option<String>,
    pub answer: Option<String>,
    pub ended_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CallRow {
    pub fn status(&self) -> sqlx::Result<CallStatus> {
        parse_status(&self.status)
    }
}

fn parse_status(s: &str) -> sqlx::Result<CallStatus> {
    CallStatus::parse(s)
        .ok_or_else(|| sqlx::Error::Decode(format!("unknown call status {s:?}").into()))
}

fn decode_description(json: &str) -> sqlx::Result<SessionDescription> {
    serde_json::from_str(json).map_err(|err| sqlx::Error::Decode(Box::new(err)))
}

fn decode_candidate(json: &str) -> sqlx::Result<IceCandidate> {
    serde_json::from_str(json).map_err(|err| sqlx::Error::Decode(Box::new(err)))
}

fn encode_json<T: serde::Serialize>(value: &T) -> sqlx::Result<String> {
    serde_json::to_string(value).map_err(|err| sqlx::Error::Encode(Box::new(err)))
}

pub async fn insert_call(
    conn: &mut SqliteConnection,
    id: &CallId,
    caller: &UserId,
    callee: &UserId,
    offer: &SessionDescription,
    created_at: DateTime<Utc>,
) -> sqlx::Result<()> {
    let offer_json = encode_json(offer)?;
    sqlx::query(
        r#"
        INSERT INTO calls (id, caller_id, callee_id, status, offer, created_at)
        VALUES (?, ?, ?, 'ringing', ?, ?)
        "#,
    )
    .bind(id.as_str())
    .bind(caller.as_str())
    .bind(callee.as_str())
    .bind(offer_json)
    .bind(created_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn call_row(conn: &mut SqliteConnection, id: &CallId) -> sqlx::Result<Option<CallRow>> {
    sqlx::query_as::<_, CallRow>("SELECT * FROM calls WHERE id = ?")
        .bind(id.as_str())
        .fetch_optional(conn)
        .await
}

/// Number of non-terminal calls the user participates in, either side.
pub async fn active_count_for_user(
    conn: &mut SqliteConnection,
    user: &UserId,
) -> sqlx::Result<i64> {
    let as_callee: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM calls WHERE callee_id = ? AND status IN {ACTIVE_STATUSES}"
    ))
    .bind(user.as_str())
    .fetch_one(&mut *conn)
    .await?;

    let as_caller: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM calls WHERE caller_id = ? AND status IN {ACTIVE_STATUSES}"
    ))
    .bind(user.as_str())
    .fetch_one(&mut *conn)
    .await?;

    Ok(as_callee + as_caller)
}

/// Set the answer and move `ringing` to `answered`. Returns affected rows;
/// zero means the record left `ringing` before this write.
pub async fn set_answered(
    conn: &mut SqliteConnection,
    id: &CallId,
    answer: &SessionDescription,
) -> sqlx::Result<u64> {
    let answer_json = encode_json(answer)?;
    let result =
        sqlx::query("UPDATE calls SET status = 'answered', answer = ? WHERE id = ? AND status = 'ringing'")
            .bind(answer_json)
            .bind(id.as_str())
            .execute(conn)
            .await?;
    Ok(result.rows_affected())
}

/// Conditional status transition. Writes the terminal reason at most once;
/// returns affected rows so callers can detect a lost race.
pub async fn transition_status(
    conn: &mut SqliteConnection,
    id: &CallId,
    from: &[CallStatus],
    to: CallStatus,
    reason: Option<&str>,
) -> sqlx::Result<u64> {
    let from_list = from
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    let result = sqlx::query(&format!(
        "UPDATE calls SET status = ?, ended_reason = COALESCE(?, ended_reason) \
         WHERE id = ? AND status IN ({from_list})"
    ))
    .bind(to.as_str())
    .bind(reason)
    .bind(id.as_str())
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

pub async fn append_candidate(
    conn: &mut SqliteConnection,
    id: &CallId,
    role: CallRole,
    candidate: &IceCandidate,
    created_at: DateTime<Utc>,
) -> sqlx::Result<()> {
    let payload = encode_json(candidate)?;
    sqlx::query(
        "INSERT INTO call_candidates (call_id, role, payload, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(id.as_str())
    .bind(role.as_str())
    .bind(payload)
    .bind(created_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Incoming ringing call where the user is the callee, oldest first.
pub async fn first_ringing_as_callee(
    conn: &mut SqliteConnection,
    user: &UserId,
) -> sqlx::Result<Option<CallRow>> {
    sqlx::query_as::<_, CallRow>(
        "SELECT * FROM calls WHERE callee_id = ? AND status = 'ringing' \
         ORDER BY created_at ASC LIMIT 1",
    )
    .bind(user.as_str())
    .fetch_optional(conn)
    .await
}

pub async fn first_active_as_caller(
    conn: &mut SqliteConnection,
    user: &UserId,
) -> sqlx::Result<Option<CallRow>> {
    sqlx::query_as::<_, CallRow>(&format!(
        "SELECT * FROM calls WHERE caller_id = ? AND status IN {ACTIVE_STATUSES} \
         ORDER BY created_at ASC LIMIT 1"
    ))
    .bind(user.as_str())
    .fetch_optional(conn)
    .await
}

pub async fn first_settled_as_callee(
    conn: &mut SqliteConnection,
    user: &UserId,
) -> sqlx::Result<Option<CallRow>> {
    sqlx::query_as::<_, CallRow>(
        "SELECT * FROM calls WHERE callee_id = ? AND status IN ('answered', 'connected') \
         ORDER BY created_at ASC LIMIT 1",
    )
    .bind(user.as_str())
    .fetch_optional(conn)
    .await
}

/// Move ringing calls older than the cutoff to `missed`. Returns their ids.
pub async fn expire_ringing_before(
    conn: &mut SqliteConnection,
    cutoff: DateTime<Utc>,
    reason: &str,
) -> sqlx::Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "UPDATE calls SET status = 'missed', ended_reason = ? \
         WHERE status = 'ringing' AND created_at <= ? RETURNING id",
    )
    .bind(reason)
    .bind(cutoff)
    .fetch_all(conn)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Assemble the full record: row plus both candidate lists in arrival order.
pub async fn load_snapshot(
    conn: &mut SqliteConnection,
    id: &CallId,
) -> sqlx::Result<Option<CallSnapshot>> {
    let Some(row) = call_row(&mut *conn, id).await? else {
        return Ok(None);
    };

    let candidate_rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT role, payload FROM call_candidates WHERE call_id = ? ORDER BY id ASC",
    )
    .bind(id.as_str())
    .fetch_all(&mut *conn)
    .await?;

    let mut caller_candidates = Vec::new();
    let mut callee_candidates = Vec::new();
    for (role, payload) in &candidate_rows {
        let candidate = decode_candidate(payload)?;
        match CallRole::parse(role) {
            Some(CallRole::Caller) => caller_candidates.push(candidate),
            Some(CallRole::Callee) => callee_candidates.push(candidate),
            None => {
                return Err(sqlx::Error::Decode(
                    format!("unknown candidate role {role:?}").into(),
                ))
            }
        }
    }

    Ok(Some(snapshot_from_parts(
        row,
        caller_candidates,
        callee_candidates,
    )?))
}

fn snapshot_from_parts(
    row: CallRow,
    caller_candidates: Vec<IceCandidate>,
    callee_candidates: Vec<IceCandidate>,
) -> sqlx::Result<CallSnapshot> {
    let status = parse_status(&row.status)?;
    let offer = row.offer.as_deref().map(decode_description).transpose()?;
    let answer = row.answer.as_deref().map(decode_description).transpose()?;
    Ok(CallSnapshot {
        id: CallId::new(row.id),
        caller_id: UserId::new(row.caller_id),
        callee_id: UserId::new(row.callee_id),
        status,
        offer,
        answer,
        caller_candidates,
        callee_candidates,
        ended_reason: row.ended_reason,
        created_at: row.created_at,
    })
}
