//! Session-token identity resolution.
//!
//! Registration and login live in the account service; the gateway only
//! resolves a bearer token to a user id. Tokens are issued out of band and
//! inserted into the `sessions` table.

use axum::http::{header, HeaderMap};
use rand::{rngs::OsRng, RngCore};
use sqlx::SqlitePool;

use peal_common::{Error, UserId};

pub const SESSION_TOKEN_HEADER: &str = "x-session-token";

pub async fn init_schema(pool: &SqlitePool) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            token TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Issue a high-entropy session token for a user.
pub async fn create_session(pool: &SqlitePool, user_id: &UserId) -> anyhow::Result<String> {
    let mut token_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut token_bytes);
    let token = hex::encode(token_bytes);

    sqlx::query("INSERT INTO sessions (token, user_id) VALUES (?, ?)")
        .bind(&token)
        .bind(user_id.as_str())
        .execute(pool)
        .await?;
    Ok(token)
}

pub async fn user_for_token(pool: &SqlitePool, token: &str) -> anyhow::Result<Option<UserId>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT user_id FROM sessions WHERE token = ?")
        .bind(token)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(user_id,)| UserId::new(user_id)))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(token) = headers
        .get(SESSION_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        return Some(token);
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

/// Resolve the request's verified actor or fail with an
/// unauthenticated error.
pub async fn authenticate(pool: &SqlitePool, headers: &HeaderMap) -> Result<UserId, Error> {
    let Some(token) = bearer_token(headers) else {
        return Err(Error::Unauthenticated);
    };
    match user_for_token(pool, token).await {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(Error::Unauthenticated),
        Err(err) => Err(Error::storage(err)),
    }
}
