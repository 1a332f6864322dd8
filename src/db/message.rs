use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tokio_stream::StreamExt;

use crate::message::{Message, MessageStatus, Transition};

const COLUMNS: &str = "
    id, recipient, content, status, sent_at, retry_count, last_attempt_at,
    created_at, updated_at, response_id, response_code, error_message
";

pub async fn insert(
    db: &mut SqliteConnection,
    recipient: impl AsRef<str>,
    content: impl AsRef<str>,
    created_at: DateTime<Utc>,
) -> Result<Message, sqlx::Error> {
    sqlx::query_as(&format!(
        "
        INSERT INTO messages (recipient, content, status, retry_count, created_at)
        VALUES ($1, $2, $3, 0, $4)
        RETURNING {COLUMNS}
        "
    ))
    .bind(recipient.as_ref())
    .bind(content.as_ref())
    .bind(MessageStatus::Pending)
    .bind(created_at)
    .fetch_one(db)
    .await
}

pub async fn get(db: &mut SqliteConnection, id: i64) -> Result<Option<Message>, sqlx::Error> {
    sqlx::query_as(&format!("SELECT {COLUMNS} FROM messages WHERE id = $1"))
        .bind(id)
        .fetch_optional(db)
        .await
}

/// Pending messages below the retry ceiling, oldest first.
pub async fn find_due(
    db: &mut SqliteConnection,
    max_retry_count: u32,
    limit: Option<u32>,
) -> Result<Vec<Message>, sqlx::Error> {
    // SQLite treats a negative LIMIT as "no limit".
    let limit = limit.map(i64::from).unwrap_or(-1);

    let sql = format!(
        "
        SELECT {COLUMNS} FROM messages
        WHERE status = $1 AND retry_count < $2
        ORDER BY created_at ASC, id ASC
        LIMIT $3
        "
    );

    let mut stream = sqlx::query_as::<_, Message>(&sql)
        .bind(MessageStatus::Pending)
        .bind(max_retry_count)
        .bind(limit)
        .fetch(db);

    let mut messages = Vec::new();

    while let Some(res) = stream.next().await.transpose()? {
        messages.push(res);
    }

    Ok(messages)
}

/// Writes the status and result metadata of `message`, but only while the
/// stored row is still `pending`.
pub async fn update_if_pending(
    db: &mut SqliteConnection,
    message: &Message,
    updated_at: DateTime<Utc>,
) -> Result<Transition, sqlx::Error> {
    let result = sqlx::query(
        "
        UPDATE messages
        SET status = $1,
            sent_at = $2,
            response_id = $3,
            response_code = $4,
            error_message = $5,
            updated_at = $6
        WHERE id = $7 AND status = $8
        ",
    )
    .bind(message.status)
    .bind(message.sent_at)
    .bind(message.response_id.as_deref())
    .bind(message.response_code)
    .bind(message.error_message.as_deref())
    .bind(updated_at)
    .bind(message.id)
    .bind(MessageStatus::Pending)
    .execute(db)
    .await?;

    Ok(match result.rows_affected() {
        0 => Transition::Conflict,
        _ => Transition::Applied,
    })
}

/// Unconditionally bumps the retry counter. Returns false if no such message exists.
pub async fn increment_retry(
    db: &mut SqliteConnection,
    id: i64,
    attempted_at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "
        UPDATE messages
        SET retry_count = retry_count + 1,
            last_attempt_at = $1
        WHERE id = $2
        ",
    )
    .bind(attempted_at)
    .bind(id)
    .execute(db)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Messages in `status`, newest first.
pub async fn list_by_status(
    db: &mut SqliteConnection,
    status: MessageStatus,
    limit: u32,
    offset: u32,
) -> Result<Vec<Message>, sqlx::Error> {
    sqlx::query_as(&format!(
        "
        SELECT {COLUMNS} FROM messages
        WHERE status = $1
        ORDER BY created_at DESC, id DESC
        LIMIT $2 OFFSET $3
        "
    ))
    .bind(status)
    .bind(limit)
    .bind(offset)
    .fetch_all(db)
    .await
}
