use std::{fs, path::PathBuf, str::FromStr};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use uuid::Uuid;

use shared::domain::{ActionId, ActionKind, QueuedAction};

/// Durable local store backing the offline action queue.
///
/// One row per queued action; drain order is `(priority DESC, queued_at
/// ASC)` and is index-backed. Payloads are opaque JSON owned by the queue.
#[derive(Clone)]
pub struct OfflineStore {
    pool: Pool<Sqlite>,
}

impl OfflineStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn enqueue_action(&self, action: &QueuedAction) -> Result<()> {
        sqlx::query(
            "INSERT INTO queued_actions (id, kind, payload, priority, queued_at, retry_count, last_attempt_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(action.id.0.to_string())
        .bind(kind_to_str(action.kind))
        .bind(action.payload.to_string())
        .bind(action.priority)
        .bind(action.queued_at)
        .bind(action.retry_count as i64)
        .bind(action.last_attempt_at)
        .execute(&self.pool)
        .await
        .context("failed to persist queued action")?;
        Ok(())
    }

    pub async fn get_action(&self, id: ActionId) -> Result<Option<QueuedAction>> {
        let row = sqlx::query(
            "SELECT id, kind, payload, priority, queued_at, retry_count, last_attempt_at
             FROM queued_actions WHERE id = ?",
        )
        .bind(id.0.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_action).transpose()
    }

    /// All queued actions in drain order: highest priority first, oldest
    /// first within a priority tier.
    pub async fn list_pending(&self) -> Result<Vec<QueuedAction>> {
        let rows = sqlx::query(
            "SELECT id, kind, payload, priority, queued_at, retry_count, last_attempt_at
             FROM queued_actions
             ORDER BY priority DESC, queued_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_action).collect()
    }

    pub async fn delete_action(&self, id: ActionId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM queued_actions WHERE id = ?")
            .bind(id.0.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Increments the retry counter and stamps the attempt time.
    pub async fn record_attempt(&self, id: ActionId, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE queued_actions SET retry_count = retry_count + 1, last_attempt_at = ?
             WHERE id = ?",
        )
        .bind(at)
        .bind(id.0.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_actions(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queued_actions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    /// The action evicted when the queue is at capacity: oldest entry in
    /// the lowest priority tier.
    pub async fn eviction_candidate(&self) -> Result<Option<ActionId>> {
        let row = sqlx::query(
            "SELECT id FROM queued_actions ORDER BY priority ASC, queued_at ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| parse_action_id(&r.get::<String, _>(0)))
            .transpose()
    }

    pub async fn clear_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM queued_actions")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_action(row: sqlx::sqlite::SqliteRow) -> Result<QueuedAction> {
    let payload_raw: String = row.get(2);
    Ok(QueuedAction {
        id: parse_action_id(&row.get::<String, _>(0))?,
        kind: str_to_kind(&row.get::<String, _>(1))?,
        payload: serde_json::from_str(&payload_raw)
            .context("queued action payload is not valid JSON")?,
        priority: row.get::<i32, _>(3),
        queued_at: row.get::<DateTime<Utc>, _>(4),
        retry_count: row.get::<i64, _>(5) as u32,
        last_attempt_at: row.get::<Option<DateTime<Utc>>, _>(6),
    })
}

fn parse_action_id(raw: &str) -> Result<ActionId> {
    let uuid = Uuid::parse_str(raw).with_context(|| format!("invalid action id '{raw}'"))?;
    Ok(ActionId(uuid))
}

fn kind_to_str(kind: ActionKind) -> &'static str {
    match kind {
        ActionKind::SendMessage => "send_message",
        ActionKind::UpdateMessage => "update_message",
        ActionKind::DeleteMessage => "delete_message",
        ActionKind::JoinConversation => "join_conversation",
        ActionKind::LeaveConversation => "leave_conversation",
    }
}

fn str_to_kind(raw: &str) -> Result<ActionKind> {
    match raw {
        "send_message" => Ok(ActionKind::SendMessage),
        "update_message" => Ok(ActionKind::UpdateMessage),
        "delete_message" => Ok(ActionKind::DeleteMessage),
        "join_conversation" => Ok(ActionKind::JoinConversation),
        "leave_conversation" => Ok(ActionKind::LeaveConversation),
        other => anyhow::bail!("unknown queued action kind '{other}'"),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_file_path(database_url) else {
        return Ok(());
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create parent directory '{}' for database url '{database_url}'",
                parent.display()
            )
        })?;
    }
    Ok(())
}

/// The on-disk file behind a sqlite url, or `None` for in-memory and
/// non-sqlite urls.
fn sqlite_file_path(database_url: &str) -> Option<PathBuf> {
    let raw = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let raw = raw.split('?').next().unwrap_or_default();
    if raw.is_empty() || raw == ":memory:" {
        return None;
    }
    Some(PathBuf::from(raw))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
