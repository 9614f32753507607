//! The `users` and `events` tables. Users are identified by caller-chosen
//! string ids; attribute documents are whole-document writes (the shallow
//! merge happens in `domain::UserAttributes`).

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sqlx::MySql;
use sqlx::Row;
use sqlx::Transaction;

use crate::domain::UserAttributes;

#[derive(Debug, Serialize)]
pub struct EventRecord {
    pub id: u64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub attributes: Value,
}

pub async fn insert(
    tx: &mut Transaction<'static, MySql>,
    id: &str,
    attributes: &UserAttributes,
) -> Result<(), anyhow::Error> {
    sqlx::query("INSERT INTO users (id, attributes) VALUES (?, ?)")
        .bind(id)
        .bind(attributes.as_value())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn get(
    tx: &mut Transaction<'static, MySql>,
    id: &str,
) -> Result<Option<Value>, anyhow::Error> {
    let row = sqlx::query("SELECT attributes FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row.map(|r| r.get("attributes")))
}

pub async fn update_attributes(
    tx: &mut Transaction<'static, MySql>,
    id: &str,
    attributes: &UserAttributes,
) -> Result<(), anyhow::Error> {
    let updated = sqlx::query("UPDATE users SET attributes = ? WHERE id = ?")
        .bind(attributes.as_value())
        .bind(id)
        .execute(&mut **tx)
        .await?
        .rows_affected();
    if updated == 0 {
        anyhow::bail!("User {id} not found");
    }
    Ok(())
}

/// Events, memberships, executions and history all cascade at the schema
/// level.
pub async fn delete(
    tx: &mut Transaction<'static, MySql>,
    id: &str,
) -> Result<bool, anyhow::Error> {
    let deleted = sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?
        .rows_affected();
    Ok(deleted > 0)
}

pub async fn insert_event(
    tx: &mut Transaction<'static, MySql>,
    user_id: &str,
    name: &str,
    attributes: &Value,
) -> Result<u64, anyhow::Error> {
    let result = sqlx::query("INSERT INTO events (name, user_id, attributes) VALUES (?, ?, ?)")
        .bind(name)
        .bind(user_id)
        .bind(attributes)
        .execute(&mut **tx)
        .await?;
    Ok(result.last_insert_id())
}

pub async fn list_events(
    tx: &mut Transaction<'static, MySql>,
    user_id: &str,
) -> Result<Vec<EventRecord>, anyhow::Error> {
    let rows = sqlx::query(
        "SELECT id, name, created_at, attributes FROM events WHERE user_id = ? ORDER BY id",
    )
    .bind(user_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| EventRecord {
            id: r.get("id"),
            name: r.get("name"),
            created_at: r.get("created_at"),
            attributes: r.get("attributes"),
        })
        .collect())
}
