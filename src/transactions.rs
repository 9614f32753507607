//! Event-triggered one-shot emails. A transaction binds an event name to a
//! subject expression and template body; dispatch happens best-effort after
//! the event's ingestion transaction has committed, so a slow or failing
//! provider cannot poison the write.

use anyhow::Context;
use serde_json::Value;
use sqlx::MySql;
use sqlx::MySqlPool;
use sqlx::Row;
use sqlx::Transaction;

use crate::configuration::EmailDeliverySettings;
use crate::domain::UserAttributes;
use crate::email_client::EmailClient;
use crate::sandbox;
use crate::users;

#[derive(Debug, Clone)]
pub struct TransactionDef {
    pub id: String,
    pub event: String,
    pub subject: String,
    pub html: String,
    pub preamble: String,
}

pub async fn insert(
    tx: &mut Transaction<'static, MySql>,
    def: &TransactionDef,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        "INSERT INTO transactions (id, event, subject, html, preamble) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&def.id)
    .bind(&def.event)
    .bind(&def.subject)
    .bind(&def.html)
    .bind(&def.preamble)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn update(
    tx: &mut Transaction<'static, MySql>,
    def: &TransactionDef,
) -> Result<(), anyhow::Error> {
    let updated = sqlx::query(
        "UPDATE transactions SET event = ?, subject = ?, html = ?, preamble = ? WHERE id = ?",
    )
    .bind(&def.event)
    .bind(&def.subject)
    .bind(&def.html)
    .bind(&def.preamble)
    .bind(&def.id)
    .execute(&mut **tx)
    .await?
    .rows_affected();
    if updated == 0 {
        anyhow::bail!("Transaction {} not found", def.id);
    }
    Ok(())
}

pub async fn delete(
    tx: &mut Transaction<'static, MySql>,
    id: &str,
) -> Result<bool, anyhow::Error> {
    let deleted = sqlx::query("DELETE FROM transactions WHERE id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?
        .rows_affected();
    Ok(deleted > 0)
}

pub async fn get(
    tx: &mut Transaction<'static, MySql>,
    id: &str,
) -> Result<Option<TransactionDef>, anyhow::Error> {
    let row = sqlx::query("SELECT id, event, subject, html, preamble FROM transactions WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row.map(def_from_row))
}

pub async fn list(
    tx: &mut Transaction<'static, MySql>
) -> Result<Vec<TransactionDef>, anyhow::Error> {
    let rows = sqlx::query("SELECT id, event, subject, html, preamble FROM transactions ORDER BY id")
        .fetch_all(&mut **tx)
        .await?;
    Ok(rows.into_iter().map(def_from_row).collect())
}

/// First match wins when several transactions share an event name.
pub async fn find_by_event(
    tx: &mut Transaction<'static, MySql>,
    event: &str,
) -> Result<Option<TransactionDef>, anyhow::Error> {
    let row = sqlx::query(
        "SELECT id, event, subject, html, preamble FROM transactions \
         WHERE event = ? ORDER BY id LIMIT 1",
    )
    .bind(event)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.map(def_from_row))
}

fn def_from_row(row: sqlx::mysql::MySqlRow) -> TransactionDef {
    TransactionDef {
        id: row.get("id"),
        event: row.get("event"),
        subject: row.get("subject"),
        html: row.get("html"),
        preamble: row.get("preamble"),
    }
}

/// Send the transactional email matching an ingested event, if any.
/// Failures are logged and swallowed: the event row is already committed
/// and must stay that way.
#[tracing::instrument(skip(pool, settings, event_attributes))]
pub async fn dispatch(
    pool: &MySqlPool,
    settings: &EmailDeliverySettings,
    user_id: &str,
    event_name: &str,
    event_attributes: &Value,
) {
    if let Err(e) = try_dispatch(pool, settings, user_id, event_name, event_attributes).await {
        tracing::error!(
            error.cause_chain = ?e,
            error.message = %e,
            "transactional email dispatch failed"
        );
    }
}

async fn try_dispatch(
    pool: &MySqlPool,
    settings: &EmailDeliverySettings,
    user_id: &str,
    event_name: &str,
    event_attributes: &Value,
) -> Result<(), anyhow::Error> {
    // read-only transaction: fetch the matching definition, the user, and
    // the provider, then release the connection before any network call
    let mut tx = pool.begin().await?;
    let Some(def) = find_by_event(&mut tx, event_name).await? else {
        return Ok(());
    };
    let user = users::get(&mut tx, user_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("User {user_id} not found"))?;
    let email_client = EmailClient::load(&mut tx, settings)
        .await?
        .ok_or_else(|| anyhow::anyhow!("No email provider is configured"))?;
    tx.commit().await?;

    let recipient = UserAttributes::parse(user.clone())
        .map_err(anyhow::Error::msg)?
        .email();
    let event = event_context(event_name, event_attributes);

    let subject = sandbox::eval_user_event_expr(&def.subject, &user, &event)
        .with_context(|| format!("Subject of transaction {} failed", def.id))?;
    let html = sandbox::render_template(
        &def.html,
        &def.preamble,
        &[("user", &user), ("event", &event)],
    )
    .with_context(|| format!("Body of transaction {} failed", def.id))?;

    email_client.send(recipient.as_ref(), &subject, &html).await
}

/// The `event` value authored code sees: the event's attributes, plus the
/// event name under `name` unless the attributes already claimed that key.
fn event_context(
    event_name: &str,
    attributes: &Value,
) -> Value {
    let mut map = match attributes {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    map.entry("name".to_string())
        .or_insert_with(|| Value::String(event_name.to_string()));
    Value::Object(map)
}
