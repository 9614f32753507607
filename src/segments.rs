//! Segment storage and evaluation. A segment is a SQL predicate over the
//! `users`/`events` tables returning an `id` column of user ids; membership
//! rows mirror the query's truth after every reevaluation.

mod triggers;

use std::collections::HashSet;

use anyhow::Context;
use sqlx::MySql;
use sqlx::Row;
use sqlx::Transaction;

pub use triggers::extract_event_triggers;

#[derive(Debug, Clone)]
pub struct Segment {
    pub id: String,
    pub evaluator: String,
}

/// Membership diff produced by a global reevaluation.
#[derive(Debug, Default)]
pub struct SegmentChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub total: usize,
}

impl SegmentChanges {
    pub fn is_empty(&self) -> bool { self.added.is_empty() && self.removed.is_empty() }

    /// Users whose membership flipped either way.
    pub fn affected_users(&self) -> impl Iterator<Item = &String> {
        self.added.iter().chain(self.removed.iter())
    }
}

/// Which segments a per-user reevaluation covers.
#[derive(Debug, Clone, Copy)]
pub enum SegmentScope<'a> {
    All,
    /// Only segments whose trigger set contains the event name.
    EventTriggered(&'a str),
}

pub async fn insert(
    tx: &mut Transaction<'static, MySql>,
    id: &str,
    evaluator: &str,
) -> Result<(), anyhow::Error> {
    sqlx::query("INSERT INTO segments (id, evaluator) VALUES (?, ?)")
        .bind(id)
        .bind(evaluator)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("Could not insert segment {id}"))?;
    refresh_triggers(tx, id, evaluator).await
}

pub async fn update_evaluator(
    tx: &mut Transaction<'static, MySql>,
    id: &str,
    evaluator: &str,
) -> Result<(), anyhow::Error> {
    let updated = sqlx::query("UPDATE segments SET evaluator = ? WHERE id = ?")
        .bind(evaluator)
        .bind(id)
        .execute(&mut **tx)
        .await?
        .rows_affected();
    if updated == 0 {
        anyhow::bail!("Segment {id} not found");
    }
    refresh_triggers(tx, id, evaluator).await
}

/// Rebuild the derived trigger rows from the evaluator SQL.
async fn refresh_triggers(
    tx: &mut Transaction<'static, MySql>,
    id: &str,
    evaluator: &str,
) -> Result<(), anyhow::Error> {
    sqlx::query("DELETE FROM segment_event_triggers WHERE segment_id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    for event in extract_event_triggers(evaluator) {
        sqlx::query("INSERT INTO segment_event_triggers (segment_id, event) VALUES (?, ?)")
            .bind(id)
            .bind(&event)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

pub async fn delete(
    tx: &mut Transaction<'static, MySql>,
    id: &str,
) -> Result<bool, anyhow::Error> {
    let deleted = sqlx::query("DELETE FROM segments WHERE id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?
        .rows_affected();
    Ok(deleted > 0)
}

pub async fn get(
    tx: &mut Transaction<'static, MySql>,
    id: &str,
) -> Result<Option<Segment>, anyhow::Error> {
    let row = sqlx::query("SELECT id, evaluator FROM segments WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row.map(|r| Segment {
        id: r.get("id"),
        evaluator: r.get("evaluator"),
    }))
}

pub async fn list(
    tx: &mut Transaction<'static, MySql>
) -> Result<Vec<Segment>, anyhow::Error> {
    let rows = sqlx::query("SELECT id, evaluator FROM segments ORDER BY id")
        .fetch_all(&mut **tx)
        .await?;
    Ok(rows
        .into_iter()
        .map(|r| Segment {
            id: r.get("id"),
            evaluator: r.get("evaluator"),
        })
        .collect())
}

/// User ids currently in the segment.
pub async fn members(
    tx: &mut Transaction<'static, MySql>,
    segment_id: &str,
) -> Result<Vec<String>, anyhow::Error> {
    let rows = sqlx::query(
        "SELECT user_id FROM segment_memberships WHERE segment_id = ? ORDER BY user_id",
    )
    .bind(segment_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows.into_iter().map(|r| r.get("user_id")).collect())
}

/// Segment ids the user is currently in.
pub async fn user_segments(
    tx: &mut Transaction<'static, MySql>,
    user_id: &str,
) -> Result<Vec<String>, anyhow::Error> {
    let rows = sqlx::query(
        "SELECT segment_id FROM segment_memberships WHERE user_id = ? ORDER BY segment_id",
    )
    .bind(user_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows.into_iter().map(|r| r.get("segment_id")).collect())
}

/// How many campaigns reference the segment in an include or exclude list.
pub async fn referencing_campaigns(
    tx: &mut Transaction<'static, MySql>,
    segment_id: &str,
) -> Result<u64, anyhow::Error> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM campaign_segments WHERE segment_id = ?")
        .bind(segment_id)
        .fetch_one(&mut **tx)
        .await?;
    let n: i64 = row.get("n");
    Ok(n as u64)
}

/// Run the segment's SQL and reconcile membership rows against its result
/// set.
#[tracing::instrument(skip(tx))]
pub async fn evaluate_global(
    tx: &mut Transaction<'static, MySql>,
    segment_id: &str,
) -> Result<SegmentChanges, anyhow::Error> {
    let segment = get(tx, segment_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Segment {segment_id} not found"))?;

    let rows = sqlx::query(&segment.evaluator)
        .fetch_all(&mut **tx)
        .await
        .with_context(|| format!("Evaluator of segment {segment_id} failed"))?;
    let mut matched = HashSet::with_capacity(rows.len());
    for row in rows {
        let id: String = row
            .try_get("id")
            .context("Segment evaluators must return an 'id' column of user ids")?;
        matched.insert(id);
    }

    let current: HashSet<String> =
        sqlx::query("SELECT user_id FROM segment_memberships WHERE segment_id = ?")
            .bind(segment_id)
            .fetch_all(&mut **tx)
            .await?
            .into_iter()
            .map(|r| r.get("user_id"))
            .collect();

    let added: Vec<String> = matched.difference(&current).cloned().collect();
    let removed: Vec<String> = current.difference(&matched).cloned().collect();

    for user_id in &added {
        sqlx::query("INSERT INTO segment_memberships (user_id, segment_id) VALUES (?, ?)")
            .bind(user_id)
            .bind(segment_id)
            .execute(&mut **tx)
            .await?;
    }
    for user_id in &removed {
        sqlx::query("DELETE FROM segment_memberships WHERE user_id = ? AND segment_id = ?")
            .bind(user_id)
            .bind(segment_id)
            .execute(&mut **tx)
            .await?;
    }

    tracing::info!(
        segment_id,
        added = added.len(),
        removed = removed.len(),
        total = matched.len(),
        "reevaluated segment"
    );
    Ok(SegmentChanges {
        added,
        removed,
        total: matched.len(),
    })
}

/// Reevaluate the scoped segments for a single user, flipping membership
/// rows where the SQL's truth changed. Each evaluator is wrapped as
/// `WITH m AS (...) SELECT id FROM m WHERE id = ?` so only the one user is
/// tested.
#[tracing::instrument(skip(tx))]
pub async fn evaluate_for_user(
    tx: &mut Transaction<'static, MySql>,
    user_id: &str,
    scope: SegmentScope<'_>,
) -> Result<usize, anyhow::Error> {
    let segments = match scope {
        SegmentScope::All => list(tx).await?,
        SegmentScope::EventTriggered(event) => triggered_by(tx, event).await?,
    };

    let mut flipped = 0;
    for segment in segments {
        let wrapped = format!(
            "WITH m AS ({}) SELECT id FROM m WHERE id = ?",
            segment.evaluator
        );
        let matches_now = sqlx::query(&wrapped)
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await
            .with_context(|| format!("Evaluator of segment {} failed", segment.id))?
            .is_some();

        let is_member = sqlx::query(
            "SELECT 1 AS x FROM segment_memberships WHERE user_id = ? AND segment_id = ?",
        )
        .bind(user_id)
        .bind(&segment.id)
        .fetch_optional(&mut **tx)
        .await?
        .is_some();

        if matches_now == is_member {
            continue;
        }
        flipped += 1;
        if matches_now {
            sqlx::query("INSERT INTO segment_memberships (user_id, segment_id) VALUES (?, ?)")
                .bind(user_id)
                .bind(&segment.id)
                .execute(&mut **tx)
                .await?;
        } else {
            sqlx::query("DELETE FROM segment_memberships WHERE user_id = ? AND segment_id = ?")
                .bind(user_id)
                .bind(&segment.id)
                .execute(&mut **tx)
                .await?;
        }
    }
    Ok(flipped)
}

async fn triggered_by(
    tx: &mut Transaction<'static, MySql>,
    event: &str,
) -> Result<Vec<Segment>, anyhow::Error> {
    let rows = sqlx::query(
        "SELECT s.id, s.evaluator FROM segments s \
         JOIN segment_event_triggers t ON t.segment_id = s.id \
         WHERE t.event = ?",
    )
    .bind(event)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| Segment {
            id: r.get("id"),
            evaluator: r.get("evaluator"),
        })
        .collect())
}
