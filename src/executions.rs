//! The executions and execution-history tables. One execution row tracks a
//! user's traversal of one campaign's flow; history rows record the
//! attribute snapshot each step observed, so flows can be replayed
//! deterministically from yield 0.

use chrono::DateTime;
use chrono::Utc;
use serde_json::Value;
use sqlx::MySql;
use sqlx::Row;
use sqlx::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Pending,
    Sleeping,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sleeping => "sleeping",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Result<Self, anyhow::Error> {
        match s {
            "pending" => Ok(Self::Pending),
            "sleeping" => Ok(Self::Sleeping),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "terminated" => Ok(Self::Terminated),
            other => Err(anyhow::anyhow!("Unknown execution status {other:?}")),
        }
    }
}

/// A due execution locked by `claim_due` and flipped to `running`.
#[derive(Debug)]
pub struct ClaimedExecution {
    pub user_id: String,
    pub campaign_id: String,
    /// Status before the claim; `pending` means the flow has not produced
    /// its first yield yet.
    pub claimed_from: ExecutionStatus,
}

/// Create the row backing a fresh campaign membership: `pending`, due
/// immediately. A leftover terminal row for the same pair is left alone
/// (re-matching a campaign does not restart its flow).
pub async fn create(
    tx: &mut Transaction<'static, MySql>,
    user_id: &str,
    campaign_id: &str,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        "INSERT INTO executions (user_id, campaign_id, status, sleep_until) \
         VALUES (?, ?, 'pending', NOW(6)) \
         ON DUPLICATE KEY UPDATE user_id = user_id",
    )
    .bind(user_id)
    .bind(campaign_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn sleep_until(
    tx: &mut Transaction<'static, MySql>,
    user_id: &str,
    campaign_id: &str,
    until: DateTime<Utc>,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        "UPDATE executions SET status = 'sleeping', sleep_until = ? \
         WHERE user_id = ? AND campaign_id = ?",
    )
    .bind(until)
    .bind(user_id)
    .bind(campaign_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn complete(
    tx: &mut Transaction<'static, MySql>,
    user_id: &str,
    campaign_id: &str,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        "UPDATE executions SET status = 'completed' WHERE user_id = ? AND campaign_id = ?",
    )
    .bind(user_id)
    .bind(campaign_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn fail(
    tx: &mut Transaction<'static, MySql>,
    user_id: &str,
    campaign_id: &str,
    message: &str,
) -> Result<(), anyhow::Error> {
    tracing::warn!(user_id, campaign_id, message, "execution failed");
    sqlx::query(
        "UPDATE executions SET status = 'failed', error = ? \
         WHERE user_id = ? AND campaign_id = ?",
    )
    .bind(message)
    .bind(user_id)
    .bind(campaign_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Idempotent: a missing row, or one already in a terminal state, is left
/// untouched.
pub async fn terminate(
    tx: &mut Transaction<'static, MySql>,
    user_id: &str,
    campaign_id: &str,
    reason: &str,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        "UPDATE executions SET status = 'terminated', error = ? \
         WHERE user_id = ? AND campaign_id = ? \
         AND status IN ('pending', 'sleeping', 'running')",
    )
    .bind(reason)
    .bind(user_id)
    .bind(campaign_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Terminate every live execution of a campaign (used on campaign delete).
pub async fn terminate_all_for_campaign(
    tx: &mut Transaction<'static, MySql>,
    campaign_id: &str,
    reason: &str,
) -> Result<u64, anyhow::Error> {
    let terminated = sqlx::query(
        "UPDATE executions SET status = 'terminated', error = ? \
         WHERE campaign_id = ? AND status IN ('pending', 'sleeping', 'running')",
    )
    .bind(reason)
    .bind(campaign_id)
    .execute(&mut **tx)
    .await?
    .rows_affected();
    Ok(terminated)
}

/// Lock due rows (up to `limit`, all of them when `None`) and mark them
/// `running` inside the caller's transaction. `SKIP LOCKED` keeps a tick
/// that is still running from blocking the next one; the rows it holds are
/// simply not visible as due.
pub async fn claim_due(
    tx: &mut Transaction<'static, MySql>,
    now: DateTime<Utc>,
    limit: Option<u32>,
) -> Result<Vec<ClaimedExecution>, anyhow::Error> {
    let mut sql = "SELECT user_id, campaign_id, status FROM executions \
                   WHERE status IN ('pending', 'sleeping') AND sleep_until <= ?"
        .to_string();
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    sql.push_str(" FOR UPDATE SKIP LOCKED");

    let rows = sqlx::query(&sql).bind(now).fetch_all(&mut **tx).await?;

    let mut claimed = Vec::with_capacity(rows.len());
    for row in rows {
        let user_id: String = row.get("user_id");
        let campaign_id: String = row.get("campaign_id");
        let claimed_from = ExecutionStatus::parse(row.get::<&str, _>("status"))?;
        sqlx::query(
            "UPDATE executions SET status = 'running' WHERE user_id = ? AND campaign_id = ?",
        )
        .bind(&user_id)
        .bind(&campaign_id)
        .execute(&mut **tx)
        .await?;
        claimed.push(ClaimedExecution {
            user_id,
            campaign_id,
            claimed_from,
        });
    }
    Ok(claimed)
}

/// Record the attribute snapshot the flow will observe at `step_index`.
pub async fn append_history(
    tx: &mut Transaction<'static, MySql>,
    user_id: &str,
    campaign_id: &str,
    step_index: u32,
    attributes: &Value,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        "INSERT INTO execution_history (user_id, campaign_id, step_index, attributes) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(campaign_id)
    .bind(step_index)
    .bind(attributes)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Attribute snapshots of all advanced steps, ordered by step index (dense
/// from 0).
pub async fn attr_history(
    tx: &mut Transaction<'static, MySql>,
    user_id: &str,
    campaign_id: &str,
) -> Result<Vec<Value>, anyhow::Error> {
    let rows = sqlx::query(
        "SELECT attributes FROM execution_history \
         WHERE user_id = ? AND campaign_id = ? ORDER BY step_index",
    )
    .bind(user_id)
    .bind(campaign_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows.into_iter().map(|r| r.get("attributes")).collect())
}

#[cfg(test)]
mod tests {
    use claims::assert_err;

    use super::ExecutionStatus;

    #[test]
    fn status_round_trip() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Sleeping,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Terminated,
        ] {
            assert_eq!(ExecutionStatus::parse(status.as_str()).unwrap(), status);
        }
        assert_err!(ExecutionStatus::parse("paused"));
    }
}
