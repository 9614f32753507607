//! Campaign storage: the flow source, the behavior policy, and the
//! include/exclude segment lists.

use std::collections::HashMap;

use sqlx::MySql;
use sqlx::Row;
use sqlx::Transaction;

use crate::domain::CampaignBehavior;
use crate::executions;

#[derive(Debug, Clone)]
pub struct Campaign {
    pub id: String,
    pub flow: String,
    pub behavior: CampaignBehavior,
    /// Must be non-empty; a user belongs to the campaign when they are in
    /// every include segment and no exclude segment.
    pub segments: Vec<String>,
    pub exclude_segments: Vec<String>,
}

pub async fn insert(
    tx: &mut Transaction<'static, MySql>,
    campaign: &Campaign,
) -> Result<(), anyhow::Error> {
    if campaign.segments.is_empty() {
        anyhow::bail!("Campaign {} has no include segments", campaign.id);
    }
    sqlx::query("INSERT INTO campaigns (id, flow, behavior) VALUES (?, ?, ?)")
        .bind(&campaign.id)
        .bind(&campaign.flow)
        .bind(campaign.behavior.as_str())
        .execute(&mut **tx)
        .await?;
    for segment_id in &campaign.segments {
        insert_segment_ref(tx, &campaign.id, segment_id, "include").await?;
    }
    for segment_id in &campaign.exclude_segments {
        insert_segment_ref(tx, &campaign.id, segment_id, "exclude").await?;
    }
    Ok(())
}

async fn insert_segment_ref(
    tx: &mut Transaction<'static, MySql>,
    campaign_id: &str,
    segment_id: &str,
    kind: &str,
) -> Result<(), anyhow::Error> {
    sqlx::query("INSERT INTO campaign_segments (campaign_id, segment_id, kind) VALUES (?, ?, ?)")
        .bind(campaign_id)
        .bind(segment_id)
        .bind(kind)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn get(
    tx: &mut Transaction<'static, MySql>,
    id: &str,
) -> Result<Option<Campaign>, anyhow::Error> {
    let Some(row) = sqlx::query("SELECT id, flow, behavior FROM campaigns WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
    else {
        return Ok(None);
    };

    let mut campaign = Campaign {
        id: row.get("id"),
        flow: row.get("flow"),
        behavior: CampaignBehavior::parse(row.get("behavior")).map_err(anyhow::Error::msg)?,
        segments: Vec::new(),
        exclude_segments: Vec::new(),
    };
    let refs = sqlx::query(
        "SELECT segment_id, kind FROM campaign_segments \
         WHERE campaign_id = ? ORDER BY segment_id",
    )
    .bind(id)
    .fetch_all(&mut **tx)
    .await?;
    for r in refs {
        let segment_id: String = r.get("segment_id");
        match r.get::<&str, _>("kind") {
            "exclude" => campaign.exclude_segments.push(segment_id),
            _ => campaign.segments.push(segment_id),
        }
    }
    Ok(Some(campaign))
}

pub async fn list(
    tx: &mut Transaction<'static, MySql>
) -> Result<Vec<Campaign>, anyhow::Error> {
    let rows = sqlx::query("SELECT id, flow, behavior FROM campaigns ORDER BY id")
        .fetch_all(&mut **tx)
        .await?;
    let mut campaigns = Vec::with_capacity(rows.len());
    let mut by_id = HashMap::new();
    for (i, row) in rows.into_iter().enumerate() {
        let id: String = row.get("id");
        by_id.insert(id.clone(), i);
        campaigns.push(Campaign {
            id,
            flow: row.get("flow"),
            behavior: CampaignBehavior::parse(row.get("behavior")).map_err(anyhow::Error::msg)?,
            segments: Vec::new(),
            exclude_segments: Vec::new(),
        });
    }

    let refs = sqlx::query(
        "SELECT campaign_id, segment_id, kind FROM campaign_segments ORDER BY segment_id",
    )
    .fetch_all(&mut **tx)
    .await?;
    for r in refs {
        let campaign_id: String = r.get("campaign_id");
        let Some(&i) = by_id.get(&campaign_id) else {
            continue;
        };
        let segment_id: String = r.get("segment_id");
        match r.get::<&str, _>("kind") {
            "exclude" => campaigns[i].exclude_segments.push(segment_id),
            _ => campaigns[i].segments.push(segment_id),
        }
    }
    Ok(campaigns)
}

/// Terminate every live execution, then drop the campaign; memberships,
/// executions and history cascade.
pub async fn delete(
    tx: &mut Transaction<'static, MySql>,
    id: &str,
) -> Result<bool, anyhow::Error> {
    executions::terminate_all_for_campaign(tx, id, "Campaign was deleted").await?;
    let deleted = sqlx::query("DELETE FROM campaigns WHERE id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?
        .rows_affected();
    Ok(deleted > 0)
}

/// Compute a freshly-added campaign's initial population with one set
/// query (all include segments, no exclude segment) and create memberships
/// plus pending executions for it.
pub async fn enroll_matching_users(
    tx: &mut Transaction<'static, MySql>,
    campaign: &Campaign,
) -> Result<u64, anyhow::Error> {
    if campaign.segments.is_empty() {
        anyhow::bail!("Campaign {} has no include segments", campaign.id);
    }

    let include_marks = placeholders(campaign.segments.len());
    let mut sql = format!(
        "INSERT INTO campaign_memberships (user_id, campaign_id) \
         SELECT sm.user_id, ? FROM segment_memberships sm \
         WHERE sm.segment_id IN ({include_marks})"
    );
    if !campaign.exclude_segments.is_empty() {
        let exclude_marks = placeholders(campaign.exclude_segments.len());
        sql.push_str(&format!(
            " AND NOT EXISTS (SELECT 1 FROM segment_memberships ex \
             WHERE ex.user_id = sm.user_id AND ex.segment_id IN ({exclude_marks}))"
        ));
    }
    sql.push_str(" GROUP BY sm.user_id HAVING COUNT(DISTINCT sm.segment_id) = ?");

    let mut query = sqlx::query(&sql).bind(&campaign.id);
    for segment_id in &campaign.segments {
        query = query.bind(segment_id);
    }
    for segment_id in &campaign.exclude_segments {
        query = query.bind(segment_id);
    }
    let enrolled = query
        .bind(campaign.segments.len() as u32)
        .execute(&mut **tx)
        .await?
        .rows_affected();

    sqlx::query(
        "INSERT IGNORE INTO executions (user_id, campaign_id, status, sleep_until) \
         SELECT cm.user_id, cm.campaign_id, 'pending', NOW(6) \
         FROM campaign_memberships cm WHERE cm.campaign_id = ?",
    )
    .bind(&campaign.id)
    .execute(&mut **tx)
    .await?;

    Ok(enrolled)
}

fn placeholders(n: usize) -> String {
    let mut s = "?,".repeat(n);
    s.pop();
    s
}
