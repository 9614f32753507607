//! Campaign membership resolution. Segment memberships are the ground
//! truth; this module recomputes which campaigns a user belongs to whenever
//! that truth (or the user) changes, creating and terminating executions as
//! a side effect.
//!
//! Static campaigns are monotone: once enrolled, a user stays until the
//! campaign or user is deleted. Dynamic campaigns mirror the segment
//! predicate exactly and terminate the execution on exit.

use std::collections::HashSet;

use sqlx::MySql;
use sqlx::Row;
use sqlx::Transaction;

use crate::campaigns;
use crate::campaigns::Campaign;
use crate::domain::CampaignBehavior;
use crate::executions;
use crate::segments;
use crate::segments::SegmentChanges;
use crate::segments::SegmentScope;

pub const DYNAMIC_EXIT_REASON: &str = "User no longer matches campaign criteria";

/// Users in batches this size when fanning a segment change out to
/// campaign reevaluation, to bound per-transaction work.
const REEVALUATION_BATCH: usize = 100;

#[derive(Debug, Default)]
pub struct UserCampaignChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    Added,
    Removed,
}

/// One user entering or leaving one campaign.
#[derive(Debug)]
pub struct CampaignChange {
    pub user_id: String,
    pub campaign_id: String,
    pub change: MembershipChange,
}

/// The membership predicate: in every include segment, in no exclude
/// segment.
pub async fn matches(
    tx: &mut Transaction<'static, MySql>,
    user_id: &str,
    campaign: &Campaign,
) -> Result<bool, anyhow::Error> {
    let segment_set = user_segment_set(tx, user_id).await?;
    Ok(matches_segment_set(&segment_set, campaign))
}

fn matches_segment_set(
    segment_set: &HashSet<String>,
    campaign: &Campaign,
) -> bool {
    campaign.segments.iter().all(|s| segment_set.contains(s))
        && !campaign
            .exclude_segments
            .iter()
            .any(|s| segment_set.contains(s))
}

/// Refresh the user's segment memberships (scoped), then reconcile their
/// campaign memberships against the new truth.
#[tracing::instrument(skip(tx))]
pub async fn reevaluate_user(
    tx: &mut Transaction<'static, MySql>,
    user_id: &str,
    scope: SegmentScope<'_>,
    reason: &str,
) -> Result<UserCampaignChanges, anyhow::Error> {
    segments::evaluate_for_user(tx, user_id, scope).await?;
    reevaluate_user_campaigns(tx, user_id).await
}

/// Recompute `matches` for every campaign. Static campaigns only ever gain
/// members here; dynamic campaigns track the predicate both ways, and each
/// removal terminates the corresponding execution.
pub async fn reevaluate_user_campaigns(
    tx: &mut Transaction<'static, MySql>,
    user_id: &str,
) -> Result<UserCampaignChanges, anyhow::Error> {
    let all_campaigns = campaigns::list(tx).await?;
    let segment_set = user_segment_set(tx, user_id).await?;
    let member_of: HashSet<String> =
        sqlx::query("SELECT campaign_id FROM campaign_memberships WHERE user_id = ?")
            .bind(user_id)
            .fetch_all(&mut **tx)
            .await?
            .into_iter()
            .map(|r| r.get("campaign_id"))
            .collect();

    let mut changes = UserCampaignChanges::default();
    for campaign in &all_campaigns {
        let matches_now = matches_segment_set(&segment_set, campaign);
        let is_member = member_of.contains(&campaign.id);

        if matches_now && !is_member {
            add_member(tx, user_id, &campaign.id).await?;
            changes.added.push(campaign.id.clone());
        } else if !matches_now && is_member && campaign.behavior == CampaignBehavior::Dynamic {
            remove_member(tx, user_id, &campaign.id).await?;
            changes.removed.push(campaign.id.clone());
        }
    }

    if !changes.added.is_empty() || !changes.removed.is_empty() {
        tracing::info!(
            user_id,
            added = ?changes.added,
            removed = ?changes.removed,
            "campaign memberships changed"
        );
    }
    Ok(changes)
}

/// Fan a segment's membership diff out to every affected user's campaign
/// memberships. Only runs the per-user work if some campaign actually
/// references the segment.
#[tracing::instrument(skip(tx, changes))]
pub async fn reevaluate_for_segment_change(
    tx: &mut Transaction<'static, MySql>,
    segment_id: &str,
    changes: &SegmentChanges,
) -> Result<Vec<CampaignChange>, anyhow::Error> {
    if segments::referencing_campaigns(tx, segment_id).await? == 0 {
        return Ok(Vec::new());
    }

    let affected: Vec<&String> = changes.affected_users().collect();
    let mut out = Vec::new();
    for batch in affected.chunks(REEVALUATION_BATCH) {
        for user_id in batch {
            let user_changes = reevaluate_user_campaigns(tx, user_id).await?;
            out.extend(user_changes.added.into_iter().map(|campaign_id| {
                CampaignChange {
                    user_id: user_id.to_string(),
                    campaign_id,
                    change: MembershipChange::Added,
                }
            }));
            out.extend(
                user_changes
                    .removed
                    .into_iter()
                    .map(|campaign_id| CampaignChange {
                        user_id: user_id.to_string(),
                        campaign_id,
                        change: MembershipChange::Removed,
                    }),
            );
        }
    }
    Ok(out)
}

async fn add_member(
    tx: &mut Transaction<'static, MySql>,
    user_id: &str,
    campaign_id: &str,
) -> Result<(), anyhow::Error> {
    sqlx::query("INSERT INTO campaign_memberships (user_id, campaign_id) VALUES (?, ?)")
        .bind(user_id)
        .bind(campaign_id)
        .execute(&mut **tx)
        .await?;
    executions::create(tx, user_id, campaign_id).await
}

async fn remove_member(
    tx: &mut Transaction<'static, MySql>,
    user_id: &str,
    campaign_id: &str,
) -> Result<(), anyhow::Error> {
    sqlx::query("DELETE FROM campaign_memberships WHERE user_id = ? AND campaign_id = ?")
        .bind(user_id)
        .bind(campaign_id)
        .execute(&mut **tx)
        .await?;
    executions::terminate(tx, user_id, campaign_id, DYNAMIC_EXIT_REASON).await
}

async fn user_segment_set(
    tx: &mut Transaction<'static, MySql>,
    user_id: &str,
) -> Result<HashSet<String>, anyhow::Error> {
    Ok(
        sqlx::query("SELECT segment_id FROM segment_memberships WHERE user_id = ?")
            .bind(user_id)
            .fetch_all(&mut **tx)
            .await?
            .into_iter()
            .map(|r| r.get("segment_id"))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use crate::campaigns::Campaign;
    use crate::domain::CampaignBehavior;

    use super::matches_segment_set;

    fn campaign(
        includes: &[&str],
        excludes: &[&str],
    ) -> Campaign {
        Campaign {
            id: "c".to_string(),
            flow: String::new(),
            behavior: CampaignBehavior::Static,
            segments: includes.iter().map(|s| s.to_string()).collect(),
            exclude_segments: excludes.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn set(ids: &[&str]) -> HashSet<String> { ids.iter().map(|s| s.to_string()).collect() }

    #[test]
    fn requires_every_include() {
        let c = campaign(&["a", "b"], &[]);
        assert!(matches_segment_set(&set(&["a", "b", "c"]), &c));
        assert!(!matches_segment_set(&set(&["a"]), &c));
    }

    #[test]
    fn any_exclude_disqualifies() {
        let c = campaign(&["a"], &["x", "y"]);
        assert!(matches_segment_set(&set(&["a"]), &c));
        assert!(!matches_segment_set(&set(&["a", "y"]), &c));
    }
}
