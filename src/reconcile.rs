//! Whole-configuration pushes. Each push is diffed against the last
//! accepted configuration (the newest row of the append-only `configs`
//! ledger) and applied as per-entity delete/add/update operations in a
//! fixed topological order. A push that produces no operations writes no
//! ledger row.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use sqlx::MySql;
use sqlx::Row;
use sqlx::Transaction;

use crate::campaigns;
use crate::campaigns::Campaign;
use crate::domain::CampaignBehavior;
use crate::domain::EmailAddress;
use crate::email_client;
use crate::email_client::ProviderConfig;
use crate::memberships;
use crate::segments;
use crate::templates;
use crate::templates::Template;
use crate::transactions;
use crate::transactions::TransactionDef;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPush {
    #[serde(default)]
    pub templates: BTreeMap<String, TemplateSpec>,
    #[serde(default)]
    pub segments: BTreeMap<String, SegmentSpec>,
    #[serde(default)]
    pub campaigns: BTreeMap<String, CampaignSpec>,
    #[serde(default)]
    pub transactions: BTreeMap<String, TransactionSpec>,
    #[serde(default)]
    pub email_provider: Option<EmailProviderSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub subject: String,
    pub html: String,
    #[serde(default)]
    pub preamble: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentSpec {
    pub evaluator: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignSpec {
    pub flow: String,
    pub segments: Vec<String>,
    #[serde(default)]
    pub exclude_segments: Vec<String>,
    pub behavior: CampaignBehavior,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSpec {
    pub event: String,
    pub subject: String,
    pub html: String,
    #[serde(default)]
    pub preamble: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailProviderSpec {
    pub config: ProviderConfig,
    pub from_address: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
    #[error("{0}")]
    Validation(String),
    #[error("Campaign {0} changed; campaign updates are not supported, delete and re-add it")]
    UnsupportedCampaignUpdate(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

/// Keyed set diff for one entity type.
#[derive(Debug, Default, PartialEq)]
pub struct EntityOps {
    pub deleted: Vec<String>,
    pub added: Vec<String>,
    pub updated: Vec<String>,
}

impl EntityOps {
    fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.added.is_empty() && self.updated.is_empty()
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct Operations {
    pub templates: EntityOps,
    pub transactions: EntityOps,
    pub segments: EntityOps,
    pub campaigns: EntityOps,
    pub email_provider_changed: bool,
}

impl Operations {
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
            && self.transactions.is_empty()
            && self.segments.is_empty()
            && self.campaigns.is_empty()
            && !self.email_provider_changed
    }
}

#[derive(Debug, PartialEq)]
pub enum PushOutcome {
    /// The push was byte-for-byte equivalent to the current configuration;
    /// nothing ran and no ledger row was written.
    NoChanges,
    Applied { config_id: u64 },
}

/// Diff and apply a configuration push inside the caller's transaction.
#[tracing::instrument(skip_all)]
pub async fn apply(
    tx: &mut Transaction<'static, MySql>,
    new: ConfigPush,
) -> Result<PushOutcome, ReconcileError> {
    validate(&new)?;
    let old = latest_config(tx).await?.unwrap_or_default();
    let ops = compute_operations(&old, &new);
    if ops.is_empty() {
        tracing::info!("configuration push contained no changes");
        return Ok(PushOutcome::NoChanges);
    }
    tracing::info!(?ops, "applying configuration push");

    apply_templates(tx, &new, &ops.templates).await?;
    apply_transactions(tx, &new, &ops.transactions).await?;
    apply_segments(tx, &new, &ops.segments).await?;
    apply_campaigns(tx, &new, &ops.campaigns).await?;
    if ops.email_provider_changed {
        apply_email_provider(tx, new.email_provider.as_ref()).await?;
    }

    let config_json =
        serde_json::to_value(&new).map_err(|e| ReconcileError::Unexpected(e.into()))?;
    let config_id = sqlx::query("INSERT INTO configs (config_json) VALUES (?)")
        .bind(config_json)
        .execute(&mut **tx)
        .await
        .map_err(anyhow::Error::from)?
        .last_insert_id();
    Ok(PushOutcome::Applied { config_id })
}

/// The newest accepted configuration, parsed back out of the ledger.
pub async fn latest_config(
    tx: &mut Transaction<'static, MySql>
) -> Result<Option<ConfigPush>, anyhow::Error> {
    let Some(row) =
        sqlx::query("SELECT config_json FROM configs ORDER BY created_at DESC, id DESC LIMIT 1")
            .fetch_optional(&mut **tx)
            .await?
    else {
        return Ok(None);
    };
    let config: serde_json::Value = row.get("config_json");
    Ok(Some(serde_json::from_value(config).map_err(|e| {
        anyhow::anyhow!("Stored configuration is malformed: {e}")
    })?))
}

fn validate(config: &ConfigPush) -> Result<(), ReconcileError> {
    for (id, campaign) in &config.campaigns {
        if campaign.segments.is_empty() {
            return Err(ReconcileError::Validation(format!(
                "Campaign {id} has no include segments"
            )));
        }
        for segment_id in campaign.segments.iter().chain(&campaign.exclude_segments) {
            if !config.segments.contains_key(segment_id) {
                return Err(ReconcileError::Validation(format!(
                    "Campaign {id} references unknown segment {segment_id}"
                )));
            }
        }
    }
    if let Some(provider) = &config.email_provider {
        EmailAddress::parse(provider.from_address.clone()).map_err(ReconcileError::Validation)?;
    }
    Ok(())
}

pub fn compute_operations(
    old: &ConfigPush,
    new: &ConfigPush,
) -> Operations {
    Operations {
        templates: diff_keyed(&old.templates, &new.templates, PartialEq::eq),
        transactions: diff_keyed(&old.transactions, &new.transactions, PartialEq::eq),
        segments: diff_keyed(&old.segments, &new.segments, PartialEq::eq),
        campaigns: diff_keyed(&old.campaigns, &new.campaigns, campaign_specs_equal),
        email_provider_changed: old.email_provider != new.email_provider,
    }
}

fn diff_keyed<T>(
    old: &BTreeMap<String, T>,
    new: &BTreeMap<String, T>,
    eq: impl Fn(&T, &T) -> bool,
) -> EntityOps {
    let mut ops = EntityOps::default();
    for key in old.keys() {
        if !new.contains_key(key) {
            ops.deleted.push(key.clone());
        }
    }
    for (key, payload) in new {
        match old.get(key) {
            None => ops.added.push(key.clone()),
            Some(existing) if !eq(existing, payload) => ops.updated.push(key.clone()),
            Some(_) => {}
        }
    }
    ops
}

/// Campaign payloads compare their segment lists as sorted sets.
fn campaign_specs_equal(
    a: &CampaignSpec,
    b: &CampaignSpec,
) -> bool {
    a.flow == b.flow
        && a.behavior == b.behavior
        && sorted(&a.segments) == sorted(&b.segments)
        && sorted(&a.exclude_segments) == sorted(&b.exclude_segments)
}

fn sorted(ids: &[String]) -> Vec<&String> {
    let mut ids: Vec<&String> = ids.iter().collect();
    ids.sort();
    ids
}

async fn apply_templates(
    tx: &mut Transaction<'static, MySql>,
    new: &ConfigPush,
    ops: &EntityOps,
) -> Result<(), ReconcileError> {
    for id in &ops.deleted {
        templates::delete(tx, id).await?;
    }
    for id in ops.added.iter().chain(&ops.updated) {
        let spec = &new.templates[id];
        let template = Template {
            id: id.clone(),
            subject: spec.subject.clone(),
            html: spec.html.clone(),
            preamble: spec.preamble.clone(),
        };
        if ops.added.contains(id) {
            templates::insert(tx, &template).await?;
        } else {
            templates::update(tx, &template).await?;
        }
    }
    Ok(())
}

async fn apply_transactions(
    tx: &mut Transaction<'static, MySql>,
    new: &ConfigPush,
    ops: &EntityOps,
) -> Result<(), ReconcileError> {
    for id in &ops.deleted {
        transactions::delete(tx, id).await?;
    }
    for id in ops.added.iter().chain(&ops.updated) {
        let spec = &new.transactions[id];
        let def = TransactionDef {
            id: id.clone(),
            event: spec.event.clone(),
            subject: spec.subject.clone(),
            html: spec.html.clone(),
            preamble: spec.preamble.clone(),
        };
        if ops.added.contains(id) {
            transactions::insert(tx, &def).await?;
        } else {
            transactions::update(tx, &def).await?;
        }
    }
    Ok(())
}

/// Segment adds and updates run a full global reevaluation and fan the
/// membership diff out to campaign memberships.
async fn apply_segments(
    tx: &mut Transaction<'static, MySql>,
    new: &ConfigPush,
    ops: &EntityOps,
) -> Result<(), ReconcileError> {
    for id in &ops.deleted {
        segments::delete(tx, id).await?;
    }
    for id in &ops.added {
        segments::insert(tx, id, &new.segments[id].evaluator).await?;
    }
    for id in &ops.updated {
        segments::update_evaluator(tx, id, &new.segments[id].evaluator).await?;
    }
    for id in ops.added.iter().chain(&ops.updated) {
        let changes = segments::evaluate_global(tx, id).await?;
        memberships::reevaluate_for_segment_change(tx, id, &changes).await?;
    }
    Ok(())
}

async fn apply_campaigns(
    tx: &mut Transaction<'static, MySql>,
    new: &ConfigPush,
    ops: &EntityOps,
) -> Result<(), ReconcileError> {
    if let Some(id) = ops.updated.first() {
        return Err(ReconcileError::UnsupportedCampaignUpdate(id.clone()));
    }
    for id in &ops.deleted {
        campaigns::delete(tx, id).await?;
    }
    for id in &ops.added {
        let spec = &new.campaigns[id];
        let campaign = Campaign {
            id: id.clone(),
            flow: spec.flow.clone(),
            behavior: spec.behavior,
            segments: spec.segments.clone(),
            exclude_segments: spec.exclude_segments.clone(),
        };
        campaigns::insert(tx, &campaign).await?;
        campaigns::enroll_matching_users(tx, &campaign).await?;
    }
    Ok(())
}

async fn apply_email_provider(
    tx: &mut Transaction<'static, MySql>,
    provider: Option<&EmailProviderSpec>,
) -> Result<(), ReconcileError> {
    match provider {
        Some(spec) => {
            let from_address = EmailAddress::parse(spec.from_address.clone())
                .map_err(ReconcileError::Validation)?;
            email_client::set_provider(tx, &spec.config, &from_address).await?;
        }
        None => email_client::clear_provider(tx).await?,
    }
    Ok(())
}
