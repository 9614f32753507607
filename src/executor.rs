//! The flow executor: a single periodic tick that claims due executions,
//! replays each flow to its next yield in the sandbox, and enacts the
//! yielded command. One transaction per tick; a failure in one row marks
//! that execution `failed` and the rest continue.
//!
//! Flows are never suspended in the interpreter. Each advance re-runs the
//! program from yield 0 against the recorded attribute history, so a step's
//! branches replay exactly as first taken; O(k) work at step k is fine for
//! realistic flow lengths.

use anyhow::Context;
use chrono::Utc;
use serde_json::Value;
use sqlx::MySql;
use sqlx::MySqlPool;
use sqlx::Transaction;

use crate::campaigns;
use crate::campaigns::Campaign;
use crate::configuration::EmailDeliverySettings;
use crate::configuration::Settings;
use crate::domain::CampaignBehavior;
use crate::domain::UserAttributes;
use crate::email_client::EmailClient;
use crate::executions;
use crate::executions::ClaimedExecution;
use crate::executions::ExecutionStatus;
use crate::memberships;
use crate::sandbox;
use crate::sandbox::FlowCommand;
use crate::segments::SegmentScope;
use crate::startup::get_connection_pool;
use crate::templates;
use crate::users;

/// To be run as a separate worker, next to the API server.
pub async fn init_flow_executor(cfg: Settings) -> Result<(), anyhow::Error> {
    let pool = get_connection_pool(&cfg.database)?;
    let period = cfg.executor.tick_period();
    loop {
        match tick(&pool, &cfg.email_delivery).await {
            Ok(advanced) if advanced > 0 => {
                tracing::info!(advanced, "tick advanced executions")
            }
            Ok(_) => {}
            Err(e) => tracing::error!(
                error.cause_chain = ?e,
                error.message = %e,
                "tick failed"
            ),
        }
        tokio::time::sleep(period).await;
    }
}

/// One tick: claim everything due, advance each claimed row one step,
/// commit. Row locks from `claim_due` mean an overlapping tick simply sees
/// nothing due; the worker is self-throttling.
#[tracing::instrument(skip_all)]
pub async fn tick(
    pool: &MySqlPool,
    email_settings: &EmailDeliverySettings,
) -> Result<usize, anyhow::Error> {
    let mut tx = pool.begin().await?;
    let claimed = executions::claim_due(&mut tx, Utc::now(), None).await?;
    let advanced = claimed.len();
    for execution in claimed {
        if let Err(e) = advance(&mut tx, &execution, email_settings).await {
            executions::fail(
                &mut tx,
                &execution.user_id,
                &execution.campaign_id,
                &format!("{e:#}"),
            )
            .await?;
        }
    }
    tx.commit().await?;
    Ok(advanced)
}

async fn advance(
    tx: &mut Transaction<'static, MySql>,
    execution: &ClaimedExecution,
    email_settings: &EmailDeliverySettings,
) -> Result<(), anyhow::Error> {
    let ClaimedExecution {
        user_id,
        campaign_id,
        claimed_from,
    } = execution;

    let campaign = campaigns::get(tx, campaign_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Campaign {campaign_id} not found"))?;
    let user_attributes = users::get(tx, user_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("User {user_id} not found"))?;

    // a pending row has never yielded; a sleeping one resumes after its
    // recorded history
    let mut attr_states = match claimed_from {
        ExecutionStatus::Pending => Vec::new(),
        ExecutionStatus::Sleeping => executions::attr_history(tx, user_id, campaign_id).await?,
        other => anyhow::bail!("Claimed execution in unexpected status {}", other.as_str()),
    };
    let step_index = attr_states.len();
    attr_states.push(user_attributes.clone());

    // a user who left a dynamic campaign mid-flow is terminated before any
    // further work happens on their behalf
    if campaign.behavior == CampaignBehavior::Dynamic
        && step_index > 0
        && !memberships::matches(tx, user_id, &campaign).await?
    {
        return terminate_exited(tx, user_id, campaign_id).await;
    }

    // record what this step will observe before running it
    executions::append_history(tx, user_id, campaign_id, step_index as u32, &user_attributes)
        .await?;

    let outcome = sandbox::step_flow(&campaign.flow, &attr_states, step_index)?;

    // flows may mutate `ctx.attributes`; persist and fan out before the
    // command is enacted
    if outcome.attributes != user_attributes {
        write_back_attributes(tx, user_id, &outcome.attributes).await?;
    }

    if outcome.done {
        tracing::info!(%user_id, %campaign_id, "flow completed");
        return executions::complete(tx, user_id, campaign_id).await;
    }
    let Some(command) = outcome.command else {
        anyhow::bail!("Flow yielded no command");
    };

    // the attribute write-back above may itself have evicted the user
    if campaign.behavior == CampaignBehavior::Dynamic
        && !memberships::matches(tx, user_id, &campaign).await?
    {
        return terminate_exited(tx, user_id, campaign_id).await;
    }

    enact(tx, &campaign, user_id, command, email_settings).await
}

async fn terminate_exited(
    tx: &mut Transaction<'static, MySql>,
    user_id: &str,
    campaign_id: &str,
) -> Result<(), anyhow::Error> {
    tracing::info!(%user_id, %campaign_id, "terminating: user left the campaign");
    executions::terminate(tx, user_id, campaign_id, memberships::DYNAMIC_EXIT_REASON).await
}

async fn write_back_attributes(
    tx: &mut Transaction<'static, MySql>,
    user_id: &str,
    attributes: &Value,
) -> Result<(), anyhow::Error> {
    let attributes = UserAttributes::parse(attributes.clone())
        .map_err(|e| anyhow::anyhow!("Flow left attributes invalid: {e}"))?;
    users::update_attributes(tx, user_id, &attributes).await?;
    memberships::reevaluate_user(tx, user_id, SegmentScope::All, "attributes changed").await?;
    Ok(())
}

async fn enact(
    tx: &mut Transaction<'static, MySql>,
    campaign: &Campaign,
    user_id: &str,
    command: FlowCommand,
    email_settings: &EmailDeliverySettings,
) -> Result<(), anyhow::Error> {
    match command {
        FlowCommand::Wait { duration } => {
            let until = Utc::now() + duration.to_duration();
            executions::sleep_until(tx, user_id, &campaign.id, until).await
        }
        FlowCommand::SendEmail { template_id } => {
            send_campaign_email(tx, user_id, &template_id, email_settings).await?;
            // due again immediately, so the next tick reaches the next yield
            executions::sleep_until(tx, user_id, &campaign.id, Utc::now()).await
        }
        FlowCommand::SendSms { .. } => {
            anyhow::bail!("SMS commands are not implemented")
        }
    }
}

async fn send_campaign_email(
    tx: &mut Transaction<'static, MySql>,
    user_id: &str,
    template_id: &str,
    email_settings: &EmailDeliverySettings,
) -> Result<(), anyhow::Error> {
    let template = templates::get(tx, template_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Template {template_id} not found"))?;
    let email_client = EmailClient::load(tx, email_settings)
        .await?
        .ok_or_else(|| anyhow::anyhow!("No email provider is configured"))?;

    // render against the user row as it stands now (including any write-back
    // from the current step)
    let user = users::get(tx, user_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("User {user_id} not found"))?;
    let recipient = UserAttributes::parse(user.clone())
        .map_err(anyhow::Error::msg)?
        .email();

    let subject = sandbox::eval_user_expr(&template.subject, &user)
        .with_context(|| format!("Subject of template {template_id} failed"))?;
    let html = sandbox::render_template(&template.html, &template.preamble, &[("user", &user)])
        .with_context(|| format!("Body of template {template_id} failed"))?;

    email_client.send(recipient.as_ref(), &subject, &html).await
}
