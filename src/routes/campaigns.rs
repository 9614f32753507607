use actix_web::web;
use actix_web::HttpResponse;
use serde::Deserialize;
use serde::Serialize;
use sqlx::MySqlPool;

use crate::campaigns;
use crate::campaigns::Campaign;
use crate::domain::CampaignBehavior;
use crate::routes::ApiError;
use crate::segments;
use crate::utils::success;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignBody {
    pub flow: String,
    pub segments: Vec<String>,
    #[serde(default)]
    pub exclude_segments: Vec<String>,
    pub behavior: CampaignBehavior,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignResponse {
    pub id: String,
    pub flow: String,
    pub behavior: CampaignBehavior,
    pub segments: Vec<String>,
    pub exclude_segments: Vec<String>,
}

impl From<Campaign> for CampaignResponse {
    fn from(c: Campaign) -> Self {
        Self {
            id: c.id,
            flow: c.flow,
            behavior: c.behavior,
            segments: c.segments,
            exclude_segments: c.exclude_segments,
        }
    }
}

/// `POST /api/campaign/{id}` — store the campaign and enroll everyone who
/// matches right now; each enrollment gets a pending execution, so the next
/// tick starts their flow.
#[tracing::instrument(name = "Creating campaign", skip(body, pool))]
pub async fn create_campaign(
    path: web::Path<String>,
    body: web::Json<CampaignBody>,
    pool: web::Data<MySqlPool>,
) -> Result<HttpResponse, ApiError> {
    let campaign_id = path.into_inner();
    let body = body.into_inner();
    if body.segments.is_empty() {
        return Err(ApiError::Validation(
            "A campaign needs at least one include segment".to_string(),
        ));
    }

    let mut tx = pool.begin().await?;
    for segment_id in body.segments.iter().chain(&body.exclude_segments) {
        if segments::get(&mut tx, segment_id).await?.is_none() {
            return Err(ApiError::Validation(format!(
                "Campaign references unknown segment {segment_id}"
            )));
        }
    }

    let campaign = Campaign {
        id: campaign_id,
        flow: body.flow,
        behavior: body.behavior,
        segments: body.segments,
        exclude_segments: body.exclude_segments,
    };
    campaigns::insert(&mut tx, &campaign).await?;
    let enrolled = campaigns::enroll_matching_users(&mut tx, &campaign).await?;
    tx.commit().await?;

    Ok(success(serde_json::json!({
        "id": campaign.id,
        "enrolled": enrolled,
    })))
}

/// `DELETE /api/campaign/{id}` — live executions are terminated, then the
/// campaign and its memberships go away.
#[tracing::instrument(name = "Deleting campaign", skip(pool))]
pub async fn delete_campaign(
    path: web::Path<String>,
    pool: web::Data<MySqlPool>,
) -> Result<HttpResponse, ApiError> {
    let campaign_id = path.into_inner();
    let mut tx = pool.begin().await?;
    let deleted = campaigns::delete(&mut tx, &campaign_id).await?;
    if !deleted {
        return Err(anyhow::anyhow!("Campaign {campaign_id} not found").into());
    }
    tx.commit().await?;
    Ok(success(true))
}

#[tracing::instrument(name = "Listing campaigns", skip(pool))]
pub async fn list_campaigns(pool: web::Data<MySqlPool>) -> Result<HttpResponse, ApiError> {
    let mut tx = pool.begin().await?;
    let all: Vec<CampaignResponse> = campaigns::list(&mut tx)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    tx.commit().await?;
    Ok(success(all))
}

#[tracing::instrument(name = "Reading campaign", skip(pool))]
pub async fn get_campaign(
    path: web::Path<String>,
    pool: web::Data<MySqlPool>,
) -> Result<HttpResponse, ApiError> {
    let campaign_id = path.into_inner();
    let mut tx = pool.begin().await?;
    let campaign = campaigns::get(&mut tx, &campaign_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Campaign {campaign_id} not found"))?;
    tx.commit().await?;
    Ok(success(CampaignResponse::from(campaign)))
}
