use actix_web::web;
use actix_web::HttpResponse;
use serde::Deserialize;
use serde::Serialize;
use sqlx::MySqlPool;

use crate::memberships;
use crate::routes::ApiError;
use crate::segments;
use crate::utils::success;

#[derive(Deserialize)]
pub struct SegmentBody {
    pub evaluator: String,
}

#[derive(Serialize)]
pub struct SegmentResponse {
    pub id: String,
    pub evaluator: String,
}

impl From<segments::Segment> for SegmentResponse {
    fn from(s: segments::Segment) -> Self {
        Self {
            id: s.id,
            evaluator: s.evaluator,
        }
    }
}

/// `POST /api/segment/{id}` — store the evaluator, run it once globally,
/// and fan the membership diff out to campaigns. A SQL text the database
/// rejects aborts the whole transaction and is the caller's error.
#[tracing::instrument(name = "Creating segment", skip(body, pool))]
pub async fn create_segment(
    path: web::Path<String>,
    body: web::Json<SegmentBody>,
    pool: web::Data<MySqlPool>,
) -> Result<HttpResponse, ApiError> {
    let segment_id = path.into_inner();
    let evaluator = body.into_inner().evaluator;

    let mut tx = pool.begin().await?;
    segments::insert(&mut tx, &segment_id, &evaluator)
        .await
        .map_err(|e| ApiError::Validation(format!("{e:#}")))?;
    let changes = segments::evaluate_global(&mut tx, &segment_id)
        .await
        .map_err(|e| ApiError::Validation(format!("{e:#}")))?;
    memberships::reevaluate_for_segment_change(&mut tx, &segment_id, &changes).await?;
    tx.commit().await?;

    Ok(success(serde_json::json!({
        "id": segment_id,
        "members": changes.total,
    })))
}

/// `PATCH /api/segment/{id}` — swap the evaluator and reevaluate from
/// scratch.
#[tracing::instrument(name = "Updating segment", skip(body, pool))]
pub async fn update_segment(
    path: web::Path<String>,
    body: web::Json<SegmentBody>,
    pool: web::Data<MySqlPool>,
) -> Result<HttpResponse, ApiError> {
    let segment_id = path.into_inner();
    let evaluator = body.into_inner().evaluator;

    let mut tx = pool.begin().await?;
    segments::update_evaluator(&mut tx, &segment_id, &evaluator).await?;
    let changes = segments::evaluate_global(&mut tx, &segment_id)
        .await
        .map_err(|e| ApiError::Validation(format!("{e:#}")))?;
    memberships::reevaluate_for_segment_change(&mut tx, &segment_id, &changes).await?;
    tx.commit().await?;

    Ok(success(serde_json::json!({
        "id": segment_id,
        "members": changes.total,
    })))
}

/// `DELETE /api/segment/{id}` — refused while any campaign references the
/// segment in an include or exclude list.
#[tracing::instrument(name = "Deleting segment", skip(pool))]
pub async fn delete_segment(
    path: web::Path<String>,
    pool: web::Data<MySqlPool>,
) -> Result<HttpResponse, ApiError> {
    let segment_id = path.into_inner();
    let mut tx = pool.begin().await?;
    if segments::referencing_campaigns(&mut tx, &segment_id).await? > 0 {
        return Err(ApiError::Constraint(format!(
            "Segment {segment_id} is referenced by a campaign; delete the campaign first"
        )));
    }
    let deleted = segments::delete(&mut tx, &segment_id).await?;
    if !deleted {
        return Err(anyhow::anyhow!("Segment {segment_id} not found").into());
    }
    tx.commit().await?;
    Ok(success(true))
}

#[tracing::instrument(name = "Listing segments", skip(pool))]
pub async fn list_segments(pool: web::Data<MySqlPool>) -> Result<HttpResponse, ApiError> {
    let mut tx = pool.begin().await?;
    let all: Vec<SegmentResponse> = segments::list(&mut tx)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    tx.commit().await?;
    Ok(success(all))
}

#[tracing::instrument(name = "Reading segment", skip(pool))]
pub async fn get_segment(
    path: web::Path<String>,
    pool: web::Data<MySqlPool>,
) -> Result<HttpResponse, ApiError> {
    let segment_id = path.into_inner();
    let mut tx = pool.begin().await?;
    let segment = segments::get(&mut tx, &segment_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Segment {segment_id} not found"))?;
    tx.commit().await?;
    Ok(success(SegmentResponse::from(segment)))
}

/// `GET /api/segment/{id}/user` — current member ids.
#[tracing::instrument(name = "Listing segment users", skip(pool))]
pub async fn list_segment_users(
    path: web::Path<String>,
    pool: web::Data<MySqlPool>,
) -> Result<HttpResponse, ApiError> {
    let segment_id = path.into_inner();
    let mut tx = pool.begin().await?;
    let members = segments::members(&mut tx, &segment_id).await?;
    tx.commit().await?;
    Ok(success(members))
}
