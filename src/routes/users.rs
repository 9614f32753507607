use actix_web::web;
use actix_web::HttpResponse;
use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;
use sqlx::MySqlPool;

use crate::configuration::EmailDeliverySettings;
use crate::domain::UserAttributes;
use crate::memberships;
use crate::routes::ApiError;
use crate::segments;
use crate::segments::SegmentScope;
use crate::transactions;
use crate::users;
use crate::utils::success;

#[derive(Deserialize)]
pub struct AttributesBody {
    pub attributes: Value,
}

/// `POST /api/user/{id}` — create the user, then work out which segments
/// and campaigns they land in, all in one transaction.
#[tracing::instrument(name = "Creating user", skip(body, pool))]
pub async fn create_user(
    path: web::Path<String>,
    body: web::Json<AttributesBody>,
    pool: web::Data<MySqlPool>,
) -> Result<HttpResponse, ApiError> {
    let user_id = path.into_inner();
    let attributes =
        UserAttributes::parse(body.into_inner().attributes).map_err(ApiError::Validation)?;

    let mut tx = pool.begin().await?;
    users::insert(&mut tx, &user_id, &attributes)
        .await
        .with_context(|| format!("Could not insert user {user_id}"))?;
    memberships::reevaluate_user(&mut tx, &user_id, SegmentScope::All, "user created").await?;
    tx.commit().await?;

    Ok(success(attributes.as_value()))
}

/// `PATCH /api/user/{id}` — shallow-merge the supplied attributes over the
/// stored document and reevaluate.
#[tracing::instrument(name = "Updating user", skip(body, pool))]
pub async fn update_user(
    path: web::Path<String>,
    body: web::Json<AttributesBody>,
    pool: web::Data<MySqlPool>,
) -> Result<HttpResponse, ApiError> {
    let user_id = path.into_inner();
    let Value::Object(partial) = body.into_inner().attributes else {
        return Err(ApiError::Validation(
            "Attributes must be a JSON object".to_string(),
        ));
    };

    let mut tx = pool.begin().await?;
    let existing = users::get(&mut tx, &user_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("User {user_id} not found"))?;
    let existing = UserAttributes::parse(existing)
        .map_err(|e| anyhow::anyhow!("Stored attributes of {user_id} are invalid: {e}"))?;
    let merged = existing.merge(partial).map_err(ApiError::Validation)?;
    users::update_attributes(&mut tx, &user_id, &merged).await?;
    memberships::reevaluate_user(&mut tx, &user_id, SegmentScope::All, "user updated").await?;
    tx.commit().await?;

    Ok(success(merged.as_value()))
}

#[tracing::instrument(name = "Reading user", skip(pool))]
pub async fn get_user(
    path: web::Path<String>,
    pool: web::Data<MySqlPool>,
) -> Result<HttpResponse, ApiError> {
    let user_id = path.into_inner();
    let mut tx = pool.begin().await?;
    let attributes = users::get(&mut tx, &user_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("User {user_id} not found"))?;
    tx.commit().await?;
    Ok(success(attributes))
}

/// `DELETE /api/user/{id}` — events, memberships, executions and history
/// all cascade.
#[tracing::instrument(name = "Deleting user", skip(pool))]
pub async fn delete_user(
    path: web::Path<String>,
    pool: web::Data<MySqlPool>,
) -> Result<HttpResponse, ApiError> {
    let user_id = path.into_inner();
    let mut tx = pool.begin().await?;
    let deleted = users::delete(&mut tx, &user_id).await?;
    if !deleted {
        return Err(anyhow::anyhow!("User {user_id} not found").into());
    }
    tx.commit().await?;
    Ok(success(true))
}

/// `POST /api/user/{id}/event/{name}` — insert the event and reevaluate the
/// segments the event name triggers, in one transaction; then dispatch any
/// matching transactional email best-effort after the commit.
#[tracing::instrument(name = "Emitting event", skip(body, pool, email_settings))]
pub async fn emit_event(
    path: web::Path<(String, String)>,
    body: web::Json<AttributesBody>,
    pool: web::Data<MySqlPool>,
    email_settings: web::Data<EmailDeliverySettings>,
) -> Result<HttpResponse, ApiError> {
    let (user_id, event_name) = path.into_inner();
    let attributes = body.into_inner().attributes;
    if !attributes.is_object() {
        return Err(ApiError::Validation(
            "Attributes must be a JSON object".to_string(),
        ));
    }

    let mut tx = pool.begin().await?;
    users::get(&mut tx, &user_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("User {user_id} not found"))?;
    let event_id = users::insert_event(&mut tx, &user_id, &event_name, &attributes).await?;
    memberships::reevaluate_user(
        &mut tx,
        &user_id,
        SegmentScope::EventTriggered(&event_name),
        "event ingested",
    )
    .await?;
    tx.commit().await?;

    // the event row is durable at this point; a failing provider must not
    // undo it
    transactions::dispatch(&pool, &email_settings, &user_id, &event_name, &attributes).await;

    Ok(success(event_id))
}

#[tracing::instrument(name = "Listing user events", skip(pool))]
pub async fn list_user_events(
    path: web::Path<String>,
    pool: web::Data<MySqlPool>,
) -> Result<HttpResponse, ApiError> {
    let user_id = path.into_inner();
    let mut tx = pool.begin().await?;
    let events = users::list_events(&mut tx, &user_id).await?;
    tx.commit().await?;
    Ok(success(events))
}

#[tracing::instrument(name = "Listing user segments", skip(pool))]
pub async fn list_user_segments(
    path: web::Path<String>,
    pool: web::Data<MySqlPool>,
) -> Result<HttpResponse, ApiError> {
    let user_id = path.into_inner();
    let mut tx = pool.begin().await?;
    let segment_ids = segments::user_segments(&mut tx, &user_id).await?;
    tx.commit().await?;
    Ok(success(segment_ids))
}
