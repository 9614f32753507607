use actix_web::web;
use actix_web::HttpResponse;
use sqlx::MySqlPool;

use crate::reconcile;
use crate::reconcile::ConfigPush;
use crate::reconcile::PushOutcome;
use crate::routes::ApiError;
use crate::utils::success;

/// `POST /api/config` — diff the pushed configuration against the last
/// accepted one and apply the difference; the whole push is one
/// transaction, so a rejected operation leaves nothing half-applied.
#[tracing::instrument(name = "Pushing configuration", skip(body, pool))]
pub async fn push_config(
    body: web::Json<ConfigPush>,
    pool: web::Data<MySqlPool>,
) -> Result<HttpResponse, ApiError> {
    let mut tx = pool.begin().await?;
    let outcome = reconcile::apply(&mut tx, body.into_inner()).await?;
    tx.commit().await?;

    Ok(match outcome {
        PushOutcome::NoChanges => success("no changes"),
        PushOutcome::Applied { config_id } => success(serde_json::json!({
            "configId": config_id,
        })),
    })
}
