use actix_web::web;
use actix_web::HttpResponse;
use serde::Deserialize;
use sqlx::MySqlPool;

use crate::domain::EmailAddress;
use crate::email_client;
use crate::email_client::ProviderConfig;
use crate::routes::ApiError;
use crate::utils::success;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailConfigBody {
    pub config: ProviderConfig,
    pub from_address: String,
}

/// `POST /api/email/config` — replace the provider singleton.
#[tracing::instrument(name = "Configuring email provider", skip(body, pool))]
pub async fn set_email_config(
    body: web::Json<EmailConfigBody>,
    pool: web::Data<MySqlPool>,
) -> Result<HttpResponse, ApiError> {
    let body = body.into_inner();
    let from_address =
        EmailAddress::parse(body.from_address).map_err(ApiError::Validation)?;

    let mut tx = pool.begin().await?;
    email_client::set_provider(&mut tx, &body.config, &from_address).await?;
    tx.commit().await?;
    Ok(success(true))
}
