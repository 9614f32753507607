use actix_web::web;
use actix_web::HttpResponse;
use serde::Deserialize;
use serde::Serialize;
use sqlx::MySqlPool;

use crate::routes::ApiError;
use crate::transactions;
use crate::transactions::TransactionDef;
use crate::utils::success;

#[derive(Deserialize)]
pub struct TransactionBody {
    pub event: String,
    pub subject: String,
    pub html: String,
    #[serde(default)]
    pub preamble: String,
}

#[derive(Serialize)]
pub struct TransactionResponse {
    pub id: String,
    pub event: String,
    pub subject: String,
    pub html: String,
    pub preamble: String,
}

impl From<TransactionDef> for TransactionResponse {
    fn from(t: TransactionDef) -> Self {
        Self {
            id: t.id,
            event: t.event,
            subject: t.subject,
            html: t.html,
            preamble: t.preamble,
        }
    }
}

#[tracing::instrument(name = "Creating transaction", skip(body, pool))]
pub async fn create_transaction(
    path: web::Path<String>,
    body: web::Json<TransactionBody>,
    pool: web::Data<MySqlPool>,
) -> Result<HttpResponse, ApiError> {
    let def = def_from(path.into_inner(), body.into_inner())?;
    let mut tx = pool.begin().await?;
    transactions::insert(&mut tx, &def).await?;
    tx.commit().await?;
    Ok(success(TransactionResponse::from(def)))
}

#[tracing::instrument(name = "Updating transaction", skip(body, pool))]
pub async fn update_transaction(
    path: web::Path<String>,
    body: web::Json<TransactionBody>,
    pool: web::Data<MySqlPool>,
) -> Result<HttpResponse, ApiError> {
    let def = def_from(path.into_inner(), body.into_inner())?;
    let mut tx = pool.begin().await?;
    transactions::update(&mut tx, &def).await?;
    tx.commit().await?;
    Ok(success(TransactionResponse::from(def)))
}

#[tracing::instrument(name = "Deleting transaction", skip(pool))]
pub async fn delete_transaction(
    path: web::Path<String>,
    pool: web::Data<MySqlPool>,
) -> Result<HttpResponse, ApiError> {
    let transaction_id = path.into_inner();
    let mut tx = pool.begin().await?;
    let deleted = transactions::delete(&mut tx, &transaction_id).await?;
    if !deleted {
        return Err(anyhow::anyhow!("Transaction {transaction_id} not found").into());
    }
    tx.commit().await?;
    Ok(success(true))
}

#[tracing::instrument(name = "Reading transaction", skip(pool))]
pub async fn get_transaction(
    path: web::Path<String>,
    pool: web::Data<MySqlPool>,
) -> Result<HttpResponse, ApiError> {
    let transaction_id = path.into_inner();
    let mut tx = pool.begin().await?;
    let def = transactions::get(&mut tx, &transaction_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Transaction {transaction_id} not found"))?;
    tx.commit().await?;
    Ok(success(TransactionResponse::from(def)))
}

#[tracing::instrument(name = "Listing transactions", skip(pool))]
pub async fn list_transactions(pool: web::Data<MySqlPool>) -> Result<HttpResponse, ApiError> {
    let mut tx = pool.begin().await?;
    let all: Vec<TransactionResponse> = transactions::list(&mut tx)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    tx.commit().await?;
    Ok(success(all))
}

fn def_from(
    id: String,
    body: TransactionBody,
) -> Result<TransactionDef, ApiError> {
    if body.event.is_empty() {
        return Err(ApiError::Validation(
            "Transaction event name cannot be empty".to_string(),
        ));
    }
    Ok(TransactionDef {
        id,
        event: body.event,
        subject: body.subject,
        html: body.html,
        preamble: body.preamble,
    })
}
