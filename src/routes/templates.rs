use actix_web::web;
use actix_web::HttpResponse;
use serde::Deserialize;
use serde::Serialize;
use sqlx::MySqlPool;

use crate::routes::ApiError;
use crate::templates;
use crate::templates::Template;
use crate::utils::success;

#[derive(Deserialize)]
pub struct TemplateBody {
    pub subject: String,
    pub html: String,
    #[serde(default)]
    pub preamble: String,
}

#[derive(Serialize)]
pub struct TemplateResponse {
    pub id: String,
    pub subject: String,
    pub html: String,
    pub preamble: String,
}

impl From<Template> for TemplateResponse {
    fn from(t: Template) -> Self {
        Self {
            id: t.id,
            subject: t.subject,
            html: t.html,
            preamble: t.preamble,
        }
    }
}

#[tracing::instrument(name = "Creating template", skip(body, pool))]
pub async fn create_template(
    path: web::Path<String>,
    body: web::Json<TemplateBody>,
    pool: web::Data<MySqlPool>,
) -> Result<HttpResponse, ApiError> {
    let template = template_from(path.into_inner(), body.into_inner());
    let mut tx = pool.begin().await?;
    templates::insert(&mut tx, &template).await?;
    tx.commit().await?;
    Ok(success(TemplateResponse::from(template)))
}

#[tracing::instrument(name = "Updating template", skip(body, pool))]
pub async fn update_template(
    path: web::Path<String>,
    body: web::Json<TemplateBody>,
    pool: web::Data<MySqlPool>,
) -> Result<HttpResponse, ApiError> {
    let template = template_from(path.into_inner(), body.into_inner());
    let mut tx = pool.begin().await?;
    templates::update(&mut tx, &template).await?;
    tx.commit().await?;
    Ok(success(TemplateResponse::from(template)))
}

#[tracing::instrument(name = "Deleting template", skip(pool))]
pub async fn delete_template(
    path: web::Path<String>,
    pool: web::Data<MySqlPool>,
) -> Result<HttpResponse, ApiError> {
    let template_id = path.into_inner();
    let mut tx = pool.begin().await?;
    let deleted = templates::delete(&mut tx, &template_id).await?;
    if !deleted {
        return Err(anyhow::anyhow!("Template {template_id} not found").into());
    }
    tx.commit().await?;
    Ok(success(true))
}

#[tracing::instrument(name = "Reading template", skip(pool))]
pub async fn get_template(
    path: web::Path<String>,
    pool: web::Data<MySqlPool>,
) -> Result<HttpResponse, ApiError> {
    let template_id = path.into_inner();
    let mut tx = pool.begin().await?;
    let template = templates::get(&mut tx, &template_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Template {template_id} not found"))?;
    tx.commit().await?;
    Ok(success(TemplateResponse::from(template)))
}

#[tracing::instrument(name = "Listing templates", skip(pool))]
pub async fn list_templates(pool: web::Data<MySqlPool>) -> Result<HttpResponse, ApiError> {
    let mut tx = pool.begin().await?;
    let all: Vec<TemplateResponse> = templates::list(&mut tx)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    tx.commit().await?;
    Ok(success(all))
}

fn template_from(
    id: String,
    body: TemplateBody,
) -> Template {
    Template {
        id,
        subject: body.subject,
        html: body.html,
        preamble: body.preamble,
    }
}
