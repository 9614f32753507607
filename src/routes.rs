mod campaigns;
mod config_push;
mod email_config;
mod health_check;
mod segments;
mod templates;
mod transactions;
mod users;

pub use campaigns::*;
pub use config_push::*;
pub use email_config::*;
pub use health_check::*;
pub use segments::*;
pub use templates::*;
pub use transactions::*;
pub use users::*;

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use actix_web::ResponseError;

use crate::reconcile::ReconcileError;
use crate::utils::error_chain_fmt;

/// The error surface of every `/api` handler. Bad input and broken
/// cross-entity constraints are the caller's fault (400); everything else,
/// including lookups of things that do not exist, falls through the generic
/// 500 path.
#[derive(thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Constraint(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl std::fmt::Debug for ApiError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::Constraint(_) => StatusCode::BAD_REQUEST,
            Self::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .json(serde_json::json!({ "error": self.to_string() }))
    }
}

impl From<ReconcileError> for ApiError {
    fn from(e: ReconcileError) -> Self {
        match e {
            ReconcileError::Validation(msg) => Self::Validation(msg),
            ReconcileError::UnsupportedCampaignUpdate(_) => Self::Constraint(e.to_string()),
            ReconcileError::Unexpected(inner) => Self::Unexpected(inner),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self { Self::Unexpected(e.into()) }
}
