//! Bearer-token authentication for the `/api` scope. One shared key,
//! supplied by the operator through `SEGFLOW_API_KEY`; there are no user
//! accounts.

use actix_web::body::MessageBody;
use actix_web::dev::ServiceRequest;
use actix_web::dev::ServiceResponse;
use actix_web::error::InternalError;
use actix_web::http::header;
use actix_web::web::Data;
use actix_web::HttpResponse;
use actix_web_lab::middleware::Next;
use secrecy::ExposeSecret;
use secrecy::Secret;

/// Wrapper so the key can be shared through `Data` without colliding with
/// other `Secret<String>` state.
#[derive(Clone)]
pub struct ApiKey(pub Secret<String>);

/// Middleware for the whole `/api` scope; see
/// `actix_web_lab::middleware::from_fn`.
pub async fn reject_invalid_api_key(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, actix_web::Error> {
    let expected = req
        .app_data::<Data<ApiKey>>()
        .ok_or_else(|| actix_web::error::ErrorInternalServerError("API key is not configured"))?;

    match bearer_token(&req) {
        Some(token) if token == expected.0.expose_secret() => next.call(req).await,
        _ => {
            let resp = HttpResponse::Unauthorized()
                .json(serde_json::json!({ "error": "Invalid or missing API key" }));
            let e = anyhow::anyhow!("Invalid or missing API key");
            Err(InternalError::from_response(e, resp).into())
        }
    }
}

fn bearer_token(req: &ServiceRequest) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}
