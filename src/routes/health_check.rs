use actix_web::HttpResponse;

/// Unauthenticated liveness probe; says nothing about the database.
pub async fn health_check() -> HttpResponse { HttpResponse::Ok().finish() }
