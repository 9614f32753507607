use actix_web::HttpResponse;
use serde::Serialize;

/// Every successful API call responds with this envelope.
pub fn success<T: Serialize>(value: T) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "success": true, "value": value }))
}

/// Walk an error's `source` chain so the whole cause ends up in the log,
/// not just the outermost message.
pub fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{e}\n")?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{cause}")?;
        current = cause.source();
    }
    Ok(())
}
