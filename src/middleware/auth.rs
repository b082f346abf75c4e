use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};

use crate::api::handler::AppState;
use crate::error::AppError;

/// Hex SHA-256 digest of a bearer key. Digests are compared instead of raw
/// keys so the comparison does not depend on where the strings first differ.
pub fn key_digest(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

pub fn verify_key(presented: &str, expected_digest: &str) -> bool {
    key_digest(presented) == expected_digest
}

/// Requires `Authorization: Bearer <admin key>` on admin routes
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(AppError::Unauthorized)?;

    if !verify_key(presented, &state.admin_key_digest) {
        return Err(AppError::Unauthorized);
    }

    Ok(next.run(request).await)
}
