//! Bearer credential extractor for per-job endpoints.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use docconv_core::error::CoreError;

use crate::error::AppError;

/// The capability secret presented in `Authorization: Bearer <secret>`.
///
/// Only the header shape is checked here. Grammar and digest checks belong
/// to the engine, which orders them against the job lookup.
///
/// ```ignore
/// async fn my_handler(secret: BearerSecret) -> AppResult<Json<()>> {
///     state.engine.get(&id, secret.expose()).await?;
///     Ok(Json(()))
/// }
/// ```
#[derive(Clone)]
pub struct BearerSecret(String);

impl BearerSecret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for BearerSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BearerSecret(<redacted>)")
    }
}

impl<S> FromRequestParts<S> for BearerSecret
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                AppError::Core(CoreError::Unauthorized(
                    "Missing Authorization header".into(),
                ))
            })?;

        let secret = parse_bearer(auth_header).ok_or_else(|| {
            AppError::Core(CoreError::Unauthorized(
                "Invalid Authorization format. Expected: Bearer <token>".into(),
            ))
        })?;

        Ok(BearerSecret(secret.to_string()))
    }
}

/// The credential after a case-insensitive `Bearer` scheme, if any.
fn parse_bearer(header: &str) -> Option<&str> {
    let (scheme, credential) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let credential = credential.trim();
    (!credential.is_empty()).then_some(credential)
}
