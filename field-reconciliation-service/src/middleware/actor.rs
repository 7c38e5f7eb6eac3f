//! Actor context for human overrides.
//!
//! The caller identity arrives in the `X-User-ID` header, set by the
//! application in front of this service after it has authenticated the user.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;

pub const USER_ID_HEADER: &str = "X-User-ID";

/// Who is performing a manual reconciliation action.
#[derive(Debug, Clone)]
pub struct ActorContext {
    pub user_id: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for ActorContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                AppError::Unauthorized(anyhow::anyhow!("Missing {} header", USER_ID_HEADER))
            })?;

        tracing::Span::current().record("user_id", user_id);

        Ok(Self {
            user_id: user_id.to_string(),
        })
    }
}
