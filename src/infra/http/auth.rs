use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;
use kinfeed_api_types::UserId;

use crate::application::error::HttpError;

/// Header carrying the caller's id when requests arrive from a trusted
/// authenticating proxy.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Identity of the caller, stored as a request extension by the
/// authenticating layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser(pub UserId);

impl AuthenticatedUser {
    pub fn id(&self) -> UserId {
        self.0
    }
}

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedUser>()
            .copied()
            .ok_or_else(|| {
                HttpError::new(
                    "infra::http::auth",
                    StatusCode::UNAUTHORIZED,
                    "Authentication required",
                    "request carries no authenticated user",
                )
            })
    }
}
