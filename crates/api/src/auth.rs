//! Caller identity
//!
//! Authentication happens upstream of this service; the resolved user id
//! arrives in the `x-user-id` header.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use liverelay_shared::UserId;

use crate::error::ApiError;

pub const USER_ID_HEADER: &str = "x-user-id";

fn identity(parts: &Parts) -> Option<UserId> {
    parts
        .headers
        .get(USER_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .and_then(UserId::parse)
}

/// Required caller identity; rejects with 401 when absent
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub UserId);

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        identity(parts)
            .map(AuthenticatedUser)
            .ok_or(ApiError::Unauthorized)
    }
}

/// Caller identity when present
#[derive(Debug, Clone)]
pub struct OptionalUser(pub Option<UserId>);

#[async_trait]
impl<S> FromRequestParts<S> for OptionalUser
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(OptionalUser(identity(parts)))
    }
}
