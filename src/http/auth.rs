//! Bearer-token authentication middleware.
//!
//! Stands in for the original identity provider: a static API token resolves
//! to the owning user, which downstream handlers read from request
//! extensions to bound every query to that user's machines.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;

use crate::model::User;
use crate::store::StoreError;

use super::{ApiError, AppState};

/// The authenticated caller, inserted into request extensions.
#[derive(Clone)]
pub struct CurrentUser(pub User);

pub async fn require_user(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let user = state.store.user_by_token(token).await.map_err(|e| match e {
        StoreError::NotFound => ApiError::Unauthorized,
        other => other.into(),
    })?;

    request.extensions_mut().insert(CurrentUser(user));
    Ok(next.run(request).await)
}
