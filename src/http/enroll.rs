//! Agent enrollment: claim-code issuance (owner side) and redemption
//! (installer side). A redeemed code creates a `pending` machine; the agent
//! then dials the advertised stream address and connects.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;

use crate::model::{ClaimCode, Machine};
use crate::store::StoreError;

use super::auth::CurrentUser;
use super::{ApiError, AppState};

/// Claim codes are short-lived by design: long enough to paste into an
/// installer, not long enough to leak usefully.
const CLAIM_TTL: Duration = Duration::from_secs(15 * 60);

/// POST /claim-codes
pub async fn issue_claim_code(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let claim = ClaimCode::generate(&user.id, CLAIM_TTL);
    state.store.create_claim(&claim).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "claim_code": claim.code,
            "expires_at": claim.expires_at.to_rfc3339(),
        })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct EnrollRequest {
    pub claim_code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// POST /agents/enroll — unauthenticated; the claim code is the credential.
pub async fn enroll(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EnrollRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name is required".to_string()));
    }

    let claim = state
        .store
        .redeem_claim(&body.claim_code)
        .await
        .map_err(|e| match e {
            StoreError::NotFound => {
                ApiError::BadRequest("invalid or expired claim code".to_string())
            }
            other => other.into(),
        })?;

    let machine = Machine::new(&claim.user_id, body.name.trim(), &body.description);
    state.store.create_machine(&machine).await?;

    tracing::info!(machine = %machine.id, user = %claim.user_id, "machine enrolled");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "machine_id": machine.id,
            "rpc_address": state.rpc_advertise,
        })),
    ))
}
