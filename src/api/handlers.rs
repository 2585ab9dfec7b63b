use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::lease::{LeaseError, LeaseRegistry, ValidationError};
use crate::models::*;

type Registry = State<Arc<LeaseRegistry>>;
type ApiError = (StatusCode, String);

// ============================================================
// Error Handling
// ============================================================

/// Map a registry error to a response. Validation problems are safe to show
/// the client; store failures are logged and reported generically.
fn lease_error(e: LeaseError) -> ApiError {
    match e {
        LeaseError::Validation(ValidationError::NotCursed(subject)) => {
            (StatusCode::NOT_FOUND, format!("Subject {} is not cursed", subject))
        }
        LeaseError::Validation(v) => {
            tracing::warn!("Validation error: {}", v);
            (StatusCode::BAD_REQUEST, v.to_string())
        }
        LeaseError::Store(s) => {
            tracing::error!("Internal error: {}", s);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            )
        }
    }
}

fn not_cursed(subject_id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        format!("Subject {} is not cursed", subject_id),
    )
}

// ============================================================
// Health
// ============================================================

pub async fn health(State(registry): Registry) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "active_leases": registry.active_leases().len(),
        "pending_expirations": registry.pending_expirations(),
    }))
}

// ============================================================
// Leases
// ============================================================

pub async fn list_leases(State(registry): Registry) -> Json<Vec<LeaseStatus>> {
    Json(registry.active_leases())
}

pub async fn get_lease(
    State(registry): Registry,
    Path(subject_id): Path<String>,
) -> Result<Json<LeaseStatus>, ApiError> {
    validate_subject(&subject_id).map_err(|e| lease_error(e.into()))?;
    registry
        .get(&subject_id)
        .map(Json)
        .ok_or_else(|| not_cursed(&subject_id))
}

pub async fn curse(
    State(registry): Registry,
    Path(subject_id): Path<String>,
) -> Result<(StatusCode, Json<CurseOutcome>), ApiError> {
    let outcome = registry.curse(&subject_id).await.map_err(lease_error)?;
    let status = if outcome.is_new() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReminderResponse {
    pub subject_id: String,
    pub remaining_days: u32,
}

pub async fn remind(
    State(registry): Registry,
    Path(subject_id): Path<String>,
) -> Result<Json<ReminderResponse>, ApiError> {
    let remaining_days = registry
        .remind(&subject_id)
        .map_err(lease_error)?
        .ok_or_else(|| not_cursed(&subject_id))?;
    Ok(Json(ReminderResponse {
        subject_id,
        remaining_days,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ReleaseQuery {
    pub reason: Option<ReleaseReason>,
}

/// Administrative release. Defaults to atonement.
pub async fn release(
    State(registry): Registry,
    Path(subject_id): Path<String>,
    Query(query): Query<ReleaseQuery>,
) -> Result<Json<Lease>, ApiError> {
    let reason = query.reason.unwrap_or(ReleaseReason::Atoned);
    registry
        .release(&subject_id, reason)
        .await
        .map_err(lease_error)?
        .map(Json)
        .ok_or_else(|| not_cursed(&subject_id))
}

pub async fn transfer(
    State(registry): Registry,
    Path(subject_id): Path<String>,
    Json(input): Json<TransferInput>,
) -> Result<Json<CurseOutcome>, ApiError> {
    registry
        .transfer(&subject_id, &input.to)
        .await
        .map(Json)
        .map_err(lease_error)
}
