use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use courier_keys::{KeyError, PublishKeys};
use serde::Deserialize;
use serde_json::json;

use crate::auth::AuthedUser;
use crate::state::SharedState;

/// `POST /device-keys` — publish a device's public key bundle and an
/// optional batch of one-time prekeys. Private keys must never be sent
/// here; every field is public material.
pub async fn publish_device_keys(
    State(state): State<SharedState>,
    AuthedUser(user_id): AuthedUser,
    Json(request): Json<PublishKeys>,
) -> impl IntoResponse {
    match state.bootstrap.publish(&user_id, &request) {
        Ok(_) => (StatusCode::OK, Json(json!({ "success": true }))),
        Err(e) => key_error_response(&user_id, "publish", &e),
    }
}

#[derive(Deserialize)]
pub struct FetchParams {
    pub device_id: Option<String>,
}

/// `GET /device-keys/{user_id}?device_id=` — assemble a bundle for a
/// session initiator, consuming one one-time prekey when available.
/// An exhausted pool is a success with `one_time_prekey: null`.
pub async fn fetch_device_keys(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
    Query(params): Query<FetchParams>,
) -> impl IntoResponse {
    match state
        .bootstrap
        .fetch_bundle(&user_id, params.device_id.as_deref())
    {
        Ok(bundle) => (
            StatusCode::OK,
            Json(json!({ "success": true, "data": bundle })),
        ),
        Err(e) => key_error_response(&user_id, "fetch", &e),
    }
}

fn key_error_response(
    user_id: &str,
    op: &'static str,
    error: &KeyError,
) -> (StatusCode, Json<serde_json::Value>) {
    let status = match error {
        KeyError::Validation(_) => StatusCode::BAD_REQUEST,
        KeyError::NotFound(_) => StatusCode::NOT_FOUND,
        KeyError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(user = %user_id, op, error = %error, "device key operation failed");
    } else {
        tracing::debug!(user = %user_id, op, error = %error, "device key request rejected");
    }
    (
        status,
        Json(json!({ "success": false, "error": error.to_string() })),
    )
}
