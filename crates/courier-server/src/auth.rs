//! Caller identity extraction.
//!
//! Token issuance and validation are an upstream concern (a gateway or auth
//! middleware terminates the session token); by the time a request reaches
//! these handlers the verified identity travels in the `x-user-id` header.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

const USER_HEADER: &str = "x-user-id";

/// The authenticated user id of the current request.
pub struct AuthedUser(pub String);

impl<S> FromRequestParts<S> for AuthedUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<Value>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if user_id.is_empty() {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({ "success": false, "error": "unauthorized" })),
            ));
        }
        Ok(AuthedUser(user_id.to_string()))
    }
}
