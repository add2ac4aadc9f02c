use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{jwt::JwtKeys, session::extract_session_token};
use crate::{error::ApiError, state::AppState};

/// Authenticated caller: a verified session token whose session is still live.
/// Rejects with 403 `Forbidden.` otherwise.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub user_id: Uuid,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let cfg = &state.config.session;
        let token = extract_session_token(&parts.headers, &cfg.cookie_name)
            .ok_or_else(ApiError::forbidden)?;

        let claims = JwtKeys::from_config(cfg).verify(&token).map_err(|e| {
            debug!(error = %e, "invalid or expired session token");
            ApiError::forbidden()
        })?;

        match state.sessions.active_user(claims.sid).await? {
            Some(user_id) if user_id == claims.sub => Ok(AuthUser { user_id }),
            _ => {
                warn!(session_id = %claims.sid, "session revoked or expired");
                Err(ApiError::forbidden())
            }
        }
    }
}
