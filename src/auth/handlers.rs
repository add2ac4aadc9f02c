use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::{info, instrument, warn};

use super::{
    dto::{
        ConfirmEmailResponse, ForgotPasswordRequest, ResetPasswordRequest, SigninRequest,
        SignupRequest,
    },
    extractors::AuthUser,
    jwt::JwtKeys,
    services,
    session::{clear_session_cookie, extract_session_token, start_session},
};
use crate::{
    error::{ApiError, ApiJson, MessageResponse},
    state::AppState,
    users::dto::UserProfile,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/signup", post(signup))
        .route("/auth/signin", post(signin))
        .route("/auth/signout", get(signout))
        .route(
            "/auth/confirm-email/:token",
            get(confirm_email_redirect).post(confirm_email),
        )
        .route("/auth/resend-confirmation", post(resend_confirmation))
        .route("/auth/forgot", post(forgot_password))
        .route(
            "/auth/reset/:token",
            get(reset_token_redirect).post(reset_password),
        )
}

/// 302 with a `Location` header; axum's `Redirect` only offers 303/307/308.
pub(crate) fn found(location: &str) -> Response {
    let location = HeaderValue::from_str(location).unwrap_or(HeaderValue::from_static("/"));
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

/// Sanitized user plus a fresh session cookie.
async fn signed_in(state: &AppState, profile: UserProfile) -> Result<Response, ApiError> {
    let cookie = start_session(state, profile.id).await?;
    Ok(([(header::SET_COOKIE, cookie)], Json(profile)).into_response())
}

#[instrument(skip(state, payload))]
pub async fn signup(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<SignupRequest>,
) -> Result<Response, ApiError> {
    let user = services::signup(&state, payload).await?;
    signed_in(&state, UserProfile::own(&user)).await
}

#[instrument(skip(state, payload))]
pub async fn signin(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<SigninRequest>,
) -> Result<Response, ApiError> {
    let user = services::signin(&state, &payload.username, &payload.password).await?;
    signed_in(&state, UserProfile::own(&user)).await
}

/// Revokes the session if one is presented; always clears the cookie.
#[instrument(skip(state, headers))]
pub async fn signout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let cfg = &state.config.session;
    if let Some(token) = extract_session_token(&headers, &cfg.cookie_name) {
        if let Ok(claims) = JwtKeys::from_config(cfg).verify(&token) {
            match state.sessions.revoke(claims.sid).await {
                Ok(()) => info!(user_id = %claims.sub, "user signed out"),
                Err(e) => warn!(error = %e, "failed to revoke session"),
            }
        }
    }

    let mut res = found("/");
    res.headers_mut()
        .insert(header::SET_COOKIE, clear_session_cookie(cfg));
    res
}

/// Checks the token without consuming it and sends the browser to the client page.
#[instrument(skip(state, token))]
pub async fn confirm_email_redirect(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response, ApiError> {
    match state.users.find_by_email_token(&token).await? {
        Some(_) => Ok(found(&format!("/confirm-email/{token}"))),
        None => Ok(found("/confirm-email-invalid")),
    }
}

/// Unknown tokens still answer 200, with `user: null` and nothing changed.
#[instrument(skip(state, token))]
pub async fn confirm_email(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response, ApiError> {
    match services::confirm_email(&state, &token).await? {
        Some(confirmation) => {
            let body = ConfirmEmailResponse {
                profile_made_public: confirmation.made_public,
                user: Some(UserProfile::own(&confirmation.user)),
                message: None,
            };
            let cookie = start_session(&state, confirmation.user.id).await?;
            Ok(([(header::SET_COOKIE, cookie)], Json(body)).into_response())
        }
        None => Ok(Json(ConfirmEmailResponse {
            profile_made_public: false,
            user: None,
            message: Some(services::EMAIL_TOKEN_INVALID.into()),
        })
        .into_response()),
    }
}

#[instrument(skip(state))]
pub async fn resend_confirmation(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<MessageResponse>, ApiError> {
    services::resend_confirmation(&state, auth.user_id).await?;
    Ok(MessageResponse::new("Confirmation email sent."))
}

#[instrument(skip(state, payload))]
pub async fn forgot_password(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<ForgotPasswordRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    services::forgot_password(&state, &payload.username).await?;
    Ok(MessageResponse::new("Password reset sent."))
}

#[instrument(skip(state, token))]
pub async fn reset_token_redirect(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response, ApiError> {
    if services::reset_token_valid(&state, &token).await? {
        Ok(found(&format!("/password/reset/{token}")))
    } else {
        Ok(found("/password/reset/invalid"))
    }
}

#[instrument(skip(state, token, payload))]
pub async fn reset_password(
    State(state): State<AppState>,
    Path(token): Path<String>,
    ApiJson(payload): ApiJson<ResetPasswordRequest>,
) -> Result<Response, ApiError> {
    let user = services::reset_password(&state, &token, payload).await?;
    signed_in(&state, UserProfile::own(&user)).await
}
