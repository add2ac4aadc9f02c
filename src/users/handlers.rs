use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, Path, State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post, put},
    Json, Router,
};
use tracing::{info, instrument, warn};

use super::{
    dto::{ChangePasswordRequest, ProfileUpdate, UserProfile},
    services,
};
use crate::{
    auth::{extractors::AuthUser, handlers::found},
    error::{ApiError, ApiJson, MessageResponse},
    images::services::{avatar_url, upload_avatar, ImageFormat},
    state::AppState,
};

pub const AVATAR_FIELD: &str = "avatar";
const IMAGE_TOO_LARGE: &str = "Image is too large.";

pub fn read_routes() -> Router<AppState> {
    Router::new()
        .route("/users/:username", get(get_profile))
        .route("/users/:username/avatar", get(get_avatar))
}

pub fn write_routes(avatar_max_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/users", put(update_profile))
        .route("/users/password", post(change_password))
        .route(
            "/users-avatar",
            // Headroom for multipart framing around the file itself.
            post(upload_avatar_multipart).layer(DefaultBodyLimit::max(avatar_max_bytes + 64 * 1024)),
        )
}

#[instrument(skip(state))]
pub async fn get_profile(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(username): Path<String>,
) -> Result<Json<UserProfile>, ApiError> {
    let (user, own) = services::read_profile(&state, auth.user_id, &username).await?;
    Ok(Json(if own {
        UserProfile::own(&user)
    } else {
        UserProfile::public(&user)
    }))
}

#[instrument(skip(state, payload))]
pub async fn update_profile(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(payload): ApiJson<ProfileUpdate>,
) -> Result<Json<UserProfile>, ApiError> {
    let user = services::update_profile(&state, auth.user_id, payload).await?;
    Ok(Json(UserProfile::own(&user)))
}

#[instrument(skip(state, payload))]
pub async fn change_password(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(payload): ApiJson<ChangePasswordRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    services::change_password(&state, auth.user_id, payload).await?;
    Ok(MessageResponse::new("Password changed successfully!"))
}

/// POST /users-avatar (multipart)
/// Field: `avatar` (one JPG, PNG or GIF file); other fields are ignored.
#[instrument(skip(state, mp))]
pub async fn upload_avatar_multipart(
    State(state): State<AppState>,
    auth: AuthUser,
    mp: Result<Multipart, MultipartRejection>,
) -> Result<Json<MessageResponse>, ApiError> {
    let Ok(mut mp) = mp else {
        return Err(ApiError::bad_request("Missing avatar image."));
    };

    let mut avatar = None;
    while let Some(field) = mp.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(AVATAR_FIELD) {
            continue;
        }
        let data = field.bytes().await.map_err(multipart_error)?;
        avatar = Some(data);
        break;
    }

    let data = avatar.ok_or_else(|| ApiError::bad_request("Missing avatar image."))?;
    if data.len() > state.config.avatar_max_bytes {
        return Err(ApiError::PayloadTooLarge(IMAGE_TOO_LARGE.into()));
    }
    let format = ImageFormat::detect(&data)
        .ok_or_else(|| ApiError::bad_request("Please upload a JPG, PNG or GIF image."))?;

    let user = upload_avatar(&state, auth.user_id, data, format).await?;
    info!(user_id = %user.id, format = ?format, "avatar uploaded");
    Ok(MessageResponse::new("Avatar image uploaded."))
}

/// Body-limit hits are 413; anything else is a malformed request.
fn multipart_error(e: MultipartError) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        warn!(error = %e, "avatar upload over body limit");
        ApiError::PayloadTooLarge(IMAGE_TOO_LARGE.into())
    } else {
        warn!(error = %e, "malformed multipart body");
        ApiError::bad_request(e.body_text())
    }
}

/// 302 to wherever the avatar currently lives.
#[instrument(skip(state))]
pub async fn get_avatar(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(username): Path<String>,
) -> Result<Response, ApiError> {
    let (user, _) = services::read_profile(&state, auth.user_id, &username).await?;
    match avatar_url(&state, &user).await? {
        Some(url) => Ok(found(&url)),
        None => Err(ApiError::not_found("No avatar.")),
    }
}
