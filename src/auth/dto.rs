use serde::{Deserialize, Serialize};

use crate::users::dto::UserProfile;

/// Request body for `POST /api/auth/signup`. Missing strings default to empty
/// so validation can answer with a specific message.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// `username` may hold either the username or the email address.
#[derive(Debug, Deserialize)]
pub struct SigninRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ForgotPasswordRequest {
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetPasswordRequest {
    #[serde(default)]
    pub new_password: String,
    #[serde(default)]
    pub verify_password: String,
}

/// Answer to `POST /api/auth/confirm-email/:token`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmEmailResponse {
    pub profile_made_public: bool,
    pub user: Option<UserProfile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
