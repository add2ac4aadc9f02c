use lazy_static::lazy_static;
use regex::Regex;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    dto::{ResetPasswordRequest, SignupRequest},
    password::{check_new_password, hash_password, verify_password, MIN_PASSWORD_LEN},
    tokens::{generate_reset_token, generate_token},
};
use crate::{
    error::ApiError,
    mailer::{Mail, MailKind},
    state::AppState,
    users::repo_types::{EmailConfirmation, NewUser, User},
};

pub const FORGOT_MISSING_IDENT: &str = "Please, we really need your username or email first...";
pub const FORGOT_UNKNOWN_ACCOUNT: &str =
    "We could not find an account with that username or email. Make sure you have it spelled correctly.";
pub const RESET_TOKEN_INVALID: &str = "Password reset token is invalid or has expired.";
pub const EMAIL_TOKEN_INVALID: &str = "Email confirm token is invalid or has expired.";

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// 3-34 characters of letters, digits, `.`, `-`, `_`, starting and ending
/// with a letter or digit.
pub(crate) fn is_valid_username(username: &str) -> bool {
    lazy_static! {
        static ref USERNAME_RE: Regex =
            Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9._-]{1,32})[A-Za-z0-9]$").unwrap();
    }
    USERNAME_RE.is_match(username)
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub async fn signup(st: &AppState, req: SignupRequest) -> Result<User, ApiError> {
    let first_name = req.first_name.trim().to_string();
    let last_name = req.last_name.trim().to_string();
    let display_username = req.username.trim().to_string();
    let email = normalize_email(&req.email);

    if first_name.is_empty() || last_name.is_empty() {
        return Err(ApiError::bad_request("Please fill in your first and last name."));
    }
    if !is_valid_username(&display_username) {
        warn!(username = %display_username, "invalid username");
        return Err(ApiError::bad_request("Invalid username."));
    }
    if !is_valid_email(&email) {
        warn!("invalid email");
        return Err(ApiError::bad_request("Invalid email."));
    }
    if req.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::bad_request(
            "Password must be at least 8 characters long.",
        ));
    }

    let password_hash = hash_password(&req.password)?;
    let email_token = generate_token();
    let user = st
        .users
        .create(NewUser {
            username: display_username.to_lowercase(),
            display_username,
            email,
            first_name,
            last_name,
            password_hash,
            email_token: email_token.clone(),
        })
        .await?;

    info!(user_id = %user.id, username = %user.username, "user registered");
    // Mail failure must not undo a saved account.
    if let Err(e) = send_confirmation(st, &user.email_temporary, &email_token).await {
        warn!(user_id = %user.id, error = %e, "confirmation mail not sent");
    }
    Ok(user)
}

pub async fn signin(st: &AppState, ident: &str, password: &str) -> Result<User, ApiError> {
    let ident = ident.trim();
    if ident.is_empty() || password.is_empty() {
        return Err(ApiError::bad_request("Missing credentials."));
    }

    let invalid = || ApiError::Unauthorized("Invalid username or password.".into());
    let Some(user) = st.users.find_by_username_or_email(ident).await? else {
        warn!("signin unknown user");
        return Err(invalid());
    };
    if !verify_password(password, &user.password_hash)? {
        warn!(user_id = %user.id, "signin invalid password");
        return Err(invalid());
    }

    info!(user_id = %user.id, "user signed in");
    Ok(user)
}

/// Consumes the token. `None` means no pending confirmation matched it.
pub async fn confirm_email(
    st: &AppState,
    token: &str,
) -> Result<Option<EmailConfirmation>, ApiError> {
    let confirmation = st.users.confirm_email(token).await?;
    match &confirmation {
        Some(c) => info!(user_id = %c.user.id, made_public = c.made_public, "email confirmed"),
        None => warn!("email confirm with unknown token"),
    }
    Ok(confirmation)
}

/// Issues a fresh confirmation token for a pending address and mails it.
pub async fn resend_confirmation(st: &AppState, user_id: Uuid) -> Result<(), ApiError> {
    let user = st
        .users
        .find_by_id(user_id)
        .await?
        .ok_or_else(ApiError::forbidden)?;
    if !user.is_confirmation_pending() {
        return Err(ApiError::bad_request("Your email is already confirmed."));
    }
    let token = generate_token();
    st.users.set_email_token(user.id, &token).await?;
    send_confirmation(st, &user.email_temporary, &token).await?;
    Ok(())
}

pub(crate) async fn send_confirmation(st: &AppState, to: &str, token: &str) -> anyhow::Result<()> {
    st.mailer
        .send(Mail {
            kind: MailKind::ConfirmEmail,
            to: to.to_string(),
            link: st.config.client_url(&format!("/confirm-email/{token}")),
        })
        .await?;
    Ok(())
}

pub async fn forgot_password(st: &AppState, ident: &str) -> Result<(), ApiError> {
    let ident = ident.trim();
    if ident.is_empty() {
        return Err(ApiError::bad_request(FORGOT_MISSING_IDENT));
    }

    let user = st
        .users
        .find_by_username_or_email(ident)
        .await?
        .ok_or_else(|| ApiError::not_found(FORGOT_UNKNOWN_ACCOUNT))?;

    let (token, expires) =
        generate_reset_token(st.config.reset_token_ttl_minutes, OffsetDateTime::now_utc());
    st.users.set_reset_token(user.id, &token, expires).await?;

    st.mailer
        .send(Mail {
            kind: MailKind::ResetPassword,
            to: user.email.clone(),
            link: st.config.client_url(&format!("/api/auth/reset/{token}")),
        })
        .await?;

    info!(user_id = %user.id, "password reset issued");
    Ok(())
}

/// True when `token` names a live, unexpired reset request.
pub async fn reset_token_valid(st: &AppState, token: &str) -> Result<bool, ApiError> {
    Ok(st
        .users
        .find_by_reset_token(token, OffsetDateTime::now_utc())
        .await?
        .is_some())
}

pub async fn reset_password(
    st: &AppState,
    token: &str,
    req: ResetPasswordRequest,
) -> Result<User, ApiError> {
    check_new_password(&req.new_password, &req.verify_password).map_err(ApiError::bad_request)?;

    let hash = hash_password(&req.new_password)?;
    let user = st
        .users
        .reset_password(token, OffsetDateTime::now_utc(), &hash)
        .await?
        .ok_or_else(|| ApiError::bad_request(RESET_TOKEN_INVALID))?;

    info!(user_id = %user.id, "password reset completed");
    Ok(user)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::mailer::FailingMailer;

    #[test]
    fn username_rules() {
        assert!(is_valid_username("TR_username"));
        assert!(is_valid_username("a.b-c"));
        assert!(!is_valid_username("ab"));
        assert!(!is_valid_username("_leading"));
        assert!(!is_valid_username("trailing."));
        assert!(!is_valid_username("has space"));
        assert!(!is_valid_username(&"x".repeat(35)));
        assert!(is_valid_username(&"x".repeat(34)));
    }

    #[test]
    fn email_rules() {
        assert!(is_valid_email("test@test.com"));
        assert!(!is_valid_email("test@test"));
        assert!(!is_valid_email("not an email"));
        assert_eq!(normalize_email("  Foo@Bar.COM "), "foo@bar.com");
    }

    fn signup_req(username: &str, email: &str) -> SignupRequest {
        SignupRequest {
            first_name: "Full".into(),
            last_name: "Name".into(),
            email: email.into(),
            username: username.into(),
            password: "M3@n.jsI$Aw3$0m3".into(),
        }
    }

    #[tokio::test]
    async fn signup_lowercases_username_and_mails_token() {
        let (state, mailer) = AppState::fake_with_mailer();
        let user = signup(&state, signup_req("Register_New_User", "Reg@Test.com"))
            .await
            .unwrap();
        assert_eq!(user.username, "register_new_user");
        assert_eq!(user.display_username, "Register_New_User");
        assert_eq!(user.email, "reg@test.com");
        assert_eq!(user.display_name, "Full Name");

        let mail = mailer.last(MailKind::ConfirmEmail).unwrap();
        assert_eq!(mail.to, "reg@test.com");
        let token = user.email_token.unwrap();
        assert!(mail.link.ends_with(&format!("/confirm-email/{token}")));
    }

    #[tokio::test]
    async fn signup_survives_mail_failure() {
        let state = AppState::fake_with(Arc::new(FailingMailer));
        let user = signup(&state, signup_req("alice", "alice@test.com"))
            .await
            .unwrap();
        assert!(user.email_token.is_some());

        let stored = state.users.find_by_username("alice").await.unwrap().unwrap();
        assert_eq!(stored.id, user.id);
        assert!(signin(&state, "alice", "M3@n.jsI$Aw3$0m3").await.is_ok());

        // Resend reports mail failures.
        assert!(resend_confirmation(&state, user.id).await.is_err());
    }

    #[tokio::test]
    async fn signup_rejects_duplicates() {
        let state = AppState::fake();
        signup(&state, signup_req("first", "one@test.com")).await.unwrap();

        let err = signup(&state, signup_req("FIRST", "two@test.com")).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(m) if m == "Username already exists."));

        let err = signup(&state, signup_req("second", "ONE@test.com")).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(m) if m == "Email already exists."));
    }

    #[tokio::test]
    async fn signin_accepts_username_or_email() {
        let state = AppState::fake();
        signup(&state, signup_req("TR_username", "test@test.com")).await.unwrap();
        assert!(signin(&state, "TR_USERNAME", "M3@n.jsI$Aw3$0m3").await.is_ok());
        assert!(signin(&state, "test@test.com", "M3@n.jsI$Aw3$0m3").await.is_ok());
        assert!(matches!(
            signin(&state, "tr_username", "wrong-password").await,
            Err(ApiError::Unauthorized(_))
        ));
        assert!(matches!(
            signin(&state, "", "x").await,
            Err(ApiError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn forgot_then_reset_password() {
        let (state, mailer) = AppState::fake_with_mailer();
        signup(&state, signup_req("resetme", "reset@test.com")).await.unwrap();

        forgot_password(&state, "RESET@test.com").await.unwrap();
        let user = state.users.find_by_username("resetme").await.unwrap().unwrap();
        let token = user.reset_password_token.clone().unwrap();
        assert!(user.reset_password_expires.unwrap() > OffsetDateTime::now_utc());
        assert!(mailer.last(MailKind::ResetPassword).unwrap().link.ends_with(&token));
        assert!(reset_token_valid(&state, &token).await.unwrap());

        let req = ResetPasswordRequest {
            new_password: "brand-new-pass".into(),
            verify_password: "brand-new-pass".into(),
        };
        reset_password(&state, &token, req).await.unwrap();
        assert!(!reset_token_valid(&state, &token).await.unwrap());
        assert!(signin(&state, "resetme", "brand-new-pass").await.is_ok());
    }

    #[tokio::test]
    async fn reset_with_unknown_token_is_rejected() {
        let state = AppState::fake();
        let req = ResetPasswordRequest {
            new_password: "brand-new-pass".into(),
            verify_password: "brand-new-pass".into(),
        };
        let err = reset_password(&state, "nope", req).await.unwrap_err();
        assert_eq!(err.to_string(), RESET_TOKEN_INVALID);
    }

    #[tokio::test]
    async fn resend_confirmation_only_while_pending() {
        let (state, mailer) = AppState::fake_with_mailer();
        let user = signup(&state, signup_req("pending", "pending@test.com")).await.unwrap();
        let first = user.email_token.clone().unwrap();

        resend_confirmation(&state, user.id).await.unwrap();
        let reloaded = state.users.find_by_id(user.id).await.unwrap().unwrap();
        let second = reloaded.email_token.unwrap();
        assert_ne!(first, second);
        assert!(mailer.last(MailKind::ConfirmEmail).unwrap().link.ends_with(&second));

        confirm_email(&state, &second).await.unwrap().unwrap();
        let err = resend_confirmation(&state, user.id).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }
}
