use tracing::{info, warn};
use uuid::Uuid;

use super::{
    dto::{ChangePasswordRequest, ProfileUpdate},
    repo::StoreError,
    repo_types::{PendingEmail, ProfileChanges, User, AVATAR_GRAVATAR, AVATAR_LOCAL},
};
use crate::{
    auth::{
        password::{check_new_password, hash_password, verify_password},
        services::{is_valid_email, normalize_email, send_confirmation},
        tokens::generate_token,
    },
    error::ApiError,
    state::AppState,
};

pub const EMAIL_IN_USE: &str = "This email is already in use. Please use another one.";
const TAGLINE_MAX_CHARS: usize = 60;
const AVATAR_SOURCES: [&str; 3] = ["none", AVATAR_GRAVATAR, AVATAR_LOCAL];

async fn load(st: &AppState, user_id: Uuid) -> Result<User, ApiError> {
    // A live session for a deleted account is treated as no session.
    st.users
        .find_by_id(user_id)
        .await?
        .ok_or_else(ApiError::forbidden)
}

/// Own account, any other public account, otherwise not found.
pub async fn read_profile(
    st: &AppState,
    viewer: Uuid,
    username: &str,
) -> Result<(User, bool), ApiError> {
    let user = st
        .users
        .find_by_username(&username.trim().to_lowercase())
        .await?
        .ok_or_else(|| ApiError::not_found("User not found."))?;
    let own = user.id == viewer;
    if !own && !user.public {
        return Err(ApiError::not_found("User not found."));
    }
    Ok((user, own))
}

fn non_empty(field: Option<String>, message: &str) -> Result<Option<String>, ApiError> {
    match field.map(|v| v.trim().to_string()) {
        Some(v) if v.is_empty() => Err(ApiError::bad_request(message)),
        other => Ok(other),
    }
}

pub async fn update_profile(
    st: &AppState,
    user_id: Uuid,
    update: ProfileUpdate,
) -> Result<User, ApiError> {
    let current = load(st, user_id).await?;

    let first_name = non_empty(update.first_name, "Please fill in your first name.")?;
    let last_name = non_empty(update.last_name, "Please fill in your last name.")?;
    let display_name = (first_name.is_some() || last_name.is_some()).then(|| {
        format!(
            "{} {}",
            first_name.as_deref().unwrap_or(&current.first_name),
            last_name.as_deref().unwrap_or(&current.last_name)
        )
    });

    let tagline = update.tagline.map(|t| t.trim().to_string());
    if tagline
        .as_ref()
        .is_some_and(|t| t.chars().count() > TAGLINE_MAX_CHARS)
    {
        return Err(ApiError::bad_request("Tagline is too long."));
    }

    if let Some(source) = &update.avatar_source {
        if !AVATAR_SOURCES.contains(&source.as_str()) {
            return Err(ApiError::bad_request("Unknown avatar source."));
        }
    }

    let languages = update.languages.map(|langs| {
        let mut langs: Vec<String> = langs
            .into_iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        langs.dedup();
        langs
    });

    let mut pending_email = None;
    if let Some(email) = update.email.map(|e| normalize_email(&e)) {
        if email == current.email {
            // Back to the confirmed address cancels a pending change.
            if current.is_confirmation_pending() && current.email_temporary != current.email {
                pending_email = Some(PendingEmail::Clear);
            }
        } else if email != current.email_temporary {
            if !is_valid_email(&email) {
                return Err(ApiError::bad_request("Invalid email."));
            }
            if st.users.email_in_use(&email, Some(user_id)).await? {
                warn!(%user_id, "profile update with email of another account");
                return Err(ApiError::Forbidden(EMAIL_IN_USE.into()));
            }
            pending_email = Some(PendingEmail::Set {
                email,
                token: generate_token(),
            });
        }
    }

    let changes = ProfileChanges {
        first_name,
        last_name,
        display_name,
        description: update.description.map(|d| d.trim().to_string()),
        tagline,
        gender: update.gender.map(|g| g.trim().to_lowercase()),
        languages,
        avatar_source: update.avatar_source,
        pending_email: pending_email.clone(),
    };

    let user = match st.users.update_profile(user_id, changes).await {
        Ok(user) => user,
        Err(StoreError::Conflict(_)) => return Err(ApiError::Forbidden(EMAIL_IN_USE.into())),
        Err(e) => return Err(e.into()),
    };

    match pending_email {
        Some(PendingEmail::Set { email, token }) => {
            info!(%user_id, "email change pending confirmation");
            if let Err(e) = send_confirmation(st, &email, &token).await {
                warn!(%user_id, error = %e, "confirmation mail not sent");
            }
        }
        Some(PendingEmail::Clear) => info!(%user_id, "pending email change cancelled"),
        None => {}
    }
    info!(%user_id, "profile updated");
    Ok(user)
}

pub async fn change_password(
    st: &AppState,
    user_id: Uuid,
    req: ChangePasswordRequest,
) -> Result<(), ApiError> {
    check_new_password(&req.new_password, &req.verify_password).map_err(ApiError::bad_request)?;

    let user = load(st, user_id).await?;
    if !verify_password(&req.current_password, &user.password_hash)? {
        warn!(%user_id, "change password with wrong current password");
        return Err(ApiError::bad_request("Current password is incorrect."));
    }

    let hash = hash_password(&req.new_password)?;
    st.users.update_password(user_id, &hash).await?;
    info!(%user_id, "password changed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::auth::{dto::SignupRequest, services::signup};
    use crate::mailer::FailingMailer;

    async fn seeded(st: &AppState, username: &str, email: &str) -> User {
        signup(
            st,
            SignupRequest {
                first_name: "Full".into(),
                last_name: "Name".into(),
                email: email.into(),
                username: username.into(),
                password: "M3@n.jsI$Aw3$0m3".into(),
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn update_recomputes_display_name_and_keeps_roles() {
        let st = AppState::fake();
        let user = seeded(&st, "TR_username", "test@test.com").await;
        let update: ProfileUpdate = serde_json::from_str(
            r#"{"firstName":"user_update_first","lastName":"user_update_last","roles":["user","admin"]}"#,
        )
        .unwrap();

        let updated = update_profile(&st, user.id, update).await.unwrap();
        assert_eq!(updated.display_name, "user_update_first user_update_last");
        assert_eq!(updated.roles, user.roles);
        assert!(updated.updated.is_some());
    }

    #[tokio::test]
    async fn email_change_goes_to_pending_until_confirmed() {
        let st = AppState::fake();
        let user = seeded(&st, "mover", "old@test.com").await;
        crate::auth::services::confirm_email(&st, user.email_token.as_deref().unwrap())
            .await
            .unwrap();

        let update = ProfileUpdate {
            email: Some("New@Test.com".into()),
            ..Default::default()
        };
        let updated = update_profile(&st, user.id, update).await.unwrap();
        assert_eq!(updated.email, "old@test.com");
        assert_eq!(updated.email_temporary, "new@test.com");

        let token = updated.email_token.unwrap();
        let confirmed = crate::auth::services::confirm_email(&st, &token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(confirmed.user.email, "new@test.com");
        assert!(!confirmed.made_public);
    }

    #[tokio::test]
    async fn returning_to_confirmed_email_cancels_pending_change() {
        let st = AppState::fake();
        let user = seeded(&st, "undo", "x@test.com").await;
        crate::auth::services::confirm_email(&st, user.email_token.as_deref().unwrap())
            .await
            .unwrap();

        let to_y = ProfileUpdate {
            email: Some("y@test.com".into()),
            ..Default::default()
        };
        let pending = update_profile(&st, user.id, to_y).await.unwrap();
        let stale_token = pending.email_token.unwrap();

        let back_to_x = ProfileUpdate {
            email: Some("X@test.com".into()),
            ..Default::default()
        };
        let updated = update_profile(&st, user.id, back_to_x).await.unwrap();
        assert_eq!(updated.email, "x@test.com");
        assert_eq!(updated.email_temporary, "");
        assert!(updated.email_token.is_none());

        let confirmed = crate::auth::services::confirm_email(&st, &stale_token)
            .await
            .unwrap();
        assert!(confirmed.is_none());
        let stored = st.users.find_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(stored.email, "x@test.com");
    }

    #[tokio::test]
    async fn unconfirmed_signup_address_is_kept_when_resubmitted() {
        let st = AppState::fake();
        let user = seeded(&st, "fresh", "fresh@test.com").await;
        let update = ProfileUpdate {
            email: Some("fresh@test.com".into()),
            ..Default::default()
        };
        let updated = update_profile(&st, user.id, update).await.unwrap();
        assert_eq!(updated.email_temporary, "fresh@test.com");
        assert_eq!(updated.email_token, user.email_token);
    }

    #[tokio::test]
    async fn email_change_survives_mail_failure() {
        let st = AppState::fake_with(Arc::new(FailingMailer));
        let user = seeded(&st, "offline", "offline@test.com").await;

        let update = ProfileUpdate {
            email: Some("moved@test.com".into()),
            ..Default::default()
        };
        let updated = update_profile(&st, user.id, update).await.unwrap();
        assert_eq!(updated.email_temporary, "moved@test.com");
        assert!(updated.email_token.is_some());
    }

    #[tokio::test]
    async fn email_of_other_account_is_forbidden() {
        let st = AppState::fake();
        seeded(&st, "owner", "taken@test.com").await;
        let other = seeded(&st, "other", "other@test.com").await;

        let update = ProfileUpdate {
            email: Some("taken@test.com".into()),
            ..Default::default()
        };
        let err = update_profile(&st, other.id, update).await.unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(m) if m == EMAIL_IN_USE));
    }

    #[tokio::test]
    async fn invalid_fields_are_rejected() {
        let st = AppState::fake();
        let user = seeded(&st, "picky", "picky@test.com").await;

        let long_tagline = ProfileUpdate {
            tagline: Some("x".repeat(61)),
            ..Default::default()
        };
        assert!(update_profile(&st, user.id, long_tagline).await.is_err());

        let bad_source = ProfileUpdate {
            avatar_source: Some("myspace".into()),
            ..Default::default()
        };
        assert!(update_profile(&st, user.id, bad_source).await.is_err());

        let blank_name = ProfileUpdate {
            first_name: Some("   ".into()),
            ..Default::default()
        };
        assert!(update_profile(&st, user.id, blank_name).await.is_err());
    }

    #[tokio::test]
    async fn non_public_profiles_are_visible_only_to_owner() {
        let st = AppState::fake();
        let owner = seeded(&st, "hidden", "hidden@test.com").await;
        let viewer = seeded(&st, "viewer", "viewer@test.com").await;

        let (_, own) = read_profile(&st, owner.id, "HIDDEN").await.unwrap();
        assert!(own);
        assert!(matches!(
            read_profile(&st, viewer.id, "hidden").await,
            Err(ApiError::NotFound(_))
        ));

        crate::auth::services::confirm_email(&st, owner.email_token.as_deref().unwrap())
            .await
            .unwrap();
        let (user, own) = read_profile(&st, viewer.id, "hidden").await.unwrap();
        assert!(!own);
        assert!(user.public);
    }

    #[tokio::test]
    async fn change_password_checks_current() {
        let st = AppState::fake();
        let user = seeded(&st, "changer", "changer@test.com").await;

        let wrong = ChangePasswordRequest {
            current_password: "nope-nope".into(),
            new_password: "1234567890Aa$".into(),
            verify_password: "1234567890Aa$".into(),
        };
        let err = change_password(&st, user.id, wrong).await.unwrap_err();
        assert_eq!(err.to_string(), "Current password is incorrect.");

        let ok = ChangePasswordRequest {
            current_password: "M3@n.jsI$Aw3$0m3".into(),
            new_password: "1234567890Aa$".into(),
            verify_password: "1234567890Aa$".into(),
        };
        change_password(&st, user.id, ok).await.unwrap();
        assert!(crate::auth::services::signin(&st, "changer", "1234567890Aa$")
            .await
            .is_ok());
    }
}
