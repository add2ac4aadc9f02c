use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

use super::repo_types::User;

/// Sanitized user record sent to clients. Password hash and tokens have no
/// field here, so they cannot be serialized by accident.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub username: String,
    pub display_username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_temporary: Option<String>,
    pub email_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub display_name: String,
    pub provider: String,
    pub roles: Vec<String>,
    pub public: bool,
    pub description: String,
    pub tagline: String,
    pub gender: String,
    pub languages: Vec<String>,
    pub avatar_source: String,
    pub avatar_uploaded: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub updated: Option<OffsetDateTime>,
}

impl UserProfile {
    /// The account owner's view, including email addresses.
    pub fn own(user: &User) -> Self {
        let mut profile = Self::public(user);
        profile.email = Some(user.email.clone());
        profile.email_temporary = Some(user.email_temporary.clone());
        profile
    }

    /// What other signed-in users may see.
    pub fn public(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            display_username: user.display_username.clone(),
            email: None,
            email_temporary: None,
            email_hash: email_hash(&user.email),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            display_name: user.display_name.clone(),
            provider: user.provider.clone(),
            roles: user.roles.clone(),
            public: user.public,
            description: user.description.clone(),
            tagline: user.tagline.clone(),
            gender: user.gender.clone(),
            languages: user.languages.clone(),
            avatar_source: user.avatar_source.clone(),
            avatar_uploaded: user.avatar_uploaded,
            created: user.created,
            updated: user.updated,
        }
    }
}

/// Hex SHA-256 of the normalized address, as accepted by Gravatar.
pub fn email_hash(email: &str) -> String {
    let digest = Sha256::digest(email.trim().to_lowercase().as_bytes());
    hex::encode(digest)
}

/// Body of `PUT /api/users`. Only these keys are read; anything else the
/// client sends (`roles`, `public`, `username`, ...) is dropped by serde.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub description: Option<String>,
    pub tagline: Option<String>,
    pub gender: Option<String>,
    pub languages: Option<Vec<String>>,
    pub avatar_source: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    #[serde(default)]
    pub current_password: String,
    #[serde(default)]
    pub new_password: String,
    #[serde(default)]
    pub verify_password: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::repo_types::NewUser;

    fn sample_user() -> User {
        NewUser {
            username: "tr_username".into(),
            display_username: "TR_username".into(),
            email: "test@test.com".into(),
            first_name: "Full".into(),
            last_name: "Name".into(),
            password_hash: "$argon2id$secret".into(),
            email_token: "confirm-me".into(),
        }
        .into_user(OffsetDateTime::now_utc())
    }

    #[test]
    fn own_profile_never_carries_secrets() {
        let json = serde_json::to_value(UserProfile::own(&sample_user())).unwrap();
        let obj = json.as_object().unwrap();
        for key in ["password", "passwordHash", "salt", "emailToken", "resetPasswordToken"] {
            assert!(!obj.contains_key(key), "{key} leaked");
        }
        assert!(!json.to_string().contains("confirm-me"));
        assert!(!json.to_string().contains("argon2"));
        assert_eq!(json["emailTemporary"], "test@test.com");
        assert_eq!(json["avatarSource"], "gravatar");
        assert!(obj.contains_key("_id"));
        assert!(!obj.contains_key("updated"));
    }

    #[test]
    fn public_profile_hides_addresses() {
        let json = serde_json::to_value(UserProfile::public(&sample_user())).unwrap();
        assert!(json.get("email").is_none());
        assert!(json.get("emailTemporary").is_none());
        assert_eq!(json["emailHash"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn email_hash_normalizes_input() {
        assert_eq!(email_hash(" Test@Test.com "), email_hash("test@test.com"));
    }

    #[test]
    fn profile_update_ignores_roles() {
        let update: ProfileUpdate = serde_json::from_str(
            r#"{"firstName":"a","lastName":"b","roles":["user","admin"],"public":true}"#,
        )
        .unwrap();
        assert_eq!(update.first_name.as_deref(), Some("a"));
        assert_eq!(update.last_name.as_deref(), Some("b"));
    }
}
