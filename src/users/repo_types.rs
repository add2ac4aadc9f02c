use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

pub const ROLE_USER: &str = "user";
pub const PROVIDER_LOCAL: &str = "local";
pub const AVATAR_GRAVATAR: &str = "gravatar";
pub const AVATAR_LOCAL: &str = "local";

/// User record in the database. Never serialized to clients directly;
/// see `users::dto::UserProfile`.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,         // lowercase, unique lookup key
    pub display_username: String, // as typed at sign-up
    pub email: String,
    pub email_temporary: String, // pending address, empty when none
    pub email_token: Option<String>,
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
    pub password_hash: String, // Argon2 PHC string, salt included
    pub reset_password_token: Option<String>,
    pub reset_password_expires: Option<OffsetDateTime>,
    pub created: OffsetDateTime,
    pub updated: Option<OffsetDateTime>,
}

impl User {
    pub fn is_confirmation_pending(&self) -> bool {
        !self.email_temporary.is_empty()
    }
}

/// Everything needed to insert a fresh account.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub display_username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password_hash: String,
    pub email_token: String,
}

impl NewUser {
    pub fn into_user(self, now: OffsetDateTime) -> User {
        let display_name = format!("{} {}", self.first_name, self.last_name);
        User {
            id: Uuid::new_v4(),
            username: self.username,
            display_username: self.display_username,
            email_temporary: self.email.clone(),
            email: self.email,
            email_token: Some(self.email_token),
            first_name: self.first_name,
            last_name: self.last_name,
            display_name,
            provider: PROVIDER_LOCAL.into(),
            roles: vec![ROLE_USER.into()],
            public: false,
            description: String::new(),
            tagline: String::new(),
            gender: String::new(),
            languages: Vec::new(),
            avatar_source: AVATAR_GRAVATAR.into(),
            avatar_uploaded: false,
            password_hash: self.password_hash,
            reset_password_token: None,
            reset_password_expires: None,
            created: now,
            updated: None,
        }
    }
}

/// Server-validated profile changes. `None` leaves a field untouched.
/// Roles and visibility are not representable here.
#[derive(Debug, Clone, Default)]
pub struct ProfileChanges {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub tagline: Option<String>,
    pub gender: Option<String>,
    pub languages: Option<Vec<String>>,
    pub avatar_source: Option<String>,
    pub pending_email: Option<PendingEmail>,
}

/// Change to the address awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingEmail {
    Set { email: String, token: String },
    /// Drops the pending address and its token.
    Clear,
}

impl ProfileChanges {
    pub fn apply(self, user: &mut User, now: OffsetDateTime) {
        if let Some(v) = self.first_name {
            user.first_name = v;
        }
        if let Some(v) = self.last_name {
            user.last_name = v;
        }
        if let Some(v) = self.display_name {
            user.display_name = v;
        }
        if let Some(v) = self.description {
            user.description = v;
        }
        if let Some(v) = self.tagline {
            user.tagline = v;
        }
        if let Some(v) = self.gender {
            user.gender = v;
        }
        if let Some(v) = self.languages {
            user.languages = v;
        }
        if let Some(v) = self.avatar_source {
            user.avatar_source = v;
        }
        match self.pending_email {
            Some(PendingEmail::Set { email, token }) => {
                user.email_temporary = email;
                user.email_token = Some(token);
            }
            Some(PendingEmail::Clear) => {
                user.email_temporary.clear();
                user.email_token = None;
            }
            None => {}
        }
        user.updated = Some(now);
    }
}

/// Result of consuming an email confirmation token.
#[derive(Debug, Clone)]
pub struct EmailConfirmation {
    pub user: User,
    pub made_public: bool,
}
