use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::repo::{StoreError, StoreResult, UserStore};
use super::repo_types::{EmailConfirmation, NewUser, PendingEmail, ProfileChanges, User};

/// In-process store for tests and local runs. Every mutation holds the
/// write lock for its whole check-and-set, so uniqueness checks and token
/// consumption cannot interleave.
#[derive(Default)]
pub struct MemoryUserStore {
    users: RwLock<HashMap<Uuid, User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn modify<F>(&self, id: Uuid, f: F) -> StoreResult<User>
    where
        F: FnOnce(&mut User) + Send,
    {
        let mut users = self.users.write().await;
        let user = users.get_mut(&id).ok_or(StoreError::NotFound)?;
        f(user);
        Ok(user.clone())
    }
}

fn email_taken(users: &HashMap<Uuid, User>, email: &str, except: Option<Uuid>) -> bool {
    let email = email.to_lowercase();
    users.values().any(|u| {
        Some(u.id) != except && (u.email == email || u.email_temporary == email)
    })
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn create(&self, new_user: NewUser) -> StoreResult<User> {
        let mut users = self.users.write().await;
        if users.values().any(|u| u.username == new_user.username) {
            return Err(StoreError::Conflict("username".into()));
        }
        if email_taken(&users, &new_user.email, None) {
            return Err(StoreError::Conflict("email".into()));
        }
        let user = new_user.into_user(OffsetDateTime::now_utc());
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn find_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        let users = self.users.read().await;
        Ok(users.values().find(|u| u.username == username).cloned())
    }

    async fn find_by_username_or_email(&self, ident: &str) -> StoreResult<Option<User>> {
        let ident = ident.to_lowercase();
        let users = self.users.read().await;
        Ok(users
            .values()
            .find(|u| u.username == ident || u.email == ident)
            .cloned())
    }

    async fn email_in_use(&self, email: &str, except: Option<Uuid>) -> StoreResult<bool> {
        Ok(email_taken(&*self.users.read().await, email, except))
    }

    async fn find_by_email_token(&self, token: &str) -> StoreResult<Option<User>> {
        let users = self.users.read().await;
        Ok(users
            .values()
            .find(|u| u.email_token.as_deref() == Some(token))
            .cloned())
    }

    async fn confirm_email(&self, token: &str) -> StoreResult<Option<EmailConfirmation>> {
        let mut users = self.users.write().await;
        let Some(user) = users
            .values_mut()
            .find(|u| u.email_token.as_deref() == Some(token))
        else {
            return Ok(None);
        };
        let made_public = !user.public;
        if !user.email_temporary.is_empty() {
            user.email = std::mem::take(&mut user.email_temporary);
        }
        user.email_token = None;
        user.public = true;
        user.updated = Some(OffsetDateTime::now_utc());
        Ok(Some(EmailConfirmation {
            user: user.clone(),
            made_public,
        }))
    }

    async fn set_email_token(&self, id: Uuid, token: &str) -> StoreResult<()> {
        let token = token.to_string();
        self.modify(id, move |u| {
            u.email_token = Some(token);
            u.updated = Some(OffsetDateTime::now_utc());
        })
        .await
        .map(|_| ())
    }

    async fn set_reset_token(
        &self,
        id: Uuid,
        token: &str,
        expires: OffsetDateTime,
    ) -> StoreResult<()> {
        let token = token.to_string();
        self.modify(id, move |u| {
            u.reset_password_token = Some(token);
            u.reset_password_expires = Some(expires);
        })
        .await
        .map(|_| ())
    }

    async fn find_by_reset_token(
        &self,
        token: &str,
        now: OffsetDateTime,
    ) -> StoreResult<Option<User>> {
        let users = self.users.read().await;
        Ok(users
            .values()
            .find(|u| reset_token_live(u, token, now))
            .cloned())
    }

    async fn reset_password(
        &self,
        token: &str,
        now: OffsetDateTime,
        password_hash: &str,
    ) -> StoreResult<Option<User>> {
        let mut users = self.users.write().await;
        let Some(user) = users.values_mut().find(|u| reset_token_live(u, token, now)) else {
            return Ok(None);
        };
        user.password_hash = password_hash.to_string();
        user.reset_password_token = None;
        user.reset_password_expires = None;
        user.updated = Some(now);
        Ok(Some(user.clone()))
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> StoreResult<()> {
        let hash = password_hash.to_string();
        self.modify(id, move |u| {
            u.password_hash = hash;
            u.updated = Some(OffsetDateTime::now_utc());
        })
        .await
        .map(|_| ())
    }

    async fn update_profile(&self, id: Uuid, changes: ProfileChanges) -> StoreResult<User> {
        let mut users = self.users.write().await;
        if let Some(PendingEmail::Set { email, .. }) = &changes.pending_email {
            if email_taken(&users, email, Some(id)) {
                return Err(StoreError::Conflict("email".into()));
            }
        }
        let user = users.get_mut(&id).ok_or(StoreError::NotFound)?;
        changes.apply(user, OffsetDateTime::now_utc());
        Ok(user.clone())
    }

    async fn set_avatar(&self, id: Uuid, uploaded: bool, source: &str) -> StoreResult<User> {
        let source = source.to_string();
        self.modify(id, move |u| {
            u.avatar_uploaded = uploaded;
            u.avatar_source = source;
            u.updated = Some(OffsetDateTime::now_utc());
        })
        .await
    }
}

fn reset_token_live(user: &User, token: &str, now: OffsetDateTime) -> bool {
    user.reset_password_token.as_deref() == Some(token)
        && user.reset_password_expires.is_some_and(|exp| exp > now)
}
