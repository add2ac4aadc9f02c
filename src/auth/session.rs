//! Server-side sessions and the cookie that carries them.
//!
//! The cookie holds a signed JWT naming a session row; sign-out deletes the
//! row, so a copied cookie stops working even before its `exp`.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue};
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::jwt::JwtKeys;
use crate::{config::SessionConfig, state::AppState};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<()>;

    /// Returns the owning user while the session exists and has not expired.
    async fn active_user(&self, session_id: Uuid) -> anyhow::Result<Option<Uuid>>;

    async fn revoke(&self, session_id: Uuid) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct PgSessionStore {
    db: PgPool,
}

impl PgSessionStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<()> {
        let purged = sqlx::query("DELETE FROM sessions WHERE expires_at <= now()")
            .execute(&self.db)
            .await?
            .rows_affected();
        if purged > 0 {
            tracing::debug!(purged, "expired sessions removed");
        }
        sqlx::query("INSERT INTO sessions (id, user_id, expires_at) VALUES ($1, $2, $3)")
            .bind(session_id)
            .bind(user_id)
            .bind(expires_at)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn active_user(&self, session_id: Uuid) -> anyhow::Result<Option<Uuid>> {
        let user_id = sqlx::query_scalar::<_, Uuid>(
            "SELECT user_id FROM sessions WHERE id = $1 AND expires_at > now()",
        )
        .bind(session_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(user_id)
    }

    async fn revoke(&self, session_id: Uuid) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(session_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<Uuid, (Uuid, OffsetDateTime)>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<()> {
        let now = OffsetDateTime::now_utc();
        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, (_, exp)| *exp > now);
        sessions.insert(session_id, (user_id, expires_at));
        Ok(())
    }

    async fn active_user(&self, session_id: Uuid) -> anyhow::Result<Option<Uuid>> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .sessions
            .read()
            .await
            .get(&session_id)
            .filter(|(_, exp)| *exp > now)
            .map(|(user, _)| *user))
    }

    async fn revoke(&self, session_id: Uuid) -> anyhow::Result<()> {
        self.sessions.write().await.remove(&session_id);
        Ok(())
    }
}

/// Opens a session for `user_id` and returns the `Set-Cookie` value.
pub async fn start_session(state: &AppState, user_id: Uuid) -> anyhow::Result<HeaderValue> {
    let keys = JwtKeys::from_config(&state.config.session);
    let session_id = Uuid::new_v4();
    let (token, expires_at) = keys.sign_session(user_id, session_id)?;
    state.sessions.create(session_id, user_id, expires_at).await?;
    tracing::debug!(%user_id, %session_id, "session started");
    Ok(session_cookie(&state.config.session, &token)?)
}

pub fn session_cookie(
    cfg: &SessionConfig,
    token: &str,
) -> Result<HeaderValue, header::InvalidHeaderValue> {
    let max_age = cfg.ttl_minutes.max(1) * 60;
    let mut cookie = format!(
        "{}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}",
        cfg.cookie_name
    );
    if cfg.cookie_secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub fn clear_session_cookie(cfg: &SessionConfig) -> HeaderValue {
    let mut cookie = format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", cfg.cookie_name);
    if cfg.cookie_secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie).unwrap_or_else(|_| HeaderValue::from_static("sid=; Max-Age=0"))
}

/// Session token from the `Authorization: Bearer` header or the session cookie.
pub fn extract_session_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")));
    if let Some(token) = bearer {
        return Some(token.trim().to_string());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| k.trim() == cookie_name)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn cfg() -> SessionConfig {
        SessionConfig {
            secret: "s".into(),
            issuer: "i".into(),
            audience: "a".into(),
            ttl_minutes: 10,
            cookie_name: "sid".into(),
            cookie_secure: true,
        }
    }

    #[test]
    fn cookie_flags() {
        let cookie = session_cookie(&cfg(), "tok").unwrap();
        let s = cookie.to_str().unwrap();
        assert!(s.starts_with("sid=tok;"));
        assert!(s.contains("HttpOnly"));
        assert!(s.contains("Max-Age=600"));
        assert!(s.ends_with("; Secure"));

        let cleared = clear_session_cookie(&cfg());
        assert!(cleared.to_str().unwrap().contains("Max-Age=0"));
    }

    #[test]
    fn token_from_cookie_or_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; sid=abc.def"));
        assert_eq!(extract_session_token(&headers, "sid").as_deref(), Some("abc.def"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer xyz"));
        assert_eq!(extract_session_token(&headers, "sid").as_deref(), Some("xyz"));

        assert!(extract_session_token(&HeaderMap::new(), "sid").is_none());
    }

    #[test]
    fn empty_cookie_value_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("sid="));
        assert!(extract_session_token(&headers, "sid").is_none());
    }

    #[tokio::test]
    async fn memory_sessions_expire_and_revoke() {
        let store = MemorySessionStore::new();
        let (live, dead, user) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let now = OffsetDateTime::now_utc();
        store.create(live, user, now + Duration::hours(1)).await.unwrap();
        store.create(dead, user, now - Duration::seconds(1)).await.unwrap();

        assert_eq!(store.active_user(live).await.unwrap(), Some(user));
        assert_eq!(store.active_user(dead).await.unwrap(), None);

        store.revoke(live).await.unwrap();
        assert_eq!(store.active_user(live).await.unwrap(), None);
    }

    #[tokio::test]
    async fn creating_a_session_drops_expired_ones() {
        let store = MemorySessionStore::new();
        let user = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        for _ in 0..3 {
            store
                .create(Uuid::new_v4(), user, now - Duration::minutes(1))
                .await
                .unwrap();
        }
        let live = Uuid::new_v4();
        store.create(live, user, now + Duration::hours(1)).await.unwrap();

        let sessions = store.sessions.read().await;
        assert_eq!(sessions.len(), 1);
        assert!(sessions.contains_key(&live));
    }
}
