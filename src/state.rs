use std::sync::Arc;

use anyhow::Context;

use crate::auth::session::{MemorySessionStore, PgSessionStore, SessionStore};
use crate::config::AppConfig;
use crate::mailer::{LogMailer, Mailer};
use crate::storage::{MemoryStorage, Storage, StorageClient};
use crate::users::memory::MemoryUserStore;
use crate::users::repo::{PgUserStore, UserStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub users: Arc<dyn UserStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub storage: Arc<dyn StorageClient>,
    pub mailer: Arc<dyn Mailer>,
}

fn uses_memory_stores(config: &AppConfig) -> bool {
    config.database_url.starts_with("memory:")
}

/// S3/MinIO when configured. Without it only `memory:` runs may start, and
/// avatars then live in process memory.
async fn storage_for(config: &AppConfig) -> anyhow::Result<Arc<dyn StorageClient>> {
    match &config.minio {
        Some(minio) => Ok(Arc::new(Storage::from_config(minio).await?)),
        None if uses_memory_stores(config) => {
            tracing::warn!("MINIO_ENDPOINT unset; avatars kept in memory");
            Ok(Arc::new(MemoryStorage::new()))
        }
        None => anyhow::bail!("MINIO_ENDPOINT is required unless DATABASE_URL is memory:"),
    }
}

impl AppState {
    /// Production wiring: Postgres stores, S3/MinIO avatars, logging mailer.
    /// `DATABASE_URL=memory:` swaps the stores for in-process ones for local
    /// runs. The pool is returned so the caller can run migrations.
    pub async fn init() -> anyhow::Result<(Self, Option<sqlx::PgPool>)> {
        let config = Arc::new(AppConfig::from_env()?);
        let storage = storage_for(&config).await?;

        if uses_memory_stores(&config) {
            tracing::warn!("using in-memory user and session stores; data is lost on exit");
            let state = Self {
                users: Arc::new(MemoryUserStore::new()),
                sessions: Arc::new(MemorySessionStore::new()),
                config,
                storage,
                mailer: Arc::new(LogMailer),
            };
            return Ok((state, None));
        }

        let db = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await
            .context("connect to database")?;

        let state = Self {
            users: Arc::new(PgUserStore::new(db.clone())),
            sessions: Arc::new(PgSessionStore::new(db.clone())),
            config,
            storage,
            mailer: Arc::new(LogMailer),
        };
        Ok((state, Some(db)))
    }

    #[cfg(test)]
    pub fn fake() -> Self {
        Self::fake_with_mailer().0
    }

    /// In-memory everything; the returned mailer sees every message sent.
    #[cfg(test)]
    pub fn fake_with_mailer() -> (Self, Arc<crate::mailer::RecordingMailer>) {
        let mailer = Arc::new(crate::mailer::RecordingMailer::default());
        (Self::fake_with(mailer.clone()), mailer)
    }

    #[cfg(test)]
    pub fn fake_with(mailer: Arc<dyn Mailer>) -> Self {
        Self {
            config: Arc::new(test_config()),
            users: Arc::new(MemoryUserStore::new()),
            sessions: Arc::new(MemorySessionStore::new()),
            storage: Arc::new(MemoryStorage::new()),
            mailer,
        }
    }
}

#[cfg(test)]
fn test_config() -> AppConfig {
    use crate::config::SessionConfig;

    AppConfig {
        database_url: "memory:".into(),
        public_url: "http://localhost:3000".into(),
        session: SessionConfig {
            secret: "test-secret".into(),
            issuer: "test-issuer".into(),
            audience: "test-aud".into(),
            ttl_minutes: 5,
            cookie_name: "sid".into(),
            cookie_secure: false,
        },
        reset_token_ttl_minutes: 60,
        avatar_max_bytes: 64 * 1024,
        minio: None,
    }
}
