use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
    pub cookie_name: String,
    pub cookie_secure: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub public_url: String,
    pub session: SessionConfig,
    pub reset_token_ttl_minutes: i64,
    pub avatar_max_bytes: usize,
    /// Avatar bucket; optional only for `memory:` runs.
    pub minio: Option<MinioConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MinioConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")?;
        let session = SessionConfig {
            secret: std::env::var("SESSION_SECRET")?,
            issuer: std::env::var("SESSION_ISSUER").unwrap_or_else(|_| "accounts".into()),
            audience: std::env::var("SESSION_AUDIENCE").unwrap_or_else(|_| "accounts-web".into()),
            ttl_minutes: env_parse("SESSION_TTL_MINUTES").unwrap_or(60 * 24 * 14),
            cookie_name: std::env::var("SESSION_COOKIE_NAME").unwrap_or_else(|_| "sid".into()),
            cookie_secure: env_parse("SESSION_COOKIE_SECURE").unwrap_or(false),
        };
        Ok(Self {
            database_url,
            public_url: std::env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:8080".into()),
            session,
            reset_token_ttl_minutes: env_parse("RESET_TOKEN_TTL_MINUTES").unwrap_or(60),
            avatar_max_bytes: env_parse("AVATAR_MAX_BYTES").unwrap_or(10 * 1024 * 1024),
            minio: MinioConfig::from_env()?,
        })
    }

    /// Absolute link into the web client, e.g. `/confirm-email/<token>`.
    pub fn client_url(&self, path: &str) -> String {
        format!("{}{}", self.public_url.trim_end_matches('/'), path)
    }
}

impl MinioConfig {
    /// `None` when `MINIO_ENDPOINT` is unset; the credentials are then required.
    fn from_env() -> anyhow::Result<Option<Self>> {
        let Ok(endpoint) = std::env::var("MINIO_ENDPOINT") else {
            return Ok(None);
        };
        Ok(Some(Self {
            endpoint,
            bucket: std::env::var("MINIO_BUCKET").unwrap_or_else(|_| "avatars".into()),
            access_key: std::env::var("MINIO_ACCESS_KEY").context("MINIO_ACCESS_KEY")?,
            secret_key: std::env::var("MINIO_SECRET_KEY").context("MINIO_SECRET_KEY")?,
        }))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}
