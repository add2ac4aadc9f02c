use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use super::repo_types::{EmailConfirmation, NewUser, PendingEmail, ProfileChanges, User};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    /// A uniqueness constraint rejected the write; holds the field name.
    #[error("{0} already in use")]
    Conflict(String),

    #[error(transparent)]
    Database(sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                let field = match db.constraint() {
                    Some(c) if c.contains("username") => "username",
                    Some(c) if c.contains("email") => "email",
                    _ => "record",
                };
                StoreError::Conflict(field.into())
            }
            other => StoreError::Database(other),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence for user accounts. Username and email uniqueness is enforced
/// by the store itself, and token consumption is a single atomic step.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create(&self, new_user: NewUser) -> StoreResult<User>;

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>>;

    /// `username` must already be lowercase.
    async fn find_by_username(&self, username: &str) -> StoreResult<Option<User>>;

    /// Case-insensitive match on either the username or the primary email.
    async fn find_by_username_or_email(&self, ident: &str) -> StoreResult<Option<User>>;

    /// True when `email` is the primary or pending email of an account other than `except`.
    async fn email_in_use(&self, email: &str, except: Option<Uuid>) -> StoreResult<bool>;

    async fn find_by_email_token(&self, token: &str) -> StoreResult<Option<User>>;

    /// Clears the token, promotes the pending email and makes the profile public.
    async fn confirm_email(&self, token: &str) -> StoreResult<Option<EmailConfirmation>>;

    async fn set_email_token(&self, id: Uuid, token: &str) -> StoreResult<()>;

    async fn set_reset_token(
        &self,
        id: Uuid,
        token: &str,
        expires: OffsetDateTime,
    ) -> StoreResult<()>;

    /// Only returns a user whose reset token is still valid at `now`.
    async fn find_by_reset_token(&self, token: &str, now: OffsetDateTime)
        -> StoreResult<Option<User>>;

    /// Consumes a live reset token and stores the new password hash.
    async fn reset_password(
        &self,
        token: &str,
        now: OffsetDateTime,
        password_hash: &str,
    ) -> StoreResult<Option<User>>;

    async fn update_password(&self, id: Uuid, password_hash: &str) -> StoreResult<()>;

    async fn update_profile(&self, id: Uuid, changes: ProfileChanges) -> StoreResult<User>;

    async fn set_avatar(&self, id: Uuid, uploaded: bool, source: &str) -> StoreResult<User>;
}

const USER_COLUMNS: &str = r#"
    id, username, display_username, email, email_temporary, email_token,
    first_name, last_name, display_name, provider, roles, public,
    description, tagline, gender, languages, avatar_source, avatar_uploaded,
    password_hash, reset_password_token, reset_password_expires, created, updated
"#;

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn create(&self, new_user: NewUser) -> StoreResult<User> {
        if self.email_in_use(&new_user.email, None).await? {
            return Err(StoreError::Conflict("email".into()));
        }
        let u = new_user.into_user(OffsetDateTime::now_utc());
        let sql = format!(
            r#"
            INSERT INTO users (
                id, username, display_username, email, email_temporary, email_token,
                first_name, last_name, display_name, provider, roles, public,
                description, tagline, gender, languages, avatar_source, avatar_uploaded,
                password_hash, created
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    $13, $14, $15, $16, $17, $18, $19, $20)
            RETURNING {USER_COLUMNS}
            "#
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(u.id)
            .bind(&u.username)
            .bind(&u.display_username)
            .bind(&u.email)
            .bind(&u.email_temporary)
            .bind(&u.email_token)
            .bind(&u.first_name)
            .bind(&u.last_name)
            .bind(&u.display_name)
            .bind(&u.provider)
            .bind(&u.roles)
            .bind(u.public)
            .bind(&u.description)
            .bind(&u.tagline)
            .bind(&u.gender)
            .bind(&u.languages)
            .bind(&u.avatar_source)
            .bind(u.avatar_uploaded)
            .bind(&u.password_hash)
            .bind(u.created)
            .fetch_one(&self.db)
            .await?;
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn find_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE username = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(username)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn find_by_username_or_email(&self, ident: &str) -> StoreResult<Option<User>> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = lower($1) OR email = lower($1) LIMIT 1"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(ident)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn email_in_use(&self, email: &str, except: Option<Uuid>) -> StoreResult<bool> {
        let taken: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM users
                WHERE (email = lower($1) OR email_temporary = lower($1))
                  AND ($2::uuid IS NULL OR id <> $2)
            )
            "#,
        )
        .bind(email)
        .bind(except)
        .fetch_one(&self.db)
        .await?;
        Ok(taken)
    }

    async fn find_by_email_token(&self, token: &str) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email_token = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(token)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn confirm_email(&self, token: &str) -> StoreResult<Option<EmailConfirmation>> {
        // `old` is read in the same statement so the previous visibility is known.
        let sql = format!(
            r#"
            WITH old AS (
                SELECT id, public FROM users WHERE email_token = $1 FOR UPDATE
            )
            UPDATE users u SET
                email = CASE WHEN u.email_temporary <> '' THEN u.email_temporary ELSE u.email END,
                email_temporary = '',
                email_token = NULL,
                public = TRUE,
                updated = now()
            FROM old
            WHERE u.id = old.id
            RETURNING old.public AS was_public, {}
            "#,
            prefixed_columns("u")
        );
        let row = sqlx::query_as::<_, ConfirmedRow>(&sql)
            .bind(token)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.map(|r| EmailConfirmation {
            made_public: !r.was_public,
            user: r.user,
        }))
    }

    async fn set_email_token(&self, id: Uuid, token: &str) -> StoreResult<()> {
        let res = sqlx::query("UPDATE users SET email_token = $2, updated = now() WHERE id = $1")
            .bind(id)
            .bind(token)
            .execute(&self.db)
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn set_reset_token(
        &self,
        id: Uuid,
        token: &str,
        expires: OffsetDateTime,
    ) -> StoreResult<()> {
        let res = sqlx::query(
            r#"
            UPDATE users
               SET reset_password_token = $2, reset_password_expires = $3
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(token)
        .bind(expires)
        .execute(&self.db)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn find_by_reset_token(
        &self,
        token: &str,
        now: OffsetDateTime,
    ) -> StoreResult<Option<User>> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE reset_password_token = $1 AND reset_password_expires > $2"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(token)
            .bind(now)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn reset_password(
        &self,
        token: &str,
        now: OffsetDateTime,
        password_hash: &str,
    ) -> StoreResult<Option<User>> {
        let sql = format!(
            r#"
            UPDATE users SET
                password_hash = $3,
                reset_password_token = NULL,
                reset_password_expires = NULL,
                updated = $2
            WHERE reset_password_token = $1 AND reset_password_expires > $2
            RETURNING {USER_COLUMNS}
            "#
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(token)
            .bind(now)
            .bind(password_hash)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> StoreResult<()> {
        let res = sqlx::query(
            "UPDATE users SET password_hash = $2, updated = now() WHERE id = $1",
        )
        .bind(id)
        .bind(password_hash)
        .execute(&self.db)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn update_profile(&self, id: Uuid, changes: ProfileChanges) -> StoreResult<User> {
        let (pending_email, email_token, clear_pending) = match changes.pending_email {
            Some(PendingEmail::Set { email, token }) => (Some(email), Some(token), false),
            Some(PendingEmail::Clear) => (None, None, true),
            None => (None, None, false),
        };
        let sql = format!(
            r#"
            UPDATE users SET
                first_name      = COALESCE($2, first_name),
                last_name       = COALESCE($3, last_name),
                display_name    = COALESCE($4, display_name),
                description     = COALESCE($5, description),
                tagline         = COALESCE($6, tagline),
                gender          = COALESCE($7, gender),
                languages       = COALESCE($8, languages),
                avatar_source   = COALESCE($9, avatar_source),
                email_temporary = CASE WHEN $12 THEN '' ELSE COALESCE($10, email_temporary) END,
                email_token     = CASE WHEN $12 THEN NULL ELSE COALESCE($11, email_token) END,
                updated         = now()
            WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .bind(changes.first_name)
            .bind(changes.last_name)
            .bind(changes.display_name)
            .bind(changes.description)
            .bind(changes.tagline)
            .bind(changes.gender)
            .bind(changes.languages)
            .bind(changes.avatar_source)
            .bind(pending_email)
            .bind(email_token)
            .bind(clear_pending)
            .fetch_one(&self.db)
            .await?;
        Ok(user)
    }

    async fn set_avatar(&self, id: Uuid, uploaded: bool, source: &str) -> StoreResult<User> {
        let sql = format!(
            r#"
            UPDATE users SET avatar_uploaded = $2, avatar_source = $3, updated = now()
            WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .bind(uploaded)
            .bind(source)
            .fetch_one(&self.db)
            .await?;
        Ok(user)
    }
}

#[derive(sqlx::FromRow)]
struct ConfirmedRow {
    was_public: bool,
    #[sqlx(flatten)]
    user: User,
}

fn prefixed_columns(alias: &str) -> String {
    USER_COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
