use anyhow::Context;
use bytes::Bytes;
use uuid::Uuid;

use crate::state::AppState;
use crate::storage::avatar_key;
use crate::users::repo_types::{User, AVATAR_GRAVATAR, AVATAR_LOCAL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
}

impl ImageFormat {
    /// Sniffs the format from the file's leading bytes.
    pub fn detect(body: &[u8]) -> Option<Self> {
        match body {
            [0xFF, 0xD8, 0xFF, ..] => Some(Self::Jpeg),
            [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => Some(Self::Png),
            [b'G', b'I', b'F', b'8', b'7' | b'9', b'a', ..] => Some(Self::Gif),
            _ => None,
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
        }
    }
}

/// Stores the image and flips the user to their uploaded avatar. The object
/// is removed again if the user record cannot be updated.
pub async fn upload_avatar(
    st: &AppState,
    user_id: Uuid,
    body: Bytes,
    format: ImageFormat,
) -> anyhow::Result<User> {
    let key = avatar_key(user_id);
    st.storage
        .put_object(&key, body, format.mime())
        .await
        .with_context(|| format!("put_object {}", key))?;

    match st.users.set_avatar(user_id, true, AVATAR_LOCAL).await {
        Ok(user) => Ok(user),
        Err(e) => {
            if let Err(cleanup) = st.storage.delete_object(&key).await {
                tracing::warn!(error = %cleanup, %key, "orphaned avatar object");
            }
            Err(anyhow::Error::new(e).context("mark avatar uploaded"))
        }
    }
}

/// Where clients should fetch `user`'s avatar from, if anywhere.
pub async fn avatar_url(st: &AppState, user: &User) -> anyhow::Result<Option<String>> {
    const TTL_SECS: u64 = 10 * 60;
    match user.avatar_source.as_str() {
        AVATAR_LOCAL if user.avatar_uploaded => {
            let key = avatar_key(user.id);
            let url = st
                .storage
                .presign_get(&key, TTL_SECS)
                .await
                .with_context(|| format!("presign url for {}", key))?;
            Ok(Some(url))
        }
        AVATAR_GRAVATAR => Ok(Some(format!(
            "https://www.gravatar.com/avatar/{}?s=256&d=identicon",
            crate::users::dto::email_hash(&user.email)
        ))),
        _ => Ok(None),
    }
}
