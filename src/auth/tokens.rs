use rand::{rngs::OsRng, RngCore};
use time::{Duration, OffsetDateTime};

const TOKEN_BYTES: usize = 20;

/// Opaque single-use token for email confirmation and password reset links.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Reset token plus the instant it stops being accepted.
pub fn generate_reset_token(ttl_minutes: i64, now: OffsetDateTime) -> (String, OffsetDateTime) {
    (generate_token(), now + Duration::minutes(ttl_minutes))
}
