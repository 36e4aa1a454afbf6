use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use super::password::{hash_password, PasswordError};

/// A user as written to the `users` table.
///
/// `password` holds the plaintext until [`User::hash_password`] replaces it
/// with the argon2 hash; only the hash is ever persisted.
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub deleted: bool,
}

impl User {
    pub fn new(
        email: impl Into<String>,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let now = now_micros();
        Self {
            id: Uuid::new_v4().to_string(),
            email: email.into(),
            first_name: first_name.into(),
            last_name: last_name.into(),
            password: password.into(),
            created_at: now,
            updated_at: now,
            deleted: false,
        }
    }

    pub fn hash_password(&mut self) -> Result<(), PasswordError> {
        self.password = hash_password(&self.password)?;
        Ok(())
    }

    /// The caller-facing view of this user.
    #[cfg(test)]
    pub fn record(&self) -> UserRecord {
        UserRecord {
            id: self.id.clone(),
            email: self.email.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted: self.deleted,
        }
    }
}

/// A user as read back from the store. Has no password field.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub deleted: bool,
}

/// The display fields an update may change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserUpdate {
    pub first_name: String,
    pub last_name: String,
}

/// Current UTC time at the precision PostgreSQL stores (microseconds).
pub(crate) fn now_micros() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(now.nanosecond() / 1_000 * 1_000)
        .unwrap_or(now)
}
