use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::repo_types::{UserRecord, UserUpdate};
use super::services::NewUser;

/// Request body for creating a user.
#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password: String,
}

impl From<CreateUserRequest> for NewUser {
    fn from(r: CreateUserRequest) -> Self {
        Self {
            email: r.email,
            first_name: r.first_name,
            last_name: r.last_name,
            password: r.password,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreatedUserResponse {
    pub id: String,
}

/// Request body for updating display fields.
#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub first_name: String,
    pub last_name: String,
}

impl From<UpdateUserRequest> for UserUpdate {
    fn from(r: UpdateUserRequest) -> Self {
        Self {
            first_name: r.first_name,
            last_name: r.last_name,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub password: String,
}

/// User as returned over HTTP; never carries the password.
#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub deleted: bool,
}

impl From<UserRecord> for UserResponse {
    fn from(r: UserRecord) -> Self {
        Self {
            id: r.id,
            email: r.email,
            first_name: r.first_name,
            last_name: r.last_name,
            created_at: r.created_at,
            updated_at: r.updated_at,
            deleted: r.deleted,
        }
    }
}
