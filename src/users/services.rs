use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use super::batch::BatchOutcome;
use super::error::RepoError;
use super::password::{hash_password, PasswordError};
use super::repo::UserRepository;
use super::repo_types::{User, UserRecord, UserUpdate};
use crate::context::RequestContext;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Password(#[from] PasswordError),
}

/// Input for a new user; the password is plaintext here and hashed before
/// anything reaches the repository.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password: String,
}

impl NewUser {
    fn into_user(self) -> Result<User, PasswordError> {
        let mut user = User::new(self.email, self.first_name, self.last_name, self.password);
        user.hash_password()?;
        Ok(user)
    }
}

#[derive(Clone)]
pub struct UserService {
    repo: Arc<dyn UserRepository>,
}

impl UserService {
    pub fn new(repo: Arc<dyn UserRepository>) -> Self {
        Self { repo }
    }

    pub async fn register(&self, ctx: &RequestContext, input: NewUser) -> Result<String, ServiceError> {
        let user = input.into_user()?;
        Ok(self.repo.create(ctx, &user).await?)
    }

    pub async fn import(
        &self,
        ctx: &RequestContext,
        inputs: Vec<NewUser>,
    ) -> Result<BatchOutcome, ServiceError> {
        let users = inputs
            .into_iter()
            .map(NewUser::into_user)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(rows = users.len(), "importing users");
        Ok(self.repo.bulk_create(ctx, &users).await?)
    }

    pub async fn get(&self, ctx: &RequestContext, id: &str) -> Result<UserRecord, ServiceError> {
        Ok(self.repo.retrieve(ctx, id).await?)
    }

    pub async fn list(&self, ctx: &RequestContext) -> Result<Vec<UserRecord>, ServiceError> {
        Ok(self.repo.list(ctx).await?)
    }

    pub async fn rename(
        &self,
        ctx: &RequestContext,
        id: &str,
        update: UserUpdate,
    ) -> Result<(), ServiceError> {
        Ok(self.repo.update(ctx, id, &update).await?)
    }

    pub async fn remove(&self, ctx: &RequestContext, id: &str) -> Result<(), ServiceError> {
        Ok(self.repo.delete(ctx, id).await?)
    }

    pub async fn change_password(
        &self,
        ctx: &RequestContext,
        id: &str,
        plain: &str,
    ) -> Result<(), ServiceError> {
        let hash = hash_password(plain)?;
        Ok(self.repo.update_password(ctx, id, &hash).await?)
    }
}
