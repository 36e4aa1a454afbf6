use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;

use super::batch::{BatchAccumulator, BatchOutcome, RowOutcome};
use super::error::{RepoError, RepoResult};
use super::repo::UserRepository;
use super::repo_types::{now_micros, User, UserRecord, UserUpdate};
use crate::context::RequestContext;

/// Map-backed [`UserRepository`] with the same soft-delete and duplicate
/// rules as the PostgreSQL one.
///
/// Error shapes differ in one place: `create` reports a taken id or email as
/// [`RepoError::Conflict`], where PostgreSQL gives a `Store { op: "insert user" }`
/// wrapping the unique violation. Both answer `true` to
/// [`RepoError::is_conflict`], which is what callers branch on.
#[derive(Debug, Default, Clone)]
pub struct InMemoryUserRepository {
    users: Arc<RwLock<HashMap<String, User>>>,
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored password hash, including for soft-deleted rows.
    pub async fn stored_password(&self, id: &str) -> Option<String> {
        self.users.read().await.get(id).map(|u| u.password.clone())
    }

    pub async fn is_tombstoned(&self, id: &str) -> bool {
        self.users.read().await.get(id).is_some_and(|u| u.deleted)
    }
}

fn email_taken(users: &HashMap<String, User>, email: &str) -> bool {
    users.values().any(|u| !u.deleted && u.email == email)
}

fn bump(prev: OffsetDateTime) -> OffsetDateTime {
    now_micros().max(prev + Duration::microseconds(1))
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn create(&self, ctx: &RequestContext, user: &User) -> RepoResult<String> {
        ctx.run(async {
            let mut users = self.users.write().await;
            if users.contains_key(&user.id) {
                return Err(RepoError::Conflict(user.id.clone()));
            }
            if email_taken(&users, &user.email) {
                return Err(RepoError::Conflict(user.email.clone()));
            }
            users.insert(user.id.clone(), user.clone());
            Ok(user.id.clone())
        })
        .await?
    }

    async fn bulk_create(&self, ctx: &RequestContext, batch: &[User]) -> RepoResult<BatchOutcome> {
        ctx.run(async {
            let mut users = self.users.write().await;
            // Staged so that an aborted batch leaves nothing behind.
            let mut staged = users.clone();
            let mut acc = BatchAccumulator::new();
            for (index, user) in batch.iter().enumerate() {
                let row = if staged.contains_key(&user.id) {
                    RowOutcome::Failed(RepoError::Conflict(user.id.clone()))
                } else if email_taken(&staged, &user.email) {
                    RowOutcome::Duplicate
                } else {
                    staged.insert(user.id.clone(), user.clone());
                    RowOutcome::Inserted
                };
                acc.record(index, &user.email, row)?;
            }
            *users = staged;
            Ok::<_, RepoError>(acc.finish())
        })
        .await?
    }

    async fn retrieve(&self, ctx: &RequestContext, id: &str) -> RepoResult<UserRecord> {
        ctx.run(async {
            self.users
                .read()
                .await
                .get(id)
                .filter(|u| !u.deleted)
                .map(User::record)
                .ok_or_else(|| RepoError::NotFound(id.to_string()))
        })
        .await?
    }

    async fn list(&self, ctx: &RequestContext) -> RepoResult<Vec<UserRecord>> {
        let users = ctx
            .run(async {
                self.users
                    .read()
                    .await
                    .values()
                    .filter(|u| !u.deleted)
                    .map(User::record)
                    .collect::<Vec<_>>()
            })
            .await?;
        Ok(users)
    }

    async fn update(&self, ctx: &RequestContext, id: &str, update: &UserUpdate) -> RepoResult<()> {
        ctx.run(async {
            let mut users = self.users.write().await;
            let user = users
                .get_mut(id)
                .filter(|u| !u.deleted)
                .ok_or_else(|| RepoError::NotFound(id.to_string()))?;
            user.first_name = update.first_name.clone();
            user.last_name = update.last_name.clone();
            user.updated_at = bump(user.updated_at);
            Ok::<_, RepoError>(())
        })
        .await?
    }

    async fn delete(&self, ctx: &RequestContext, id: &str) -> RepoResult<()> {
        ctx.run(async {
            let mut users = self.users.write().await;
            let user = users
                .get_mut(id)
                .filter(|u| !u.deleted)
                .ok_or_else(|| RepoError::NotFoundOrDeleted(id.to_string()))?;
            user.deleted = true;
            user.updated_at = bump(user.updated_at);
            Ok::<_, RepoError>(())
        })
        .await?
    }

    async fn update_password(
        &self,
        ctx: &RequestContext,
        id: &str,
        password_hash: &str,
    ) -> RepoResult<()> {
        ctx.run(async {
            let mut users = self.users.write().await;
            let user = users
                .get_mut(id)
                .filter(|u| !u.deleted)
                .ok_or_else(|| RepoError::NotFound(id.to_string()))?;
            user.password = password_hash.to_string();
            user.updated_at = bump(user.updated_at);
            Ok::<_, RepoError>(())
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextError;

    fn ctx() -> RequestContext {
        RequestContext::with_timeout(std::time::Duration::from_secs(5))
    }

    fn user(email: &str) -> User {
        User::new(email, "A", "B", "$argon2id$stub")
    }

    #[tokio::test]
    async fn create_then_retrieve_round_trips_without_password() {
        let repo = InMemoryUserRepository::new();
        let u = user("a@x.com");
        let id = repo.create(&ctx(), &u).await.unwrap();
        assert_eq!(id, u.id);

        let got = repo.retrieve(&ctx(), &id).await.unwrap();
        assert_eq!(got.email, "a@x.com");
        assert_eq!(got.first_name, "A");
        assert_eq!(got.last_name, "B");
        assert!(!got.deleted);
        assert_eq!(got, u.record());
    }

    #[tokio::test]
    async fn retrieve_missing_or_deleted_is_not_found() {
        let repo = InMemoryUserRepository::new();
        assert!(matches!(
            repo.retrieve(&ctx(), "nope").await,
            Err(RepoError::NotFound(_))
        ));

        let id = repo.create(&ctx(), &user("a@x.com")).await.unwrap();
        repo.delete(&ctx(), &id).await.unwrap();
        assert!(matches!(
            repo.retrieve(&ctx(), &id).await,
            Err(RepoError::NotFound(_))
        ));
        assert!(repo.is_tombstoned(&id).await);
    }

    #[tokio::test]
    async fn repeated_delete_reports_the_same_error() {
        let repo = InMemoryUserRepository::new();
        let id = repo.create(&ctx(), &user("a@x.com")).await.unwrap();
        repo.delete(&ctx(), &id).await.unwrap();
        for _ in 0..2 {
            assert!(matches!(
                repo.delete(&ctx(), &id).await,
                Err(RepoError::NotFoundOrDeleted(ref got)) if *got == id
            ));
        }
    }

    #[tokio::test]
    async fn list_is_empty_not_absent() {
        let repo = InMemoryUserRepository::new();
        assert!(repo.list(&ctx()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_skips_tombstones() {
        let repo = InMemoryUserRepository::new();
        let keep = repo.create(&ctx(), &user("a@x.com")).await.unwrap();
        let gone = repo.create(&ctx(), &user("b@x.com")).await.unwrap();
        repo.delete(&ctx(), &gone).await.unwrap();

        let listed = repo.list(&ctx()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, keep);
    }

    #[tokio::test]
    async fn bulk_create_skips_one_duplicate_among_distinct_rows() {
        let repo = InMemoryUserRepository::new();
        let rows = vec![
            user("a@x.com"),
            user("b@x.com"),
            user("a@x.com"),
            user("c@x.com"),
        ];
        let outcome = repo.bulk_create(&ctx(), &rows).await.unwrap();
        assert_eq!(outcome, BatchOutcome { inserted: 3, skipped: 1 });
        assert_eq!(repo.list(&ctx()).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn bulk_create_skips_emails_already_stored() {
        let repo = InMemoryUserRepository::new();
        repo.create(&ctx(), &user("a@x.com")).await.unwrap();
        let outcome = repo
            .bulk_create(&ctx(), &[user("a@x.com"), user("b@x.com")])
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome { inserted: 1, skipped: 1 });
    }

    #[tokio::test]
    async fn bulk_create_aborts_on_id_collision_and_keeps_nothing() {
        let repo = InMemoryUserRepository::new();
        let existing = user("a@x.com");
        repo.create(&ctx(), &existing).await.unwrap();

        let mut clash = user("z@x.com");
        clash.id = existing.id.clone();
        let err = repo
            .bulk_create(&ctx(), &[user("b@x.com"), clash])
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::BatchAborted { index: 1, .. }));
        assert_eq!(repo.list(&ctx()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bulk_create_reuses_email_of_deleted_user() {
        let repo = InMemoryUserRepository::new();
        let gone = repo.create(&ctx(), &user("a@x.com")).await.unwrap();
        repo.delete(&ctx(), &gone).await.unwrap();

        let rows = vec![user("a@x.com"), user("b@x.com")];
        let outcome = repo.bulk_create(&ctx(), &rows).await.unwrap();
        assert_eq!(outcome, BatchOutcome { inserted: 2, skipped: 0 });
        assert_eq!(repo.retrieve(&ctx(), &rows[0].id).await.unwrap().email, "a@x.com");
        assert!(repo.is_tombstoned(&gone).await);
    }

    #[tokio::test]
    async fn deleted_email_can_be_reused() {
        let repo = InMemoryUserRepository::new();
        let id = repo.create(&ctx(), &user("a@x.com")).await.unwrap();
        repo.delete(&ctx(), &id).await.unwrap();
        assert!(repo.create(&ctx(), &user("a@x.com")).await.is_ok());
    }

    #[tokio::test]
    async fn create_with_active_email_is_a_conflict() {
        let repo = InMemoryUserRepository::new();
        repo.create(&ctx(), &user("a@x.com")).await.unwrap();
        let err = repo.create(&ctx(), &user("a@x.com")).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(!err.is_not_found());
        assert_eq!(repo.list(&ctx()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_touches_only_display_fields() {
        let repo = InMemoryUserRepository::new();
        let u = user("a@x.com");
        let id = repo.create(&ctx(), &u).await.unwrap();
        let before = repo.retrieve(&ctx(), &id).await.unwrap();

        let change = UserUpdate {
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
        };
        repo.update(&ctx(), &id, &change).await.unwrap();
        let after = repo.retrieve(&ctx(), &id).await.unwrap();

        assert_eq!(after.first_name, "Ada");
        assert_eq!(after.last_name, "Lovelace");
        assert_eq!(after.email, before.email);
        assert_eq!(after.created_at, before.created_at);
        assert!(after.updated_at > before.updated_at);
        assert_eq!(repo.stored_password(&id).await.as_deref(), Some(u.password.as_str()));
    }

    #[tokio::test]
    async fn update_of_deleted_user_is_not_found() {
        let repo = InMemoryUserRepository::new();
        let id = repo.create(&ctx(), &user("a@x.com")).await.unwrap();
        repo.delete(&ctx(), &id).await.unwrap();
        let change = UserUpdate {
            first_name: "X".into(),
            last_name: "Y".into(),
        };
        assert!(matches!(
            repo.update(&ctx(), &id, &change).await,
            Err(RepoError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn password_update_replaces_hash_and_bumps_timestamp() {
        let repo = InMemoryUserRepository::new();
        let id = repo.create(&ctx(), &user("a@x.com")).await.unwrap();
        let before = repo.retrieve(&ctx(), &id).await.unwrap();

        repo.update_password(&ctx(), &id, "$argon2id$new").await.unwrap();
        assert_eq!(repo.stored_password(&id).await.as_deref(), Some("$argon2id$new"));
        assert!(repo.retrieve(&ctx(), &id).await.unwrap().updated_at > before.updated_at);
    }

    #[tokio::test]
    async fn cancelled_context_fails_every_call() {
        let repo = InMemoryUserRepository::new();
        let ctx = RequestContext::new();
        ctx.cancel();
        assert!(matches!(
            repo.list(&ctx).await,
            Err(RepoError::Context(ContextError::Cancelled))
        ));
        assert!(matches!(
            repo.create(&ctx, &user("a@x.com")).await,
            Err(RepoError::Context(ContextError::Cancelled))
        ));
    }
}
