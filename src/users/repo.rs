use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgDatabaseError;
use tracing::{debug, info, warn};

use super::batch::{BatchAccumulator, BatchOutcome, RowOutcome};
use super::error::{is_unique_violation, RepoError, RepoResult};
use super::repo_types::{User, UserRecord, UserUpdate};
use crate::context::RequestContext;
use crate::db::Database;

/// Persistence contract for users. Reads and mutations only ever see rows
/// that are not soft-deleted.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Insert one user, returning its id.
    async fn create(&self, ctx: &RequestContext, user: &User) -> RepoResult<String>;

    /// Insert many users in one round-trip. Rows whose email is already held
    /// by an active user are skipped.
    async fn bulk_create(&self, ctx: &RequestContext, users: &[User]) -> RepoResult<BatchOutcome>;

    async fn retrieve(&self, ctx: &RequestContext, id: &str) -> RepoResult<UserRecord>;

    /// All active users, in no particular order.
    async fn list(&self, ctx: &RequestContext) -> RepoResult<Vec<UserRecord>>;

    async fn update(&self, ctx: &RequestContext, id: &str, update: &UserUpdate) -> RepoResult<()>;

    /// Soft delete. A second call for the same id fails with
    /// [`RepoError::NotFoundOrDeleted`].
    async fn delete(&self, ctx: &RequestContext, id: &str) -> RepoResult<()>;

    async fn update_password(
        &self,
        ctx: &RequestContext,
        id: &str,
        password_hash: &str,
    ) -> RepoResult<()>;
}

/// PostgreSQL implementation. Borrows the pool from the [`Database`] handle
/// and never closes it.
#[derive(Clone)]
pub struct PgUserRepository {
    db: Arc<Database>,
}

impl PgUserRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn create(&self, ctx: &RequestContext, user: &User) -> RepoResult<String> {
        let mut conn = self.db.acquire(ctx).await?;
        ctx.run(
            sqlx::query(
                r#"
                INSERT INTO users (id, email, first_name, last_name, password, created_at, updated_at, deleted)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(user.id.as_str())
            .bind(user.email.as_str())
            .bind(user.first_name.as_str())
            .bind(user.last_name.as_str())
            .bind(user.password.as_str())
            .bind(user.created_at)
            .bind(user.updated_at)
            .bind(user.deleted)
            .execute(&mut *conn),
        )
        .await?
        .map_err(RepoError::store("insert user"))?;

        info!(user_id = %user.id, "user created");
        Ok(user.id.clone())
    }

    async fn bulk_create(&self, ctx: &RequestContext, users: &[User]) -> RepoResult<BatchOutcome> {
        if users.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let mut ids = Vec::with_capacity(users.len());
        let mut emails = Vec::with_capacity(users.len());
        let mut first_names = Vec::with_capacity(users.len());
        let mut last_names = Vec::with_capacity(users.len());
        let mut passwords = Vec::with_capacity(users.len());
        let mut created = Vec::with_capacity(users.len());
        let mut updated = Vec::with_capacity(users.len());
        let mut deleted = Vec::with_capacity(users.len());
        for u in users {
            ids.push(u.id.clone());
            emails.push(u.email.clone());
            first_names.push(u.first_name.clone());
            last_names.push(u.last_name.clone());
            passwords.push(u.password.clone());
            created.push(u.created_at);
            updated.push(u.updated_at);
            deleted.push(u.deleted);
        }

        let mut conn = self.db.acquire(ctx).await?;
        let rows = ctx
            .run(
                sqlx::query_scalar::<_, String>(
                    r#"
                    INSERT INTO users (id, email, first_name, last_name, password, created_at, updated_at, deleted)
                    SELECT * FROM UNNEST(
                        $1::text[], $2::text[], $3::text[], $4::text[], $5::text[],
                        $6::timestamptz[], $7::timestamptz[], $8::bool[]
                    )
                    ON CONFLICT (email) WHERE NOT deleted DO NOTHING
                    RETURNING id
                    "#,
                )
                .bind(ids)
                .bind(emails)
                .bind(first_names)
                .bind(last_names)
                .bind(passwords)
                .bind(created)
                .bind(updated)
                .bind(deleted)
                .fetch_all(&mut *conn),
            )
            .await?;

        // The statement is all or nothing: on error no row of the batch is kept.
        let (inserted, mut failure) = match rows {
            Ok(ids) => (ids.into_iter().collect::<HashSet<_>>(), None),
            Err(source) => (HashSet::new(), Some(row_failure(users, source)?)),
        };

        let mut acc = BatchAccumulator::new();
        for (index, user) in users.iter().enumerate() {
            let row = match failure.take() {
                Some((at, cause)) if at == index => RowOutcome::Failed(cause),
                pending => {
                    // rows ahead of the failing one were accepted before the rollback
                    let accepted = pending.is_some() || inserted.contains(&user.id);
                    failure = pending;
                    if accepted {
                        RowOutcome::Inserted
                    } else {
                        RowOutcome::Duplicate
                    }
                }
            };
            acc.record(index, &user.email, row)?;
        }

        let outcome = acc.finish();
        info!(inserted = outcome.inserted, skipped = outcome.skipped, "user batch inserted");
        Ok(outcome)
    }

    async fn retrieve(&self, ctx: &RequestContext, id: &str) -> RepoResult<UserRecord> {
        let mut conn = self.db.acquire(ctx).await?;
        let row = ctx
            .run(
                sqlx::query_as::<_, UserRecord>(
                    r#"
                    SELECT id, email, first_name, last_name, created_at, updated_at, deleted
                    FROM users
                    WHERE id = $1 AND NOT deleted
                    "#,
                )
                .bind(id)
                .fetch_optional(&mut *conn),
            )
            .await?
            .map_err(RepoError::store("retrieve user"))?;

        row.ok_or_else(|| RepoError::NotFound(id.to_string()))
    }

    async fn list(&self, ctx: &RequestContext) -> RepoResult<Vec<UserRecord>> {
        let mut conn = self.db.acquire(ctx).await?;
        let rows = ctx
            .run(
                sqlx::query_as::<_, UserRecord>(
                    r#"
                    SELECT id, email, first_name, last_name, created_at, updated_at, deleted
                    FROM users
                    WHERE NOT deleted
                    "#,
                )
                .fetch_all(&mut *conn),
            )
            .await?
            .map_err(RepoError::store("list users"))?;

        debug!(count = rows.len(), "users listed");
        Ok(rows)
    }

    async fn update(&self, ctx: &RequestContext, id: &str, update: &UserUpdate) -> RepoResult<()> {
        let mut conn = self.db.acquire(ctx).await?;
        let res = ctx
            .run(
                sqlx::query(
                    r#"
                    UPDATE users
                    SET first_name = $2,
                        last_name = $3,
                        updated_at = GREATEST(now(), updated_at + interval '1 microsecond')
                    WHERE id = $1 AND NOT deleted
                    "#,
                )
                .bind(id)
                .bind(update.first_name.as_str())
                .bind(update.last_name.as_str())
                .execute(&mut *conn),
            )
            .await?
            .map_err(RepoError::store("update user"))?;

        if res.rows_affected() == 0 {
            return Err(RepoError::NotFound(id.to_string()));
        }
        info!(user_id = %id, "user updated");
        Ok(())
    }

    async fn delete(&self, ctx: &RequestContext, id: &str) -> RepoResult<()> {
        let mut conn = self.db.acquire(ctx).await?;
        let res = ctx
            .run(
                sqlx::query(
                    r#"
                    UPDATE users
                    SET deleted = TRUE,
                        updated_at = GREATEST(now(), updated_at + interval '1 microsecond')
                    WHERE id = $1 AND NOT deleted
                    "#,
                )
                .bind(id)
                .execute(&mut *conn),
            )
            .await?
            .map_err(RepoError::store("delete user"))?;

        if res.rows_affected() == 0 {
            return Err(RepoError::NotFoundOrDeleted(id.to_string()));
        }
        info!(user_id = %id, "user soft-deleted");
        Ok(())
    }

    async fn update_password(
        &self,
        ctx: &RequestContext,
        id: &str,
        password_hash: &str,
    ) -> RepoResult<()> {
        let mut conn = self.db.acquire(ctx).await?;
        let res = ctx
            .run(
                sqlx::query(
                    r#"
                    UPDATE users
                    SET password = $2,
                        updated_at = GREATEST(now(), updated_at + interval '1 microsecond')
                    WHERE id = $1 AND NOT deleted
                    "#,
                )
                .bind(id)
                .bind(password_hash)
                .execute(&mut *conn),
            )
            .await?
            .map_err(RepoError::store("update user password"))?;

        if res.rows_affected() == 0 {
            return Err(RepoError::NotFound(id.to_string()));
        }
        info!(user_id = %id, "user password changed");
        Ok(())
    }
}

/// Pins a failed batch statement on the row PostgreSQL names in the error
/// detail. Errors that name no row come back as a plain store error.
fn row_failure(users: &[User], source: sqlx::Error) -> RepoResult<(usize, RepoError)> {
    let index = match &source {
        sqlx::Error::Database(db) => db
            .try_downcast_ref::<PgDatabaseError>()
            .and_then(PgDatabaseError::detail)
            .and_then(|detail| blamed_row(users, detail)),
        _ => None,
    };
    let Some(index) = index else {
        return Err(RepoError::store("insert user batch")(source));
    };

    warn!(index, error = %source, "user batch rejected");
    let cause = if is_unique_violation(&source) {
        RepoError::Conflict(users[index].id.clone())
    } else {
        RepoError::store("insert user batch")(source)
    };
    Ok((index, cause))
}

/// Finds the row behind a detail such as `Key (id)=(abc) already exists.`
///
/// When the key repeats inside the batch, the second occurrence is the one
/// that collided.
fn blamed_row(users: &[User], detail: &str) -> Option<usize> {
    let (column, rest) = detail.strip_prefix("Key (")?.split_once(")=(")?;
    let (value, _) = rest.rsplit_once(')')?;
    let mut hits = users
        .iter()
        .enumerate()
        .filter(|(_, u)| match column {
            "id" => u.id == value,
            "email" => u.email == value,
            _ => false,
        })
        .map(|(i, _)| i);
    let first = hits.next()?;
    Some(hits.next().unwrap_or(first))
}
