use thiserror::Error;

use crate::context::ContextError;
use crate::db::DbError;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("user {0} not found")]
    NotFound(String),

    #[error("user {0} not found or already deleted")]
    NotFoundOrDeleted(String),

    /// A row whose key is already taken, named by id or email.
    #[error("user {0} already exists")]
    Conflict(String),

    #[error("unable to {op}")]
    Store {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("user batch aborted at row {index}")]
    BatchAborted {
        index: usize,
        #[source]
        source: Box<RepoError>,
    },

    #[error(transparent)]
    Pool(#[from] DbError),

    #[error(transparent)]
    Context(#[from] ContextError),
}

pub type RepoResult<T> = Result<T, RepoError>;

impl RepoError {
    pub(crate) fn store(op: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::Store { op, source }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::NotFoundOrDeleted(_))
    }

    /// Uniqueness conflicts, whether attributed to a row or still wrapped in
    /// the store error.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Store { source, .. } => is_unique_violation(source),
            Self::BatchAborted { source, .. } => source.is_conflict(),
            _ => false,
        }
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}
