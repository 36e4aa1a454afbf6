use serde::Serialize;
use tracing::warn;

use super::error::{RepoError, RepoResult};

/// What happened to one row of a bulk insert.
#[derive(Debug)]
pub enum RowOutcome {
    Inserted,
    /// Skipped because an active user already holds the email.
    Duplicate,
    Failed(RepoError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub skipped: usize,
}

/// Folds per-row outcomes, in input order, into a [`BatchOutcome`].
///
/// Duplicates are counted and logged; the first other failure aborts.
#[derive(Debug, Default)]
pub struct BatchAccumulator {
    outcome: BatchOutcome,
}

impl BatchAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, index: usize, email: &str, row: RowOutcome) -> RepoResult<()> {
        match row {
            RowOutcome::Inserted => self.outcome.inserted += 1,
            RowOutcome::Duplicate => {
                warn!(index, email, "skipping user with duplicate email");
                self.outcome.skipped += 1;
            }
            RowOutcome::Failed(source) => {
                return Err(RepoError::BatchAborted {
                    index,
                    source: Box::new(source),
                })
            }
        }
        Ok(())
    }

    pub fn finish(self) -> BatchOutcome {
        self.outcome
    }
}
