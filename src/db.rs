use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{
    pool::PoolConnection,
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    Connection, PgPool, Postgres,
};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::config::DatabaseConfig;
use crate::context::{ContextError, RequestContext};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("invalid connection descriptor: {0}")]
    Descriptor(String),

    #[error("database pool error")]
    Pool(#[source] sqlx::Error),

    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Liveness check used by the health route.
#[async_trait]
pub trait Liveness: Send + Sync {
    async fn ping(&self, ctx: &RequestContext) -> Result<(), DbError>;
}

/// The process-wide PostgreSQL pool.
pub struct Database {
    pool: PgPool,
    target: String,
}

impl Database {
    fn open(config: &DatabaseConfig) -> Result<Self, DbError> {
        let options = connect_options(config)?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_lazy_with(options);
        Ok(Self {
            pool,
            target: format!("{}:{}/{}", config.host, config.port, config.name),
        })
    }

    #[cfg(test)]
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            target: "test".into(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// `host:port/database`, without credentials.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub async fn acquire(&self, ctx: &RequestContext) -> Result<PoolConnection<Postgres>, DbError> {
        ctx.run(self.pool.acquire()).await?.map_err(DbError::Pool)
    }

    pub async fn close(&self) {
        if self.pool.is_closed() {
            return;
        }
        self.pool.close().await;
        info!(target_db = %self.target, "database pool closed");
    }
}

#[async_trait]
impl Liveness for Database {
    async fn ping(&self, ctx: &RequestContext) -> Result<(), DbError> {
        let mut conn = self.acquire(ctx).await?;
        ctx.run(conn.ping()).await?.map_err(DbError::Pool)
    }
}

fn connect_options(config: &DatabaseConfig) -> Result<PgConnectOptions, DbError> {
    let port: u16 = config
        .port
        .parse()
        .map_err(|e| DbError::Descriptor(format!("port {:?}: {e}", config.port)))?;
    let ssl_mode = PgSslMode::from_str(&config.ssl_mode)
        .map_err(|e| DbError::Descriptor(format!("sslmode {:?}: {e}", config.ssl_mode)))?;

    Ok(PgConnectOptions::new()
        .host(&config.host)
        .port(port)
        .username(&config.user)
        .password(&config.password)
        .database(&config.name)
        .ssl_mode(ssl_mode))
}

/// Owns the single pool of the process.
///
/// Only the first [`PoolManager::initialize`] builds the pool; every later
/// call hands back the same handle and ignores its configuration.
#[derive(Default)]
pub struct PoolManager {
    cell: OnceCell<Arc<Database>>,
}

impl PoolManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn initialize(
        &self,
        ctx: &RequestContext,
        config: &DatabaseConfig,
    ) -> Result<Arc<Database>, DbError> {
        let db = self
            .cell
            .get_or_try_init(|| async {
                let db = Database::open(config)?;
                info!(target_db = %db.target(), "database pool created");

                // The service starts even when the store is briefly unreachable.
                if let Err(e) = db.ping(ctx).await {
                    warn!(error = ?e, target_db = %db.target(), "database ping failed");
                }
                Ok::<_, DbError>(Arc::new(db))
            })
            .await?;
        Ok(Arc::clone(db))
    }

    pub async fn close(&self) {
        if let Some(db) = self.cell.get() {
            db.close().await;
        }
    }
}
