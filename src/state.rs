use std::sync::Arc;

use crate::config::AppConfig;
use crate::context::RequestContext;
use crate::db::{Database, Liveness};
use crate::users::repo::{PgUserRepository, UserRepository};
use crate::users::services::UserService;

#[derive(Clone)]
pub struct AppState {
    pub users: UserService,
    pub liveness: Arc<dyn Liveness>,
    pub config: Arc<AppConfig>,
    shutdown: RequestContext,
}

impl AppState {
    pub fn new(db: Arc<Database>, config: Arc<AppConfig>, shutdown: RequestContext) -> Self {
        let repo = Arc::new(PgUserRepository::new(Arc::clone(&db))) as Arc<dyn UserRepository>;
        Self::from_parts(UserService::new(repo), db, config, shutdown)
    }

    pub fn from_parts(
        users: UserService,
        liveness: Arc<dyn Liveness>,
        config: Arc<AppConfig>,
        shutdown: RequestContext,
    ) -> Self {
        Self {
            users,
            liveness,
            config,
            shutdown,
        }
    }

    /// Context for one inbound request: bounded by the configured timeout and
    /// cancelled when the server shuts down.
    pub fn request_context(&self) -> RequestContext {
        self.shutdown
            .child()
            .limited(self.config.server.request_timeout)
    }
}

#[cfg(test)]
impl AppState {
    pub fn fake() -> Self {
        Self::fake_with_liveness(true)
    }

    pub fn fake_with_liveness(up: bool) -> Self {
        use crate::config::{DatabaseConfig, ServerConfig};
        use crate::db::DbError;
        use crate::users::memory::InMemoryUserRepository;
        use async_trait::async_trait;
        use std::time::Duration;

        struct FakeLiveness(bool);
        #[async_trait]
        impl Liveness for FakeLiveness {
            async fn ping(&self, _ctx: &RequestContext) -> Result<(), DbError> {
                if self.0 {
                    Ok(())
                } else {
                    Err(DbError::Pool(sqlx::Error::PoolTimedOut))
                }
            }
        }

        let config = Arc::new(AppConfig {
            database: DatabaseConfig {
                host: "localhost".into(),
                port: "5432".into(),
                user: "postgres".into(),
                password: "postgres".into(),
                name: "postgres".into(),
                ssl_mode: "disable".into(),
                max_connections: 1,
                acquire_timeout: Duration::from_secs(1),
            },
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 0,
                request_timeout: Duration::from_secs(30),
            },
        });

        Self::from_parts(
            UserService::new(Arc::new(InMemoryUserRepository::new())),
            Arc::new(FakeLiveness(up)),
            config,
            RequestContext::new(),
        )
    }
}
