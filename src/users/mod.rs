use crate::state::AppState;
use axum::Router;

pub mod batch;
mod dto;
pub mod error;
pub mod handlers;
#[cfg(test)]
pub mod memory;
mod password;
pub mod repo;
pub mod repo_types;
pub mod services;

pub fn router() -> Router<AppState> {
    Router::new().merge(handlers::routes())
}
