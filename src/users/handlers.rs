use axum::{
    extract::{Path, State},
    http::{header::LOCATION, HeaderMap, HeaderValue, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use tracing::{error, instrument};

use super::batch::BatchOutcome;
use super::dto::{
    ChangePasswordRequest, CreateUserRequest, CreatedUserResponse, UpdateUserRequest, UserResponse,
};
use super::error::RepoError;
use super::services::ServiceError;
use crate::context::ContextError;
use crate::db::DbError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/users", get(list_users).post(create_user))
        .route("/users/bulk", post(bulk_create_users))
        .route(
            "/users/:id",
            get(get_user).put(update_user).delete(delete_user),
        )
        .route("/users/:id/password", put(change_password))
}

#[instrument(skip(state, body))]
pub async fn create_user(
    State(state): State<AppState>,
    Json(body): Json<CreateUserRequest>,
) -> Result<(StatusCode, HeaderMap, Json<CreatedUserResponse>), (StatusCode, String)> {
    let ctx = state.request_context();
    let id = state.users.register(&ctx, body.into()).await.map_err(failure)?;

    let mut headers = HeaderMap::new();
    if let Ok(location) = HeaderValue::from_str(&format!("/api/v1/users/{id}")) {
        headers.insert(LOCATION, location);
    }
    Ok((StatusCode::CREATED, headers, Json(CreatedUserResponse { id })))
}

/// POST /users/bulk — rows whose email is taken are skipped, not rejected.
#[instrument(skip(state, body), fields(rows = body.len()))]
pub async fn bulk_create_users(
    State(state): State<AppState>,
    Json(body): Json<Vec<CreateUserRequest>>,
) -> Result<Json<BatchOutcome>, (StatusCode, String)> {
    let ctx = state.request_context();
    let rows = body.into_iter().map(Into::into).collect();
    let outcome = state.users.import(&ctx, rows).await.map_err(failure)?;
    Ok(Json(outcome))
}

#[instrument(skip(state))]
pub async fn list_users(
    State(state): State<AppState>,
) -> Result<Json<Vec<UserResponse>>, (StatusCode, String)> {
    let ctx = state.request_context();
    let users = state.users.list(&ctx).await.map_err(failure)?;
    Ok(Json(users.into_iter().map(UserResponse::from).collect()))
}

#[instrument(skip(state))]
pub async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<UserResponse>, (StatusCode, String)> {
    let ctx = state.request_context();
    let user = state.users.get(&ctx, &id).await.map_err(failure)?;
    Ok(Json(user.into()))
}

#[instrument(skip(state, body))]
pub async fn update_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateUserRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    let ctx = state.request_context();
    state
        .users
        .rename(&ctx, &id, body.into())
        .await
        .map_err(failure)?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, body))]
pub async fn change_password(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ChangePasswordRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    let ctx = state.request_context();
    state
        .users
        .change_password(&ctx, &id, &body.password)
        .await
        .map_err(failure)?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state))]
pub async fn delete_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let ctx = state.request_context();
    state.users.remove(&ctx, &id).await.map_err(failure)?;
    Ok(StatusCode::NO_CONTENT)
}

fn status_for(e: &ServiceError) -> StatusCode {
    let ServiceError::Repo(repo) = e else {
        return StatusCode::INTERNAL_SERVER_ERROR;
    };
    match repo {
        r if r.is_not_found() => StatusCode::NOT_FOUND,
        r if r.is_conflict() => StatusCode::CONFLICT,
        RepoError::Context(ContextError::DeadlineExceeded)
        | RepoError::Pool(DbError::Context(ContextError::DeadlineExceeded)) => {
            StatusCode::GATEWAY_TIMEOUT
        }
        RepoError::Context(_) | RepoError::Pool(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(e: ServiceError) -> (StatusCode, String) {
    let status = status_for(&e);
    if status.is_server_error() {
        error!(error = ?e, %status, "user request failed");
    }
    (status, e.to_string())
}
