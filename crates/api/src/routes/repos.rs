//! Repository connect, disconnect and status endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use saga::{CreateRepo, DeleteRepo};
use serde::{Deserialize, Serialize};
use store::{NewRepo, Repo, RepoCommitState, RepoId, RepoTransition};

use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct CreateRepoRequest {
    pub full_name: String,
}

#[derive(Serialize)]
pub struct RepoResponse {
    pub id: RepoId,
    pub full_name: String,
    pub commit_state: RepoCommitState,
    pub provider_hook_id: Option<i64>,
    pub create_fail_reason: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl From<Repo> for RepoResponse {
    fn from(repo: Repo) -> Self {
        Self {
            id: repo.id,
            full_name: repo.full_name,
            commit_state: repo.commit_state,
            provider_hook_id: repo.provider_hook_id,
            create_fail_reason: repo.create_fail_reason,
            deleted_at: repo.deleted_at,
        }
    }
}

fn validate_full_name(full_name: &str) -> Result<(), ApiError> {
    match full_name.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok(())
        }
        _ => Err(ApiError::BadRequest(format!(
            "Invalid repository name {full_name:?}, expected owner/name"
        ))),
    }
}

async fn load(state: &AppState, id: RepoId) -> Result<Repo, ApiError> {
    state
        .repos
        .get_repo(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Repo {id} not found")))
}

/// Moves `repo` from `from` to `to` if nobody else did. Losing the race is
/// fine: the worker only ever moves the row forward.
async fn advance(
    state: &AppState,
    repo: &Repo,
    from: RepoCommitState,
    to: RepoCommitState,
) -> Result<(), ApiError> {
    let outcome = state
        .repos
        .transition_repo(repo.id, RepoTransition::new(from, to))
        .await?;
    if !outcome.is_applied() {
        tracing::debug!(repo_id = %repo.id, %from, %to, ?outcome, "repo already moved on");
    }
    Ok(())
}

async fn enqueue_create(state: &AppState, repo: &Repo) -> Result<(), ApiError> {
    state
        .producers
        .repos_create
        .put(&CreateRepo { repo_id: repo.id })
        .await?;
    if repo.commit_state == RepoCommitState::CreateInit {
        advance(
            state,
            repo,
            RepoCommitState::CreateInit,
            RepoCommitState::CreateSentToQueue,
        )
        .await?;
    }
    Ok(())
}

async fn enqueue_delete(state: &AppState, repo: &Repo) -> Result<(), ApiError> {
    state
        .producers
        .repos_delete
        .put(&DeleteRepo { repo_id: repo.id })
        .await?;
    if repo.commit_state == RepoCommitState::DeleteInit {
        advance(
            state,
            repo,
            RepoCommitState::DeleteInit,
            RepoCommitState::DeleteSentToQueue,
        )
        .await?;
    }
    Ok(())
}

/// POST /repos — connect a repository.
///
/// Posting a repository whose create saga is still running enqueues it again.
#[tracing::instrument(skip(state, req), fields(full_name = %req.full_name))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRepoRequest>,
) -> Result<(StatusCode, Json<RepoResponse>), ApiError> {
    validate_full_name(&req.full_name)?;

    let repo = match state.repos.find_live_repo(&req.full_name).await? {
        Some(existing) if existing.commit_state.is_creating() => existing,
        Some(existing) => {
            return Err(ApiError::Conflict(format!(
                "Repo {} is already connected ({})",
                existing.full_name, existing.commit_state
            )));
        }
        None => {
            state
                .repos
                .create_repo(NewRepo {
                    full_name: req.full_name.clone(),
                    hook_secret: uuid::Uuid::new_v4().simple().to_string(),
                })
                .await?
        }
    };

    enqueue_create(&state, &repo).await?;
    metrics::counter!("api_sagas_enqueued_total", "subqueue" => "repos/create").increment(1);
    tracing::info!(repo_id = %repo.id, "repo create enqueued");

    let current = load(&state, repo.id).await?;
    Ok((StatusCode::ACCEPTED, Json(current.into())))
}

/// GET /repos/{id} — current commit state of a repository.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<RepoResponse>, ApiError> {
    let repo = load(&state, RepoId::new(id)).await?;
    Ok(Json(repo.into()))
}

/// DELETE /repos/{id} — disconnect a repository.
#[tracing::instrument(skip(state))]
pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<RepoResponse>), ApiError> {
    let mut repo = load(&state, RepoId::new(id)).await?;

    match repo.commit_state {
        RepoCommitState::CreateDone => {
            let outcome = state
                .repos
                .transition_repo(
                    repo.id,
                    RepoTransition::new(RepoCommitState::CreateDone, RepoCommitState::DeleteInit),
                )
                .await?;
            if !outcome.is_applied() {
                return Err(ApiError::Conflict(format!(
                    "Repo {id} changed concurrently, retry"
                )));
            }
            repo.commit_state = RepoCommitState::DeleteInit;
        }
        RepoCommitState::DeleteInit | RepoCommitState::DeleteSentToQueue => {}
        RepoCommitState::DeleteDone => return Ok((StatusCode::OK, Json(repo.into()))),
        RepoCommitState::CreateInit
        | RepoCommitState::CreateSentToQueue
        | RepoCommitState::CreateCreatedRepo
        | RepoCommitState::CreateRollbackInit
        | RepoCommitState::CreateRollbackDone => {
            return Err(ApiError::Conflict(format!(
                "Repo {id} cannot be deleted while {}",
                repo.commit_state
            )));
        }
    }

    enqueue_delete(&state, &repo).await?;
    metrics::counter!("api_sagas_enqueued_total", "subqueue" => "repos/delete").increment(1);
    tracing::info!(repo_id = %repo.id, "repo delete enqueued");

    let current = load(&state, repo.id).await?;
    Ok((StatusCode::ACCEPTED, Json(current.into())))
}
