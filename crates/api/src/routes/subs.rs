//! Organization subscription endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use saga::{CreateSub, DeleteSub, UpdateSub};
use serde::{Deserialize, Serialize};
use store::{NewOrgSub, OrgId, OrgSub, OrgSubId, SubCommitState, SubTransition, Version};

use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct CreateSubRequest {
    pub org_id: OrgId,
    pub billing_email: String,
    pub seats_count: i32,
    pub card_token: String,
}

#[derive(Deserialize)]
pub struct UpdateSubRequest {
    pub seats_count: i32,
    pub card_token: String,
    /// Version the client last read; the update is refused if the row has
    /// moved on.
    pub version: Version,
}

#[derive(Serialize)]
pub struct SubResponse {
    pub id: OrgSubId,
    pub org_id: OrgId,
    pub billing_email: String,
    pub seats_count: i32,
    pub commit_state: SubCommitState,
    pub version: Version,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl From<OrgSub> for SubResponse {
    fn from(sub: OrgSub) -> Self {
        Self {
            id: sub.id,
            org_id: sub.org_id,
            billing_email: sub.billing_email,
            seats_count: sub.seats_count,
            commit_state: sub.commit_state,
            version: sub.version,
            deleted_at: sub.deleted_at,
        }
    }
}

fn validate_seats(seats_count: i32) -> Result<(), ApiError> {
    if seats_count < 1 {
        return Err(ApiError::BadRequest(format!(
            "seats_count must be positive, got {seats_count}"
        )));
    }
    Ok(())
}

fn validate_card(card_token: &str) -> Result<(), ApiError> {
    if card_token.trim().is_empty() {
        return Err(ApiError::BadRequest("card_token is required".to_string()));
    }
    Ok(())
}

async fn load(state: &AppState, id: OrgSubId) -> Result<OrgSub, ApiError> {
    state
        .subs
        .get_org_sub(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Subscription {id} not found")))
}

/// Moves the row to `sent_to_queue` after its message was enqueued. Losing
/// the race against the worker is fine.
async fn mark_sent(
    state: &AppState,
    sub: &OrgSub,
    from: SubCommitState,
    to: SubCommitState,
    version: Option<Version>,
) -> Result<(), ApiError> {
    let mut transition = SubTransition::new(from, to);
    if let Some(version) = version {
        transition = transition.expect_version(version);
    }
    let outcome = state.subs.transition_org_sub(sub.id, transition).await?;
    if !outcome.is_applied() {
        tracing::debug!(sub_id = %sub.id, %from, %to, ?outcome, "subscription already moved on");
    }
    Ok(())
}

/// Starts a saga from an active state, refusing if the row moved meanwhile.
async fn begin(
    state: &AppState,
    sub: &OrgSub,
    to: SubCommitState,
    version: Option<Version>,
) -> Result<(), ApiError> {
    let mut transition = SubTransition::new(sub.commit_state, to);
    if let Some(version) = version {
        transition = transition.expect_version(version);
    }
    let outcome = state.subs.transition_org_sub(sub.id, transition).await?;
    if !outcome.is_applied() {
        return Err(ApiError::Conflict(format!(
            "Subscription {} changed concurrently, reload and retry",
            sub.id
        )));
    }
    Ok(())
}

/// POST /subs — subscribe an organization.
#[tracing::instrument(skip(state, req), fields(org_id = %req.org_id))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSubRequest>,
) -> Result<(StatusCode, Json<SubResponse>), ApiError> {
    validate_seats(req.seats_count)?;
    validate_card(&req.card_token)?;
    if !req.billing_email.contains('@') {
        return Err(ApiError::BadRequest(format!(
            "Invalid billing email {:?}",
            req.billing_email
        )));
    }

    let sub = match state.subs.find_live_org_sub(req.org_id).await? {
        Some(existing)
            if matches!(
                existing.commit_state,
                SubCommitState::CreateInit | SubCommitState::CreateSentToQueue
            ) =>
        {
            existing
        }
        Some(existing) => {
            return Err(ApiError::Conflict(format!(
                "Organization {} already has subscription {} ({})",
                req.org_id, existing.id, existing.commit_state
            )));
        }
        None => {
            state
                .subs
                .create_org_sub(NewOrgSub {
                    org_id: req.org_id,
                    billing_email: req.billing_email,
                    seats_count: req.seats_count,
                    card_token: req.card_token,
                })
                .await?
        }
    };

    state
        .producers
        .subs_create
        .put(&CreateSub { sub_id: sub.id })
        .await?;
    if sub.commit_state == SubCommitState::CreateInit {
        mark_sent(
            &state,
            &sub,
            SubCommitState::CreateInit,
            SubCommitState::CreateSentToQueue,
            None,
        )
        .await?;
    }
    metrics::counter!("api_sagas_enqueued_total", "subqueue" => "subs/create").increment(1);
    tracing::info!(sub_id = %sub.id, "subscription create enqueued");

    let current = load(&state, sub.id).await?;
    Ok((StatusCode::ACCEPTED, Json(current.into())))
}

/// GET /subs/{id} — current commit state of a subscription.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<SubResponse>, ApiError> {
    let sub = load(&state, OrgSubId::new(id)).await?;
    Ok(Json(sub.into()))
}

/// PUT /subs/{id} — change seat count or card.
///
/// Only an active subscription at the client's version can be updated.
/// Retrying an update that is still in flight at that version enqueues it
/// again.
#[tracing::instrument(skip(state, req), fields(version = %req.version))]
pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateSubRequest>,
) -> Result<(StatusCode, Json<SubResponse>), ApiError> {
    validate_seats(req.seats_count)?;
    validate_card(&req.card_token)?;

    let sub = load(&state, OrgSubId::new(id)).await?;
    let retrying = matches!(
        sub.commit_state,
        SubCommitState::UpdateInit | SubCommitState::UpdateSentToQueue
    );
    if !sub.commit_state.is_active() && !retrying {
        return Err(ApiError::Conflict(format!(
            "Subscription {id} is busy ({})",
            sub.commit_state
        )));
    }
    if sub.version != req.version {
        return Err(ApiError::Conflict(format!(
            "Subscription {id} is at version {}, not {}",
            sub.version, req.version
        )));
    }

    if !retrying {
        begin(&state, &sub, SubCommitState::UpdateInit, Some(req.version)).await?;
    }
    state
        .producers
        .subs_update
        .put(&UpdateSub {
            sub_id: sub.id,
            seats_count: req.seats_count,
            card_token: req.card_token,
            expected_version: req.version,
        })
        .await?;
    if sub.commit_state != SubCommitState::UpdateSentToQueue {
        mark_sent(
            &state,
            &sub,
            SubCommitState::UpdateInit,
            SubCommitState::UpdateSentToQueue,
            Some(req.version),
        )
        .await?;
    }
    metrics::counter!("api_sagas_enqueued_total", "subqueue" => "subs/update").increment(1);
    tracing::info!(sub_id = %sub.id, "subscription update enqueued");

    let current = load(&state, sub.id).await?;
    Ok((StatusCode::ACCEPTED, Json(current.into())))
}

/// DELETE /subs/{id} — cancel a subscription.
#[tracing::instrument(skip(state))]
pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<SubResponse>), ApiError> {
    let sub = load(&state, OrgSubId::new(id)).await?;

    match sub.commit_state {
        SubCommitState::CreateDone | SubCommitState::UpdateDone => {
            begin(&state, &sub, SubCommitState::DeleteInit, None).await?;
        }
        SubCommitState::DeleteInit | SubCommitState::DeleteSentToQueue => {}
        SubCommitState::DeleteDone => return Ok((StatusCode::OK, Json(sub.into()))),
        SubCommitState::CreateInit
        | SubCommitState::CreateSentToQueue
        | SubCommitState::UpdateInit
        | SubCommitState::UpdateSentToQueue => {
            return Err(ApiError::Conflict(format!(
                "Subscription {id} is busy ({})",
                sub.commit_state
            )));
        }
    }

    state
        .producers
        .subs_delete
        .put(&DeleteSub {
            sub_id: sub.id,
            restore_to: Some(sub.commit_state).filter(SubCommitState::is_active),
        })
        .await?;
    if sub.commit_state != SubCommitState::DeleteSentToQueue {
        mark_sent(
            &state,
            &sub,
            SubCommitState::DeleteInit,
            SubCommitState::DeleteSentToQueue,
            None,
        )
        .await?;
    }
    metrics::counter!("api_sagas_enqueued_total", "subqueue" => "subs/delete").increment(1);
    tracing::info!(sub_id = %sub.id, "subscription delete enqueued");

    let current = load(&state, sub.id).await?;
    Ok((StatusCode::ACCEPTED, Json(current.into())))
}
