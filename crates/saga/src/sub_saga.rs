//! Subscription lifecycle saga.
//!
//! Gateway objects are created with idempotency keys derived from the
//! message lock id, and every local write is conditional on the commit state
//! the step started from. A redelivered message therefore never creates a
//! second customer or subscription.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dispatch::Handler;
use queue::{ConsumeError, Message};
use store::{
    CasOutcome, OrgSub, OrgSubId, OrgSubStore, SubChanges, SubCommitState, SubTransition, Version,
};

use crate::error::{Result, SagaError};
use crate::messages::{CreateSub, DeleteSub, UpdateSub};
use crate::services::{PaymentError, PaymentGateway};

/// The state the API moves an `init` row to once its message is enqueued.
fn queued_sibling(state: SubCommitState) -> Option<SubCommitState> {
    match state {
        SubCommitState::CreateInit => Some(SubCommitState::CreateSentToQueue),
        SubCommitState::UpdateInit => Some(SubCommitState::UpdateSentToQueue),
        SubCommitState::DeleteInit => Some(SubCommitState::DeleteSentToQueue),
        SubCommitState::CreateSentToQueue
        | SubCommitState::CreateDone
        | SubCommitState::UpdateSentToQueue
        | SubCommitState::UpdateDone
        | SubCommitState::DeleteSentToQueue
        | SubCommitState::DeleteDone => None,
    }
}

fn stale_write(
    sub: &OrgSub,
    expected: SubCommitState,
    current: Option<SubCommitState>,
) -> SagaError {
    SagaError::StaleWrite {
        entity: "org_sub",
        id: sub.id.as_i64(),
        expected: expected.to_string(),
        found: current.map_or_else(|| "no row".to_string(), |s| s.to_string()),
    }
}

/// Drives subscriptions through their create, update and delete sagas.
pub struct SubSaga {
    store: Arc<dyn OrgSubStore>,
    gateway: Arc<dyn PaymentGateway>,
}

impl SubSaga {
    pub fn new(store: Arc<dyn OrgSubStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { store, gateway }
    }

    async fn load(&self, id: OrgSubId) -> Result<Option<OrgSub>> {
        let sub = self.store.get_org_sub(id).await?;
        if sub.is_none() {
            tracing::warn!("subscription not found, nothing to do");
        }
        Ok(sub)
    }

    /// Writes a transition that must apply.
    ///
    /// The API marks a row `sent_to_queue` after enqueueing, which can race
    /// with the worker that already picked the message up. A write from an
    /// `init` state follows the row to its `sent_to_queue` sibling.
    async fn apply(&self, sub: &OrgSub, mut transition: SubTransition) -> Result<()> {
        loop {
            let (from, to) = (transition.from, transition.to);
            match self
                .store
                .transition_org_sub(sub.id, transition.clone())
                .await?
            {
                CasOutcome::Applied => {
                    metrics::counter!("saga_transitions_total", "saga" => "org_sub", "to" => to.as_str())
                        .increment(1);
                    tracing::info!(%from, %to, "subscription transitioned");
                    return Ok(());
                }
                CasOutcome::Stale {
                    current: Some(current),
                } if queued_sibling(from) == Some(current) => {
                    tracing::debug!(%from, %current, "row marked sent_to_queue concurrently");
                    if to == from {
                        transition.to = current;
                    }
                    transition.from = current;
                }
                CasOutcome::Stale { current } => {
                    metrics::counter!("saga_stale_transitions_total", "saga" => "org_sub")
                        .increment(1);
                    return Err(stale_write(sub, from, current));
                }
            }
        }
    }

    /// Creates the gateway customer and subscription, then marks the
    /// subscription `create/done`.
    #[tracing::instrument(skip(self), fields(sub_id = %message.sub_id))]
    pub async fn run_create(&self, message: &CreateSub) -> Result<()> {
        let Some(sub) = self.load(message.sub_id).await? else {
            return Ok(());
        };
        let state = sub.commit_state;
        if !matches!(
            state,
            SubCommitState::CreateInit | SubCommitState::CreateSentToQueue
        ) {
            tracing::debug!(%state, "subscription not being created, nothing to do");
            return Ok(());
        }

        let key = message.lock_id();
        let customer_id = match &sub.payment_gateway_customer_id {
            Some(customer_id) => customer_id.clone(),
            None => {
                let customer_id = self
                    .gateway
                    .create_customer(
                        &sub.billing_email,
                        &sub.card_token,
                        &format!("{key}/customer"),
                    )
                    .await?;
                // Same-state write: records the customer without advancing.
                self.apply(
                    &sub,
                    SubTransition::new(state, state).with_changes(SubChanges {
                        payment_gateway_customer_id: Some(customer_id.clone()),
                        ..SubChanges::default()
                    }),
                )
                .await?;
                customer_id
            }
        };

        let subscription_id = match &sub.payment_gateway_subscription_id {
            Some(subscription_id) => subscription_id.clone(),
            None => {
                self.gateway
                    .create_subscription(
                        &customer_id,
                        sub.seats_count,
                        &format!("{key}/subscription"),
                    )
                    .await?
            }
        };

        self.apply(
            &sub,
            SubTransition::new(state, SubCommitState::CreateDone).with_changes(SubChanges {
                payment_gateway_subscription_id: Some(subscription_id),
                ..SubChanges::default()
            }),
        )
        .await
    }

    /// Applies the requested seat count and card to the gateway subscription,
    /// then marks the subscription `update/done` and bumps its version.
    #[tracing::instrument(skip(self, message), fields(sub_id = %message.sub_id, expected_version = %message.expected_version))]
    pub async fn run_update(&self, message: &UpdateSub) -> Result<()> {
        let Some(sub) = self.load(message.sub_id).await? else {
            return Ok(());
        };
        let state = sub.commit_state;
        if !matches!(
            state,
            SubCommitState::UpdateInit | SubCommitState::UpdateSentToQueue
        ) {
            tracing::debug!(%state, "subscription not being updated, nothing to do");
            return Ok(());
        }
        if sub.version != message.expected_version {
            tracing::warn!(version = %sub.version, "update superseded by a newer version");
            return Ok(());
        }

        let subscription_id = sub.payment_gateway_subscription_id.as_deref().ok_or(
            SagaError::MissingField {
                entity: "org_sub",
                id: sub.id.as_i64(),
                field: "payment_gateway_subscription_id",
            },
        )?;
        self.gateway
            .update_subscription(subscription_id, message.seats_count, &message.card_token)
            .await?;

        self.apply(
            &sub,
            SubTransition::new(state, SubCommitState::UpdateDone)
                .expect_version(message.expected_version)
                .bump_version()
                .with_changes(SubChanges {
                    seats_count: Some(message.seats_count),
                    card_token: Some(message.card_token.clone()),
                    ..SubChanges::default()
                }),
        )
        .await
    }

    /// Cancels the gateway subscription, then marks the subscription
    /// `delete/done` and soft-deletes it.
    #[tracing::instrument(skip(self), fields(sub_id = %message.sub_id))]
    pub async fn run_delete(&self, message: &DeleteSub) -> Result<()> {
        let Some(sub) = self.load(message.sub_id).await? else {
            return Ok(());
        };
        let state = sub.commit_state;
        if !matches!(
            state,
            SubCommitState::DeleteInit | SubCommitState::DeleteSentToQueue
        ) {
            tracing::debug!(%state, "subscription not being deleted, nothing to do");
            return Ok(());
        }

        if let Some(subscription_id) = sub.payment_gateway_subscription_id.as_deref() {
            match self.gateway.delete_subscription(subscription_id).await {
                Ok(()) => {}
                Err(PaymentError::NotFound(_)) => {
                    tracing::debug!(subscription_id, "gateway subscription already gone");
                }
                Err(err) => return Err(err.into()),
            }
        }

        self.apply(
            &sub,
            SubTransition::new(state, SubCommitState::DeleteDone).with_changes(SubChanges {
                deleted_at: Some(Utc::now()),
                ..SubChanges::default()
            }),
        )
        .await
    }

    /// Removes a subscription whose creation failed permanently.
    pub async fn compensate_create(&self, message: &CreateSub) -> Result<()> {
        let Some(sub) = self.load(message.sub_id).await? else {
            return Ok(());
        };
        let state = sub.commit_state;
        if !matches!(
            state,
            SubCommitState::CreateInit | SubCommitState::CreateSentToQueue
        ) {
            return Ok(());
        }

        let mut expected = state;
        loop {
            match self.store.delete_org_sub(sub.id, expected).await? {
                CasOutcome::Applied => {
                    tracing::info!(state = %expected, "failed subscription deleted");
                    return Ok(());
                }
                CasOutcome::Stale {
                    current: Some(current),
                } if queued_sibling(expected) == Some(current) => expected = current,
                CasOutcome::Stale { current } => return Err(stale_write(&sub, expected, current)),
            }
        }
    }

    /// Returns a subscription whose update or delete failed permanently to
    /// the active state `restore_to`.
    pub async fn compensate_to_active(
        &self,
        id: OrgSubId,
        in_flight: [SubCommitState; 2],
        restore_to: SubCommitState,
        expected_version: Option<Version>,
    ) -> Result<()> {
        let Some(sub) = self.load(id).await? else {
            return Ok(());
        };
        if !in_flight.contains(&sub.commit_state) {
            return Ok(());
        }
        if expected_version.is_some_and(|version| version != sub.version) {
            return Ok(());
        }

        let mut transition = SubTransition::new(sub.commit_state, restore_to);
        if let Some(version) = expected_version {
            transition = transition.expect_version(version);
        }
        self.apply(&sub, transition).await
    }
}

#[async_trait]
impl Handler<CreateSub> for SubSaga {
    async fn handle(&self, message: &CreateSub) -> std::result::Result<(), ConsumeError> {
        Ok(self.run_create(message).await?)
    }

    async fn compensate(
        &self,
        message: &CreateSub,
        _cause: &ConsumeError,
    ) -> std::result::Result<(), ConsumeError> {
        Ok(self.compensate_create(message).await?)
    }
}

#[async_trait]
impl Handler<UpdateSub> for SubSaga {
    async fn handle(&self, message: &UpdateSub) -> std::result::Result<(), ConsumeError> {
        Ok(self.run_update(message).await?)
    }

    async fn compensate(
        &self,
        message: &UpdateSub,
        _cause: &ConsumeError,
    ) -> std::result::Result<(), ConsumeError> {
        Ok(self
            .compensate_to_active(
                message.sub_id,
                [SubCommitState::UpdateInit, SubCommitState::UpdateSentToQueue],
                SubCommitState::CreateDone,
                Some(message.expected_version),
            )
            .await?)
    }
}

#[async_trait]
impl Handler<DeleteSub> for SubSaga {
    async fn handle(&self, message: &DeleteSub) -> std::result::Result<(), ConsumeError> {
        Ok(self.run_delete(message).await?)
    }

    async fn compensate(
        &self,
        message: &DeleteSub,
        _cause: &ConsumeError,
    ) -> std::result::Result<(), ConsumeError> {
        Ok(self
            .compensate_to_active(
                message.sub_id,
                [SubCommitState::DeleteInit, SubCommitState::DeleteSentToQueue],
                message
                    .restore_to
                    .filter(SubCommitState::is_active)
                    .unwrap_or(SubCommitState::CreateDone),
                None,
            )
            .await?)
    }
}
