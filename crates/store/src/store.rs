use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrgId, OrgSubId, RepoId};

use crate::{
    AnalysisStatus, NewAnalysisStatus, NewOrgSub, NewRepo, OrgSub, Repo, RepoCommitState, Result,
    StoreError, SubCommitState, Version,
};

/// Result of a conditional (compare-and-swap) write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome<S> {
    /// Exactly one row matched the expected state and was updated.
    Applied,
    /// No row matched. Nothing was written.
    ///
    /// `current` is the state the row is actually in, or `None` if the row
    /// does not exist.
    Stale { current: Option<S> },
}

impl<S> CasOutcome<S> {
    /// Returns true if the write was applied.
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied)
    }
}

/// Field changes written together with a repo commit-state transition.
///
/// `None` leaves the column unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepoChanges {
    pub provider_hook_id: Option<i64>,
    pub create_fail_reason: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A conditional repo update: `WHERE id = ? AND commit_state = from`.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoTransition {
    pub from: RepoCommitState,
    pub to: RepoCommitState,
    pub changes: RepoChanges,
}

impl RepoTransition {
    /// Creates a transition that only moves the commit state.
    pub fn new(from: RepoCommitState, to: RepoCommitState) -> Self {
        Self {
            from,
            to,
            changes: RepoChanges::default(),
        }
    }

    /// Attaches field changes to the transition.
    pub fn with_changes(mut self, changes: RepoChanges) -> Self {
        self.changes = changes;
        self
    }

    /// Rejects writes that the saga graph does not allow. A write that keeps
    /// the state and only records fields is always allowed.
    pub fn check(&self) -> Result<()> {
        if self.from == self.to || self.from.can_transition_to(self.to) {
            return Ok(());
        }
        Err(StoreError::InvalidTransition {
            from: self.from.to_string(),
            to: self.to.to_string(),
        })
    }
}

/// Field changes written together with a subscription transition.
///
/// `None` leaves the column unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubChanges {
    pub payment_gateway_customer_id: Option<String>,
    pub payment_gateway_subscription_id: Option<String>,
    pub seats_count: Option<i32>,
    pub card_token: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A conditional subscription update:
/// `WHERE id = ? AND commit_state = from [AND version = expected_version]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubTransition {
    pub from: SubCommitState,
    pub to: SubCommitState,
    /// If set, the row must also be at this version.
    pub expected_version: Option<Version>,
    /// If true, `version` is incremented in the same write.
    pub bump_version: bool,
    pub changes: SubChanges,
}

impl SubTransition {
    /// Creates a transition that only moves the commit state.
    pub fn new(from: SubCommitState, to: SubCommitState) -> Self {
        Self {
            from,
            to,
            expected_version: None,
            bump_version: false,
            changes: SubChanges::default(),
        }
    }

    /// Requires the row to be at `version` for the write to apply.
    pub fn expect_version(mut self, version: Version) -> Self {
        self.expected_version = Some(version);
        self
    }

    /// Increments the row version in the same write.
    pub fn bump_version(mut self) -> Self {
        self.bump_version = true;
        self
    }

    /// Attaches field changes to the transition.
    pub fn with_changes(mut self, changes: SubChanges) -> Self {
        self.changes = changes;
        self
    }

    /// Rejects writes that the saga graph does not allow. A write that keeps
    /// the state and only records fields is always allowed.
    pub fn check(&self) -> Result<()> {
        if self.from == self.to || self.from.can_transition_to(self.to) {
            return Ok(());
        }
        Err(StoreError::InvalidTransition {
            from: self.from.to_string(),
            to: self.to.to_string(),
        })
    }
}

/// Storage for repositories and their analysis-status rows.
#[async_trait]
pub trait RepoStore: Send + Sync {
    /// Inserts a repo in `create/init`.
    async fn create_repo(&self, repo: NewRepo) -> Result<Repo>;

    /// Loads a repo by id, including soft-deleted rows.
    async fn get_repo(&self, id: RepoId) -> Result<Option<Repo>>;

    /// Finds the live (not soft-deleted) repo with the given full name.
    async fn find_live_repo(&self, full_name: &str) -> Result<Option<Repo>>;

    /// Applies a conditional commit-state transition.
    async fn transition_repo(
        &self,
        id: RepoId,
        transition: RepoTransition,
    ) -> Result<CasOutcome<RepoCommitState>>;

    /// Returns the repo's analysis-status row, inserting it first if it does
    /// not exist. The boolean is true when this call created the row.
    async fn get_or_create_analysis_status(
        &self,
        repo_id: RepoId,
        status: NewAnalysisStatus,
    ) -> Result<(AnalysisStatus, bool)>;
}

/// Storage for organization subscriptions.
#[async_trait]
pub trait OrgSubStore: Send + Sync {
    /// Inserts a subscription in `create/init` at the initial version.
    async fn create_org_sub(&self, sub: NewOrgSub) -> Result<OrgSub>;

    /// Loads a subscription by id, including soft-deleted rows.
    async fn get_org_sub(&self, id: OrgSubId) -> Result<Option<OrgSub>>;

    /// Finds the live (not soft-deleted) subscription of an organization.
    async fn find_live_org_sub(&self, org_id: OrgId) -> Result<Option<OrgSub>>;

    /// Applies a conditional commit-state transition.
    async fn transition_org_sub(
        &self,
        id: OrgSubId,
        transition: SubTransition,
    ) -> Result<CasOutcome<SubCommitState>>;

    /// Hard-deletes the row if it is still in `expected` state.
    async fn delete_org_sub(
        &self,
        id: OrgSubId,
        expected: SubCommitState,
    ) -> Result<CasOutcome<SubCommitState>>;
}
