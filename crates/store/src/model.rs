//! Saga entity rows.

use chrono::{DateTime, Utc};
use common::{OrgId, OrgSubId, RepoId};
use serde::{Deserialize, Serialize};

use crate::state::{RepoCommitState, SubCommitState};

/// Optimistic-concurrency counter carried by entities that the API may
/// mutate while a saga is running.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the version a freshly inserted row starts at.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A repository connected to the analysis service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repo {
    pub id: RepoId,
    /// `owner/name` on the VCS provider.
    pub full_name: String,
    /// Random path component of the webhook URL, so that webhook deliveries
    /// can be authenticated without a provider round-trip.
    pub hook_secret: String,
    pub commit_state: RepoCommitState,
    pub provider_hook_id: Option<i64>,
    pub create_fail_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Insert payload for [`Repo`]. New rows always start in `create/init`.
#[derive(Debug, Clone)]
pub struct NewRepo {
    pub full_name: String,
    pub hook_secret: String,
}

/// Per-repository analysis bookkeeping, created once by the repo saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisStatus {
    pub repo_id: RepoId,
    pub default_branch: String,
    /// Head commit of the default branch when the row was last refreshed.
    pub head_commit_sha: Option<String>,
    pub last_analyzed_commit_sha: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AnalysisStatus {
    /// Returns the commit that still needs an analysis, if any.
    pub fn pending_commit(&self) -> Option<&str> {
        match (&self.head_commit_sha, &self.last_analyzed_commit_sha) {
            (Some(head), Some(done)) if head == done => None,
            (Some(head), _) => Some(head),
            (None, _) => None,
        }
    }
}

/// Insert payload for [`AnalysisStatus`].
#[derive(Debug, Clone)]
pub struct NewAnalysisStatus {
    pub default_branch: String,
    pub head_commit_sha: Option<String>,
}

/// An organization's paid subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgSub {
    pub id: OrgSubId,
    pub org_id: OrgId,
    pub billing_email: String,
    pub seats_count: i32,
    pub card_token: String,
    pub payment_gateway_customer_id: Option<String>,
    pub payment_gateway_subscription_id: Option<String>,
    pub commit_state: SubCommitState,
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Insert payload for [`OrgSub`]. New rows always start in `create/init`
/// at [`Version::initial`].
#[derive(Debug, Clone)]
pub struct NewOrgSub {
    pub org_id: OrgId,
    pub billing_email: String,
    pub seats_count: i32,
    pub card_token: String,
}
