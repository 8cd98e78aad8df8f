//! Sub-queue ids and the messages that travel on them.

use common::{OrgSubId, RepoId};
use queue::Message;
use serde::{Deserialize, Serialize};
use store::{SubCommitState, Version};

pub const REPOS_CREATE: &str = "repos/create";
pub const REPOS_DELETE: &str = "repos/delete";
pub const SUBS_CREATE: &str = "subs/create";
pub const SUBS_UPDATE: &str = "subs/update";
pub const SUBS_DELETE: &str = "subs/delete";
/// Lives on the analysis queue; consumed by the analysis workers.
pub const ANALYSES_LAUNCH: &str = "analyses/launch";

/// Sub-queues carried by the primary queue.
pub const PRIMARY_SUBQUEUES: [&str; 5] = [
    REPOS_CREATE,
    REPOS_DELETE,
    SUBS_CREATE,
    SUBS_UPDATE,
    SUBS_DELETE,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRepo {
    pub repo_id: RepoId,
}

impl Message for CreateRepo {
    fn lock_id(&self) -> String {
        format!("{REPOS_CREATE}/{}", self.repo_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRepo {
    pub repo_id: RepoId,
}

impl Message for DeleteRepo {
    fn lock_id(&self) -> String {
        format!("{REPOS_DELETE}/{}", self.repo_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSub {
    pub sub_id: OrgSubId,
}

impl Message for CreateSub {
    fn lock_id(&self) -> String {
        format!("{SUBS_CREATE}/{}", self.sub_id)
    }
}

/// Requested change of a subscription.
///
/// `expected_version` is the row version the API observed when it accepted
/// the request; the saga only applies the change at that version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSub {
    pub sub_id: OrgSubId,
    pub seats_count: i32,
    pub card_token: String,
    pub expected_version: Version,
}

impl Message for UpdateSub {
    fn lock_id(&self) -> String {
        format!("{SUBS_UPDATE}/{}", self.sub_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSub {
    pub sub_id: OrgSubId,
    /// Active state the subscription left when the delete began. A failed
    /// delete puts it back there; `create/done` when unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_to: Option<SubCommitState>,
}

impl Message for DeleteSub {
    fn lock_id(&self) -> String {
        format!("{SUBS_DELETE}/{}", self.sub_id)
    }
}

/// Asks the analysis workers to analyze `commit_sha` of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchAnalysis {
    pub repo_id: RepoId,
    pub full_name: String,
    pub default_branch: String,
    pub commit_sha: String,
}

impl Message for LaunchAnalysis {
    fn lock_id(&self) -> String {
        format!("{ANALYSES_LAUNCH}/{}/{}", self.repo_id, self.commit_sha)
    }
}
