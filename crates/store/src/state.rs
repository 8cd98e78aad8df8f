//! Commit-state vocabularies for the repository and subscription sagas.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A commit-state string read from storage that no saga knows about.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {saga} commit state {value:?}")]
pub struct ParseCommitStateError {
    pub saga: &'static str,
    pub value: String,
}

/// Progress of a repository through its create or delete saga.
///
/// State transitions:
/// ```text
/// CreateInit ──► CreateSentToQueue ──► CreateCreatedRepo ──► CreateDone ──► DeleteInit
///     │                 │                                                      │
///     └────────┬────────┘                                                      ▼
///              ▼                                                     DeleteSentToQueue
///      CreateRollbackInit ──► CreateRollbackDone                               │
///                                                                              ▼
///                                                                          DeleteDone
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RepoCommitState {
    #[serde(rename = "create/init")]
    CreateInit,
    #[serde(rename = "create/sent_to_queue")]
    CreateSentToQueue,
    #[serde(rename = "create/created_repo")]
    CreateCreatedRepo,
    #[serde(rename = "create/done")]
    CreateDone,
    #[serde(rename = "create/rollback/init")]
    CreateRollbackInit,
    #[serde(rename = "create/rollback/done")]
    CreateRollbackDone,
    #[serde(rename = "delete/init")]
    DeleteInit,
    #[serde(rename = "delete/sent_to_queue")]
    DeleteSentToQueue,
    #[serde(rename = "delete/done")]
    DeleteDone,
}

impl RepoCommitState {
    pub const ALL: [RepoCommitState; 9] = [
        RepoCommitState::CreateInit,
        RepoCommitState::CreateSentToQueue,
        RepoCommitState::CreateCreatedRepo,
        RepoCommitState::CreateDone,
        RepoCommitState::CreateRollbackInit,
        RepoCommitState::CreateRollbackDone,
        RepoCommitState::DeleteInit,
        RepoCommitState::DeleteSentToQueue,
        RepoCommitState::DeleteDone,
    ];

    /// Returns the state name as stored in the `commit_state` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoCommitState::CreateInit => "create/init",
            RepoCommitState::CreateSentToQueue => "create/sent_to_queue",
            RepoCommitState::CreateCreatedRepo => "create/created_repo",
            RepoCommitState::CreateDone => "create/done",
            RepoCommitState::CreateRollbackInit => "create/rollback/init",
            RepoCommitState::CreateRollbackDone => "create/rollback/done",
            RepoCommitState::DeleteInit => "delete/init",
            RepoCommitState::DeleteSentToQueue => "delete/sent_to_queue",
            RepoCommitState::DeleteDone => "delete/done",
        }
    }

    /// Returns true if no consumer may advance this state any further.
    pub fn is_terminal(&self) -> bool {
        match self {
            RepoCommitState::CreateDone
            | RepoCommitState::CreateRollbackDone
            | RepoCommitState::DeleteDone => true,
            RepoCommitState::CreateInit
            | RepoCommitState::CreateSentToQueue
            | RepoCommitState::CreateCreatedRepo
            | RepoCommitState::CreateRollbackInit
            | RepoCommitState::DeleteInit
            | RepoCommitState::DeleteSentToQueue => false,
        }
    }

    /// Returns true while the create saga has not reached a terminal state.
    pub fn is_creating(&self) -> bool {
        matches!(
            self,
            RepoCommitState::CreateInit
                | RepoCommitState::CreateSentToQueue
                | RepoCommitState::CreateCreatedRepo
                | RepoCommitState::CreateRollbackInit
        )
    }

    /// Returns true while the delete saga has not reached a terminal state.
    pub fn is_deleting(&self) -> bool {
        matches!(
            self,
            RepoCommitState::DeleteInit | RepoCommitState::DeleteSentToQueue
        )
    }

    /// Returns true if the saga graph has an edge from `self` to `next`.
    pub fn can_transition_to(&self, next: RepoCommitState) -> bool {
        use RepoCommitState::*;
        match self {
            CreateInit => matches!(
                next,
                CreateSentToQueue | CreateCreatedRepo | CreateRollbackInit
            ),
            CreateSentToQueue => matches!(next, CreateCreatedRepo | CreateRollbackInit),
            CreateCreatedRepo => matches!(next, CreateDone),
            CreateDone => matches!(next, DeleteInit),
            CreateRollbackInit => matches!(next, CreateRollbackDone),
            CreateRollbackDone => false,
            DeleteInit => matches!(next, DeleteSentToQueue | DeleteDone),
            DeleteSentToQueue => matches!(next, DeleteDone),
            DeleteDone => false,
        }
    }
}

impl std::fmt::Display for RepoCommitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RepoCommitState {
    type Err = ParseCommitStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RepoCommitState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseCommitStateError {
                saga: "repo",
                value: s.to_string(),
            })
    }
}

/// Progress of an organization subscription through its create, update or
/// delete saga.
///
/// `CreateDone` and `UpdateDone` are the two "active" states from which the
/// API may start a new update or delete saga. Compensation after a permanent
/// gateway failure returns an update or delete saga to `CreateDone`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubCommitState {
    #[serde(rename = "create/init")]
    CreateInit,
    #[serde(rename = "create/sent_to_queue")]
    CreateSentToQueue,
    #[serde(rename = "create/done")]
    CreateDone,
    #[serde(rename = "update/init")]
    UpdateInit,
    #[serde(rename = "update/sent_to_queue")]
    UpdateSentToQueue,
    #[serde(rename = "update/done")]
    UpdateDone,
    #[serde(rename = "delete/init")]
    DeleteInit,
    #[serde(rename = "delete/sent_to_queue")]
    DeleteSentToQueue,
    #[serde(rename = "delete/done")]
    DeleteDone,
}

impl SubCommitState {
    pub const ALL: [SubCommitState; 9] = [
        SubCommitState::CreateInit,
        SubCommitState::CreateSentToQueue,
        SubCommitState::CreateDone,
        SubCommitState::UpdateInit,
        SubCommitState::UpdateSentToQueue,
        SubCommitState::UpdateDone,
        SubCommitState::DeleteInit,
        SubCommitState::DeleteSentToQueue,
        SubCommitState::DeleteDone,
    ];

    /// Returns the state name as stored in the `commit_state` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubCommitState::CreateInit => "create/init",
            SubCommitState::CreateSentToQueue => "create/sent_to_queue",
            SubCommitState::CreateDone => "create/done",
            SubCommitState::UpdateInit => "update/init",
            SubCommitState::UpdateSentToQueue => "update/sent_to_queue",
            SubCommitState::UpdateDone => "update/done",
            SubCommitState::DeleteInit => "delete/init",
            SubCommitState::DeleteSentToQueue => "delete/sent_to_queue",
            SubCommitState::DeleteDone => "delete/done",
        }
    }

    /// Returns true if no consumer may advance this state any further.
    pub fn is_terminal(&self) -> bool {
        match self {
            SubCommitState::CreateDone | SubCommitState::UpdateDone | SubCommitState::DeleteDone => {
                true
            }
            SubCommitState::CreateInit
            | SubCommitState::CreateSentToQueue
            | SubCommitState::UpdateInit
            | SubCommitState::UpdateSentToQueue
            | SubCommitState::DeleteInit
            | SubCommitState::DeleteSentToQueue => false,
        }
    }

    /// Returns true if the subscription exists at the gateway and no saga is
    /// in flight.
    pub fn is_active(&self) -> bool {
        matches!(self, SubCommitState::CreateDone | SubCommitState::UpdateDone)
    }

    /// Returns true if the saga graph has an edge from `self` to `next`.
    ///
    /// Edges back to an active state from the update and delete branches are
    /// the compensation edges.
    pub fn can_transition_to(&self, next: SubCommitState) -> bool {
        use SubCommitState::*;
        match self {
            CreateInit => matches!(next, CreateSentToQueue | CreateDone),
            CreateSentToQueue => matches!(next, CreateDone),
            CreateDone | UpdateDone => matches!(next, UpdateInit | DeleteInit),
            UpdateInit => matches!(next, UpdateSentToQueue | UpdateDone | CreateDone),
            UpdateSentToQueue => matches!(next, UpdateDone | CreateDone),
            DeleteInit => matches!(
                next,
                DeleteSentToQueue | DeleteDone | CreateDone | UpdateDone
            ),
            DeleteSentToQueue => matches!(next, DeleteDone | CreateDone | UpdateDone),
            DeleteDone => false,
        }
    }
}

impl std::fmt::Display for SubCommitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SubCommitState {
    type Err = ParseCommitStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SubCommitState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseCommitStateError {
                saga: "subscription",
                value: s.to_string(),
            })
    }
}
