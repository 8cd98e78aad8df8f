//! Persistence for commit-state saga entities.
//!
//! Every saga entity row carries a [`RepoCommitState`] or [`SubCommitState`]
//! column. Writers never overwrite that column blindly: all transitions go
//! through a compare-and-swap on the expected current state, and report a
//! [`CasOutcome::Stale`] instead of mutating anything when the row has
//! already moved on.

pub mod error;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod state;
pub mod store;

pub use common::{OrgId, OrgSubId, RepoId};
pub use error::{Result, StoreError};
pub use memory::InMemoryStore;
pub use model::{
    AnalysisStatus, NewAnalysisStatus, NewOrgSub, NewRepo, OrgSub, Repo, Version,
};
pub use postgres::PostgresStore;
pub use state::{ParseCommitStateError, RepoCommitState, SubCommitState};
pub use store::{
    CasOutcome, OrgSubStore, RepoChanges, RepoStore, RepoTransition, SubChanges, SubTransition,
};
