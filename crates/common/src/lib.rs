//! Shared identifier types for the orchestration core.

pub mod types;

pub use types::{OrgId, OrgSubId, RepoId};
