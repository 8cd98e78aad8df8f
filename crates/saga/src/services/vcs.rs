//! VCS provider client trait and in-memory implementation.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors returned by the VCS provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("Repository {0} not found")]
    NotFound(String),

    /// The installation lacks admin rights on the repository.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Repository {0} is archived")]
    Archived(String),

    #[error("Rate limited by provider")]
    RateLimited,

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// Returns true if retrying the same call cannot succeed.
    pub fn is_permanent(&self) -> bool {
        match self {
            ProviderError::NotFound(_)
            | ProviderError::Forbidden(_)
            | ProviderError::Archived(_) => true,
            ProviderError::RateLimited | ProviderError::Unavailable(_) => false,
        }
    }
}

/// Repository metadata as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRepo {
    pub full_name: String,
    pub private: bool,
    pub archived: bool,
    pub default_branch: String,
    /// Head of the default branch; `None` for an empty repository.
    pub head_commit_sha: Option<String>,
}

/// A webhook registered on a provider repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderHook {
    pub id: i64,
    pub url: String,
}

/// Operations the repository saga needs from the VCS provider.
#[async_trait]
pub trait VcsProvider: Send + Sync {
    async fn get_repo_by_name(&self, full_name: &str) -> Result<ProviderRepo, ProviderError>;

    async fn list_repo_hooks(&self, full_name: &str) -> Result<Vec<ProviderHook>, ProviderError>;

    async fn create_repo_hook(
        &self,
        full_name: &str,
        url: &str,
    ) -> Result<ProviderHook, ProviderError>;

    /// Deletes a webhook. Deleting a hook that does not exist fails with
    /// [`ProviderError::NotFound`].
    async fn delete_repo_hook(&self, full_name: &str, hook_id: i64) -> Result<(), ProviderError>;

    /// Grants `login` access to the repository. Adding an existing
    /// collaborator succeeds.
    async fn add_collaborator(&self, full_name: &str, login: &str) -> Result<(), ProviderError>;
}

#[derive(Debug, Default)]
struct InMemoryVcsState {
    repos: HashMap<String, ProviderRepo>,
    hooks: HashMap<String, Vec<ProviderHook>>,
    collaborators: HashMap<String, BTreeSet<String>>,
    next_hook_id: i64,
    create_hook_calls: usize,
    scripted_failures: VecDeque<ProviderError>,
}

impl InMemoryVcsState {
    fn next_failure(&mut self) -> Result<(), ProviderError> {
        match self.scripted_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn repo(&self, full_name: &str) -> Result<&ProviderRepo, ProviderError> {
        self.repos
            .get(full_name)
            .ok_or_else(|| ProviderError::NotFound(full_name.to_string()))
    }
}

/// In-memory VCS provider for testing and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryVcsProvider {
    state: Arc<RwLock<InMemoryVcsState>>,
}

impl InMemoryVcsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a repository visible to the provider API.
    pub async fn add_repo(&self, repo: ProviderRepo) {
        let mut state = self.state.write().await;
        state.repos.insert(repo.full_name.clone(), repo);
    }

    /// Makes the next provider call fail with `err`. Calls queue up.
    pub async fn fail_next_call(&self, err: ProviderError) {
        self.state.write().await.scripted_failures.push_back(err);
    }

    pub async fn hooks(&self, full_name: &str) -> Vec<ProviderHook> {
        self.state
            .read()
            .await
            .hooks
            .get(full_name)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn collaborators(&self, full_name: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .collaborators
            .get(full_name)
            .map(|logins| logins.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns how many webhooks were ever created.
    pub async fn create_hook_calls(&self) -> usize {
        self.state.read().await.create_hook_calls
    }
}

#[async_trait]
impl VcsProvider for InMemoryVcsProvider {
    async fn get_repo_by_name(&self, full_name: &str) -> Result<ProviderRepo, ProviderError> {
        let mut state = self.state.write().await;
        state.next_failure()?;
        state.repo(full_name).cloned()
    }

    async fn list_repo_hooks(&self, full_name: &str) -> Result<Vec<ProviderHook>, ProviderError> {
        let mut state = self.state.write().await;
        state.next_failure()?;
        state.repo(full_name)?;
        Ok(state.hooks.get(full_name).cloned().unwrap_or_default())
    }

    async fn create_repo_hook(
        &self,
        full_name: &str,
        url: &str,
    ) -> Result<ProviderHook, ProviderError> {
        let mut state = self.state.write().await;
        state.next_failure()?;
        state.repo(full_name)?;

        state.next_hook_id += 1;
        state.create_hook_calls += 1;
        let hook = ProviderHook {
            id: state.next_hook_id,
            url: url.to_string(),
        };
        state
            .hooks
            .entry(full_name.to_string())
            .or_default()
            .push(hook.clone());
        Ok(hook)
    }

    async fn delete_repo_hook(&self, full_name: &str, hook_id: i64) -> Result<(), ProviderError> {
        let mut state = self.state.write().await;
        state.next_failure()?;
        let hooks = state.hooks.entry(full_name.to_string()).or_default();
        let before = hooks.len();
        hooks.retain(|hook| hook.id != hook_id);
        if hooks.len() == before {
            return Err(ProviderError::NotFound(format!("{full_name} hook {hook_id}")));
        }
        Ok(())
    }

    async fn add_collaborator(&self, full_name: &str, login: &str) -> Result<(), ProviderError> {
        let mut state = self.state.write().await;
        state.next_failure()?;
        state.repo(full_name)?;
        state
            .collaborators
            .entry(full_name.to_string())
            .or_default()
            .insert(login.to_string());
        Ok(())
    }
}
