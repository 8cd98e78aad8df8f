//! Repository lifecycle saga.
//!
//! Connecting a repository takes three externally visible steps: a webhook on
//! the provider side, reviewer access for private repositories, and the first
//! analysis. Each step is committed as a commit-state transition only after
//! its side effect succeeded, so a redelivered message resumes where the last
//! run stopped.
//!
//! ```text
//! create/init ─┬─► create/created_repo ──► create/done ──► delete/init ──► delete/done
//! create/sent_to_queue ─┘                                  delete/sent_to_queue ─┘
//!      │ permanent provider error
//!      ▼
//! create/rollback/init ──► create/rollback/done
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dispatch::Handler;
use queue::{ConsumeError, ErrorClass, SubQueueHandle};
use store::{
    CasOutcome, NewAnalysisStatus, Repo, RepoChanges, RepoCommitState, RepoId, RepoStore,
    RepoTransition,
};

use crate::error::{Result, SagaError};
use crate::messages::{CreateRepo, DeleteRepo, LaunchAnalysis};
use crate::services::{ProviderError, VcsProvider};

/// Upper bound on transitions in one run; the graph's longest path is three.
const MAX_STEPS: usize = 8;

/// Settings of the repository saga.
#[derive(Debug, Clone)]
pub struct RepoSagaConfig {
    /// Base URL the provider delivers webhook events to.
    pub hook_base_url: String,
    /// Account given access to private repositories.
    pub reviewer_login: String,
}

impl Default for RepoSagaConfig {
    fn default() -> Self {
        Self {
            hook_base_url: "http://localhost:3000/hooks".to_string(),
            reviewer_login: "analysis-reviewer".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Branch {
    Create,
    Delete,
}

impl Branch {
    fn as_str(&self) -> &'static str {
        match self {
            Branch::Create => "create",
            Branch::Delete => "delete",
        }
    }

    fn owns(&self, state: RepoCommitState) -> bool {
        match self {
            Branch::Create => state.is_creating(),
            Branch::Delete => state.is_deleting(),
        }
    }
}

/// Drives repositories through their create and delete sagas.
pub struct RepoSaga {
    store: Arc<dyn RepoStore>,
    vcs: Arc<dyn VcsProvider>,
    analyses: SubQueueHandle,
    config: RepoSagaConfig,
}

impl RepoSaga {
    /// Creates a saga. `analyses` is the producer for follow-up analysis
    /// launches.
    pub fn new(
        store: Arc<dyn RepoStore>,
        vcs: Arc<dyn VcsProvider>,
        analyses: SubQueueHandle,
        config: RepoSagaConfig,
    ) -> Self {
        Self {
            store,
            vcs,
            analyses,
            config,
        }
    }

    /// Returns the webhook URL registered for `repo`.
    pub fn hook_url(&self, repo: &Repo) -> String {
        format!(
            "{}/{}/{}",
            self.config.hook_base_url.trim_end_matches('/'),
            repo.full_name,
            repo.hook_secret
        )
    }

    /// Runs the create saga of `id` until it reaches a terminal state.
    pub async fn run_create(&self, id: RepoId) -> Result<()> {
        self.drive(id, Branch::Create).await
    }

    /// Runs the delete saga of `id` until it reaches a terminal state.
    pub async fn run_delete(&self, id: RepoId) -> Result<()> {
        self.drive(id, Branch::Delete).await
    }

    #[tracing::instrument(skip_all, fields(repo_id = %id, branch = branch.as_str()))]
    async fn drive(&self, id: RepoId, branch: Branch) -> Result<()> {
        for _ in 0..MAX_STEPS {
            let Some(repo) = self.store.get_repo(id).await? else {
                tracing::warn!("repo not found, nothing to do");
                return Ok(());
            };
            if !branch.owns(repo.commit_state) {
                tracing::debug!(state = %repo.commit_state, "repo saga settled");
                return Ok(());
            }

            let transition = self.step(&repo).await?;
            self.apply(&repo, transition).await?;
        }

        Err(SagaError::NoProgress {
            entity: "repo",
            id: id.as_i64(),
            steps: MAX_STEPS,
        })
    }

    async fn step(&self, repo: &Repo) -> Result<RepoTransition> {
        match repo.commit_state {
            RepoCommitState::CreateInit | RepoCommitState::CreateSentToQueue => {
                self.connect_provider(repo).await
            }
            RepoCommitState::CreateCreatedRepo => self.init_analysis(repo).await,
            RepoCommitState::CreateRollbackInit => Ok(RepoTransition::new(
                RepoCommitState::CreateRollbackInit,
                RepoCommitState::CreateRollbackDone,
            )
            .with_changes(RepoChanges {
                deleted_at: Some(Utc::now()),
                ..RepoChanges::default()
            })),
            RepoCommitState::DeleteInit | RepoCommitState::DeleteSentToQueue => {
                self.disconnect_provider(repo).await
            }
            RepoCommitState::CreateDone
            | RepoCommitState::CreateRollbackDone
            | RepoCommitState::DeleteDone => Err(SagaError::UnexpectedState {
                entity: "repo",
                id: repo.id.as_i64(),
                state: repo.commit_state.to_string(),
            }),
        }
    }

    /// Writes `transition`. A missed write means another run already moved
    /// the row; the caller reloads and continues from the new state.
    async fn apply(&self, repo: &Repo, transition: RepoTransition) -> Result<()> {
        let (from, to) = (transition.from, transition.to);
        match self.store.transition_repo(repo.id, transition).await? {
            CasOutcome::Applied => {
                metrics::counter!("saga_transitions_total", "saga" => "repo", "to" => to.as_str())
                    .increment(1);
                tracing::info!(%from, %to, "repo transitioned");
            }
            CasOutcome::Stale { current } => {
                metrics::counter!("saga_stale_transitions_total", "saga" => "repo").increment(1);
                tracing::warn!(
                    %from,
                    %to,
                    current = ?current.map(|s| s.as_str()),
                    "repo moved concurrently, reloading"
                );
            }
        }
        Ok(())
    }

    async fn connect_provider(&self, repo: &Repo) -> Result<RepoTransition> {
        match self.setup_hook(repo).await {
            Ok(hook_id) => Ok(
                RepoTransition::new(repo.commit_state, RepoCommitState::CreateCreatedRepo)
                    .with_changes(RepoChanges {
                        provider_hook_id: Some(hook_id),
                        ..RepoChanges::default()
                    }),
            ),
            Err(err) if err.class() == ErrorClass::Permanent => {
                tracing::warn!(error = %err, "provider refused repository, rolling back");
                Ok(
                    RepoTransition::new(repo.commit_state, RepoCommitState::CreateRollbackInit)
                        .with_changes(RepoChanges {
                            create_fail_reason: Some(err.to_string()),
                            ..RepoChanges::default()
                        }),
                )
            }
            Err(err) => Err(err),
        }
    }

    /// Ensures the webhook exists and the reviewer has access. Returns the
    /// provider's hook id.
    async fn setup_hook(&self, repo: &Repo) -> Result<i64> {
        let provider_repo = self.vcs.get_repo_by_name(&repo.full_name).await?;
        if provider_repo.archived {
            return Err(ProviderError::Archived(repo.full_name.clone()).into());
        }

        let url = self.hook_url(repo);
        let existing = self
            .vcs
            .list_repo_hooks(&repo.full_name)
            .await?
            .into_iter()
            .find(|hook| hook.url == url);
        let hook = match existing {
            Some(hook) => {
                tracing::debug!(hook_id = hook.id, "reusing existing webhook");
                hook
            }
            None => self.vcs.create_repo_hook(&repo.full_name, &url).await?,
        };

        if provider_repo.private {
            self.vcs
                .add_collaborator(&repo.full_name, &self.config.reviewer_login)
                .await?;
        }
        Ok(hook.id)
    }

    async fn init_analysis(&self, repo: &Repo) -> Result<RepoTransition> {
        let provider_repo = self.vcs.get_repo_by_name(&repo.full_name).await?;
        let (status, created) = self
            .store
            .get_or_create_analysis_status(
                repo.id,
                NewAnalysisStatus {
                    default_branch: provider_repo.default_branch,
                    head_commit_sha: provider_repo.head_commit_sha,
                },
            )
            .await?;
        tracing::debug!(created, "analysis status ready");

        if let Some(commit_sha) = status.pending_commit() {
            self.analyses
                .put(&LaunchAnalysis {
                    repo_id: repo.id,
                    full_name: repo.full_name.clone(),
                    default_branch: status.default_branch.clone(),
                    commit_sha: commit_sha.to_string(),
                })
                .await?;
            tracing::info!(commit_sha, "analysis launch enqueued");
        }

        Ok(RepoTransition::new(
            RepoCommitState::CreateCreatedRepo,
            RepoCommitState::CreateDone,
        ))
    }

    async fn disconnect_provider(&self, repo: &Repo) -> Result<RepoTransition> {
        if let Some(hook_id) = repo.provider_hook_id {
            match self.vcs.delete_repo_hook(&repo.full_name, hook_id).await {
                Ok(()) => tracing::info!(hook_id, "webhook deleted"),
                // The hook or the whole repository is gone or out of reach;
                // there is nothing left to clean up on the provider side.
                Err(err) if err.is_permanent() => {
                    tracing::warn!(hook_id, error = %err, "webhook not deletable, skipping");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(
            RepoTransition::new(repo.commit_state, RepoCommitState::DeleteDone).with_changes(
                RepoChanges {
                    deleted_at: Some(Utc::now()),
                    ..RepoChanges::default()
                },
            ),
        )
    }
}

#[async_trait]
impl Handler<CreateRepo> for RepoSaga {
    async fn handle(&self, message: &CreateRepo) -> std::result::Result<(), ConsumeError> {
        Ok(self.run_create(message.repo_id).await?)
    }
}

#[async_trait]
impl Handler<DeleteRepo> for RepoSaga {
    async fn handle(&self, message: &DeleteRepo) -> std::result::Result<(), ConsumeError> {
        Ok(self.run_delete(message.repo_id).await?)
    }
}
