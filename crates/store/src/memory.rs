use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    AnalysisStatus, CasOutcome, NewAnalysisStatus, NewOrgSub, NewRepo, OrgId, OrgSub, OrgSubId,
    OrgSubStore, Repo, RepoCommitState, RepoId, RepoStore, RepoTransition, Result, SubCommitState,
    SubTransition, Version,
};

#[derive(Default)]
struct Tables {
    repos: BTreeMap<RepoId, Repo>,
    analysis_statuses: BTreeMap<RepoId, AnalysisStatus>,
    org_subs: BTreeMap<OrgSubId, OrgSub>,
    next_repo_id: i64,
    next_org_sub_id: i64,
}

/// In-memory store implementation for testing and single-process runs.
///
/// Conditional updates behave exactly like the PostgreSQL implementation:
/// a write whose expected state does not match touches nothing and returns
/// [`CasOutcome::Stale`].
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of repo rows, soft-deleted ones included.
    pub async fn repo_count(&self) -> usize {
        self.tables.read().await.repos.len()
    }

    /// Returns the number of subscription rows, soft-deleted ones included.
    pub async fn org_sub_count(&self) -> usize {
        self.tables.read().await.org_subs.len()
    }

    /// Returns the number of analysis-status rows.
    pub async fn analysis_status_count(&self) -> usize {
        self.tables.read().await.analysis_statuses.len()
    }

    /// Overwrites a repo's commit state, bypassing the saga graph.
    ///
    /// Tests use this to simulate a crash that left the row mid-saga.
    pub async fn force_repo_state(&self, id: RepoId, state: RepoCommitState) {
        if let Some(repo) = self.tables.write().await.repos.get_mut(&id) {
            repo.commit_state = state;
        }
    }

    /// Overwrites a subscription's commit state, bypassing the saga graph.
    pub async fn force_org_sub_state(&self, id: OrgSubId, state: SubCommitState) {
        if let Some(sub) = self.tables.write().await.org_subs.get_mut(&id) {
            sub.commit_state = state;
        }
    }
}

#[async_trait]
impl RepoStore for InMemoryStore {
    async fn create_repo(&self, new: NewRepo) -> Result<Repo> {
        let mut tables = self.tables.write().await;
        tables.next_repo_id += 1;
        let repo = Repo {
            id: RepoId::new(tables.next_repo_id),
            full_name: new.full_name,
            hook_secret: new.hook_secret,
            commit_state: RepoCommitState::CreateInit,
            provider_hook_id: None,
            create_fail_reason: None,
            created_at: Utc::now(),
            deleted_at: None,
        };
        tables.repos.insert(repo.id, repo.clone());
        Ok(repo)
    }

    async fn get_repo(&self, id: RepoId) -> Result<Option<Repo>> {
        Ok(self.tables.read().await.repos.get(&id).cloned())
    }

    async fn find_live_repo(&self, full_name: &str) -> Result<Option<Repo>> {
        let tables = self.tables.read().await;
        Ok(tables
            .repos
            .values()
            .find(|r| r.full_name == full_name && r.deleted_at.is_none())
            .cloned())
    }

    async fn transition_repo(
        &self,
        id: RepoId,
        transition: RepoTransition,
    ) -> Result<CasOutcome<RepoCommitState>> {
        transition.check()?;
        let mut tables = self.tables.write().await;
        let Some(repo) = tables.repos.get_mut(&id) else {
            return Ok(CasOutcome::Stale { current: None });
        };
        if repo.commit_state != transition.from {
            return Ok(CasOutcome::Stale {
                current: Some(repo.commit_state),
            });
        }

        repo.commit_state = transition.to;
        let changes = transition.changes;
        if let Some(hook_id) = changes.provider_hook_id {
            repo.provider_hook_id = Some(hook_id);
        }
        if let Some(reason) = changes.create_fail_reason {
            repo.create_fail_reason = Some(reason);
        }
        if let Some(deleted_at) = changes.deleted_at {
            repo.deleted_at = Some(deleted_at);
        }
        Ok(CasOutcome::Applied)
    }

    async fn get_or_create_analysis_status(
        &self,
        repo_id: RepoId,
        status: NewAnalysisStatus,
    ) -> Result<(AnalysisStatus, bool)> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.analysis_statuses.get(&repo_id) {
            return Ok((existing.clone(), false));
        }
        let created = AnalysisStatus {
            repo_id,
            default_branch: status.default_branch,
            head_commit_sha: status.head_commit_sha,
            last_analyzed_commit_sha: None,
            created_at: Utc::now(),
        };
        tables.analysis_statuses.insert(repo_id, created.clone());
        Ok((created, true))
    }
}

#[async_trait]
impl OrgSubStore for InMemoryStore {
    async fn create_org_sub(&self, new: NewOrgSub) -> Result<OrgSub> {
        let mut tables = self.tables.write().await;
        tables.next_org_sub_id += 1;
        let sub = OrgSub {
            id: OrgSubId::new(tables.next_org_sub_id),
            org_id: new.org_id,
            billing_email: new.billing_email,
            seats_count: new.seats_count,
            card_token: new.card_token,
            payment_gateway_customer_id: None,
            payment_gateway_subscription_id: None,
            commit_state: SubCommitState::CreateInit,
            version: Version::initial(),
            created_at: Utc::now(),
            deleted_at: None,
        };
        tables.org_subs.insert(sub.id, sub.clone());
        Ok(sub)
    }

    async fn get_org_sub(&self, id: OrgSubId) -> Result<Option<OrgSub>> {
        Ok(self.tables.read().await.org_subs.get(&id).cloned())
    }

    async fn find_live_org_sub(&self, org_id: OrgId) -> Result<Option<OrgSub>> {
        let tables = self.tables.read().await;
        Ok(tables
            .org_subs
            .values()
            .find(|s| s.org_id == org_id && s.deleted_at.is_none())
            .cloned())
    }

    async fn transition_org_sub(
        &self,
        id: OrgSubId,
        transition: SubTransition,
    ) -> Result<CasOutcome<SubCommitState>> {
        transition.check()?;
        let mut tables = self.tables.write().await;
        let Some(sub) = tables.org_subs.get_mut(&id) else {
            return Ok(CasOutcome::Stale { current: None });
        };
        let version_matches = transition
            .expected_version
            .is_none_or(|expected| sub.version == expected);
        if sub.commit_state != transition.from || !version_matches {
            return Ok(CasOutcome::Stale {
                current: Some(sub.commit_state),
            });
        }

        sub.commit_state = transition.to;
        if transition.bump_version {
            sub.version = sub.version.next();
        }
        let changes = transition.changes;
        if let Some(customer_id) = changes.payment_gateway_customer_id {
            sub.payment_gateway_customer_id = Some(customer_id);
        }
        if let Some(subscription_id) = changes.payment_gateway_subscription_id {
            sub.payment_gateway_subscription_id = Some(subscription_id);
        }
        if let Some(seats) = changes.seats_count {
            sub.seats_count = seats;
        }
        if let Some(card_token) = changes.card_token {
            sub.card_token = card_token;
        }
        if let Some(deleted_at) = changes.deleted_at {
            sub.deleted_at = Some(deleted_at);
        }
        Ok(CasOutcome::Applied)
    }

    async fn delete_org_sub(
        &self,
        id: OrgSubId,
        expected: SubCommitState,
    ) -> Result<CasOutcome<SubCommitState>> {
        let mut tables = self.tables.write().await;
        match tables.org_subs.get(&id) {
            None => Ok(CasOutcome::Stale { current: None }),
            Some(sub) if sub.commit_state != expected => Ok(CasOutcome::Stale {
                current: Some(sub.commit_state),
            }),
            Some(_) => {
                tables.org_subs.remove(&id);
                Ok(CasOutcome::Applied)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RepoChanges, StoreError, SubChanges};

    fn new_repo(name: &str) -> NewRepo {
        NewRepo {
            full_name: name.to_string(),
            hook_secret: "secret".to_string(),
        }
    }

    fn new_sub(org: i64) -> NewOrgSub {
        NewOrgSub {
            org_id: OrgId::new(org),
            billing_email: "billing@example.com".to_string(),
            seats_count: 3,
            card_token: "tok_visa".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_repo_starts_in_init() {
        let store = InMemoryStore::new();
        let repo = store.create_repo(new_repo("acme/api")).await.unwrap();
        assert_eq!(repo.commit_state, RepoCommitState::CreateInit);
        assert_eq!(store.get_repo(repo.id).await.unwrap(), Some(repo));
    }

    #[tokio::test]
    async fn test_transition_applies_with_changes() {
        let store = InMemoryStore::new();
        let repo = store.create_repo(new_repo("acme/api")).await.unwrap();

        let outcome = store
            .transition_repo(
                repo.id,
                RepoTransition::new(
                    RepoCommitState::CreateInit,
                    RepoCommitState::CreateCreatedRepo,
                )
                .with_changes(RepoChanges {
                    provider_hook_id: Some(99),
                    ..RepoChanges::default()
                }),
            )
            .await
            .unwrap();
        assert_eq!(outcome, CasOutcome::Applied);

        let reloaded = store.get_repo(repo.id).await.unwrap().unwrap();
        assert_eq!(reloaded.commit_state, RepoCommitState::CreateCreatedRepo);
        assert_eq!(reloaded.provider_hook_id, Some(99));
    }

    #[tokio::test]
    async fn test_stale_transition_reports_current_state_and_writes_nothing() {
        let store = InMemoryStore::new();
        let first = store.create_repo(new_repo("acme/api")).await.unwrap();
        let second = store.create_repo(new_repo("acme/web")).await.unwrap();

        let outcome = store
            .transition_repo(
                first.id,
                RepoTransition::new(
                    RepoCommitState::CreateCreatedRepo,
                    RepoCommitState::CreateDone,
                ),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CasOutcome::Stale {
                current: Some(RepoCommitState::CreateInit)
            }
        );
        assert_eq!(store.get_repo(first.id).await.unwrap(), Some(first));
        assert_eq!(store.get_repo(second.id).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_transition_of_missing_row_is_distinct() {
        let store = InMemoryStore::new();
        let outcome = store
            .transition_repo(
                RepoId::new(404),
                RepoTransition::new(
                    RepoCommitState::CreateInit,
                    RepoCommitState::CreateSentToQueue,
                ),
            )
            .await
            .unwrap();
        assert_eq!(outcome, CasOutcome::Stale { current: None });
    }

    #[tokio::test]
    async fn test_off_graph_transition_is_rejected() {
        let store = InMemoryStore::new();
        let repo = store.create_repo(new_repo("acme/api")).await.unwrap();

        let err = store
            .transition_repo(
                repo.id,
                RepoTransition::new(RepoCommitState::CreateInit, RepoCommitState::CreateDone),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        let reloaded = store.get_repo(repo.id).await.unwrap().unwrap();
        assert_eq!(reloaded.commit_state, RepoCommitState::CreateInit);

        let sub = store.create_org_sub(new_sub(1)).await.unwrap();
        let err = store
            .transition_org_sub(
                sub.id,
                SubTransition::new(SubCommitState::CreateInit, SubCommitState::DeleteDone),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        // Recording fields without moving the state is always allowed.
        let outcome = store
            .transition_org_sub(
                sub.id,
                SubTransition::new(SubCommitState::CreateInit, SubCommitState::CreateInit)
                    .with_changes(SubChanges {
                        payment_gateway_customer_id: Some("cus_1".to_string()),
                        ..SubChanges::default()
                    }),
            )
            .await
            .unwrap();
        assert_eq!(outcome, CasOutcome::Applied);
    }

    #[tokio::test]
    async fn test_find_live_repo_skips_soft_deleted() {
        let store = InMemoryStore::new();
        let repo = store.create_repo(new_repo("acme/api")).await.unwrap();
        store
            .transition_repo(
                repo.id,
                RepoTransition::new(
                    RepoCommitState::CreateInit,
                    RepoCommitState::CreateRollbackInit,
                )
                .with_changes(RepoChanges {
                    deleted_at: Some(Utc::now()),
                    ..RepoChanges::default()
                }),
            )
            .await
            .unwrap();
        assert!(store.find_live_repo("acme/api").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_analysis_status_is_created_once() {
        let store = InMemoryStore::new();
        let repo = store.create_repo(new_repo("acme/api")).await.unwrap();
        let status = NewAnalysisStatus {
            default_branch: "main".to_string(),
            head_commit_sha: Some("abc".to_string()),
        };

        let (first, created) = store
            .get_or_create_analysis_status(repo.id, status.clone())
            .await
            .unwrap();
        assert!(created);
        let (second, created) = store
            .get_or_create_analysis_status(repo.id, status)
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first, second);
        assert_eq!(store.analysis_status_count().await, 1);
    }

    #[tokio::test]
    async fn test_sub_transition_checks_version_and_bumps() {
        let store = InMemoryStore::new();
        let sub = store.create_org_sub(new_sub(1)).await.unwrap();
        store
            .force_org_sub_state(sub.id, SubCommitState::UpdateSentToQueue)
            .await;

        let stale = store
            .transition_org_sub(
                sub.id,
                SubTransition::new(SubCommitState::UpdateSentToQueue, SubCommitState::UpdateDone)
                    .expect_version(Version::new(7))
                    .bump_version(),
            )
            .await
            .unwrap();
        assert_eq!(
            stale,
            CasOutcome::Stale {
                current: Some(SubCommitState::UpdateSentToQueue)
            }
        );

        let applied = store
            .transition_org_sub(
                sub.id,
                SubTransition::new(SubCommitState::UpdateSentToQueue, SubCommitState::UpdateDone)
                    .expect_version(Version::initial())
                    .bump_version()
                    .with_changes(SubChanges {
                        seats_count: Some(10),
                        ..SubChanges::default()
                    }),
            )
            .await
            .unwrap();
        assert!(applied.is_applied());

        let reloaded = store.get_org_sub(sub.id).await.unwrap().unwrap();
        assert_eq!(reloaded.version, Version::new(1));
        assert_eq!(reloaded.seats_count, 10);
        assert_eq!(reloaded.commit_state, SubCommitState::UpdateDone);
    }

    #[tokio::test]
    async fn test_delete_org_sub_requires_expected_state() {
        let store = InMemoryStore::new();
        let sub = store.create_org_sub(new_sub(1)).await.unwrap();

        let stale = store
            .delete_org_sub(sub.id, SubCommitState::CreateDone)
            .await
            .unwrap();
        assert!(!stale.is_applied());
        assert_eq!(store.org_sub_count().await, 1);

        let applied = store
            .delete_org_sub(sub.id, SubCommitState::CreateInit)
            .await
            .unwrap();
        assert!(applied.is_applied());
        assert_eq!(store.org_sub_count().await, 0);
    }
}
