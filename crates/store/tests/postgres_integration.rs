//! PostgreSQL integration tests
//!
//! These tests start a PostgreSQL container and are ignored by default.
//! Run with:
//!
//! ```bash
//! cargo test -p store --test postgres_integration -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use chrono::Utc;
use sqlx::PgPool;
use store::{
    CasOutcome, NewAnalysisStatus, NewOrgSub, NewRepo, OrgId, OrgSubStore, PostgresStore,
    RepoChanges, RepoCommitState, RepoStore, RepoTransition, SubChanges, SubCommitState,
    SubTransition, Version,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_repos_and_subs.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_store() -> PostgresStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE repo_analysis_statuses, repos, org_subs RESTART IDENTITY")
        .execute(&pool)
        .await
        .unwrap();

    PostgresStore::new(pool)
}

fn new_repo(name: &str) -> NewRepo {
    NewRepo {
        full_name: name.to_string(),
        hook_secret: "s3cret".to_string(),
    }
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_repo_transition_applies_once() {
    let store = get_test_store().await;
    let repo = store.create_repo(new_repo("acme/api")).await.unwrap();
    assert_eq!(repo.commit_state, RepoCommitState::CreateInit);

    let transition = RepoTransition::new(
        RepoCommitState::CreateInit,
        RepoCommitState::CreateCreatedRepo,
    )
    .with_changes(RepoChanges {
        provider_hook_id: Some(1234),
        ..RepoChanges::default()
    });

    let first = store
        .transition_repo(repo.id, transition.clone())
        .await
        .unwrap();
    assert_eq!(first, CasOutcome::Applied);

    let replay = store.transition_repo(repo.id, transition).await.unwrap();
    assert_eq!(
        replay,
        CasOutcome::Stale {
            current: Some(RepoCommitState::CreateCreatedRepo)
        }
    );

    let reloaded = store.get_repo(repo.id).await.unwrap().unwrap();
    assert_eq!(reloaded.provider_hook_id, Some(1234));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_stale_repo_transition_leaves_other_rows_alone() {
    let store = get_test_store().await;
    let target = store.create_repo(new_repo("acme/api")).await.unwrap();
    let bystander = store.create_repo(new_repo("acme/web")).await.unwrap();

    let outcome = store
        .transition_repo(
            target.id,
            RepoTransition::new(RepoCommitState::CreateCreatedRepo, RepoCommitState::CreateDone),
        )
        .await
        .unwrap();
    assert!(!outcome.is_applied());

    assert_eq!(store.get_repo(target.id).await.unwrap(), Some(target));
    assert_eq!(store.get_repo(bystander.id).await.unwrap(), Some(bystander));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_soft_deleted_repo_is_not_live() {
    let store = get_test_store().await;
    let repo = store.create_repo(new_repo("acme/api")).await.unwrap();
    store
        .transition_repo(
            repo.id,
            RepoTransition::new(
                RepoCommitState::CreateInit,
                RepoCommitState::CreateRollbackInit,
            ),
        )
        .await
        .unwrap();
    store
        .transition_repo(
            repo.id,
            RepoTransition::new(
                RepoCommitState::CreateRollbackInit,
                RepoCommitState::CreateRollbackDone,
            )
            .with_changes(RepoChanges {
                deleted_at: Some(Utc::now()),
                ..RepoChanges::default()
            }),
        )
        .await
        .unwrap();

    assert!(store.find_live_repo("acme/api").await.unwrap().is_none());
    // The live-name index allows reconnecting the same repository.
    store.create_repo(new_repo("acme/api")).await.unwrap();
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_analysis_status_get_or_create() {
    let store = get_test_store().await;
    let repo = store.create_repo(new_repo("acme/api")).await.unwrap();
    let status = NewAnalysisStatus {
        default_branch: "main".to_string(),
        head_commit_sha: Some("deadbeef".to_string()),
    };

    let (first, created) = store
        .get_or_create_analysis_status(repo.id, status.clone())
        .await
        .unwrap();
    assert!(created);
    assert_eq!(first.pending_commit(), Some("deadbeef"));

    let (second, created) = store
        .get_or_create_analysis_status(repo.id, status)
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(second.repo_id, first.repo_id);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_org_sub_version_guard() {
    let store = get_test_store().await;
    let sub = store
        .create_org_sub(NewOrgSub {
            org_id: OrgId::new(5),
            billing_email: "billing@example.com".to_string(),
            seats_count: 2,
            card_token: "tok_visa".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(sub.version, Version::initial());

    store
        .transition_org_sub(
            sub.id,
            SubTransition::new(SubCommitState::CreateInit, SubCommitState::CreateDone),
        )
        .await
        .unwrap();
    store
        .transition_org_sub(
            sub.id,
            SubTransition::new(SubCommitState::CreateDone, SubCommitState::UpdateInit),
        )
        .await
        .unwrap();

    let wrong_version = store
        .transition_org_sub(
            sub.id,
            SubTransition::new(SubCommitState::UpdateInit, SubCommitState::UpdateDone)
                .expect_version(Version::new(3))
                .bump_version(),
        )
        .await
        .unwrap();
    assert_eq!(
        wrong_version,
        CasOutcome::Stale {
            current: Some(SubCommitState::UpdateInit)
        }
    );

    let applied = store
        .transition_org_sub(
            sub.id,
            SubTransition::new(SubCommitState::UpdateInit, SubCommitState::UpdateDone)
                .expect_version(Version::initial())
                .bump_version()
                .with_changes(SubChanges {
                    seats_count: Some(9),
                    ..SubChanges::default()
                }),
        )
        .await
        .unwrap();
    assert!(applied.is_applied());

    let reloaded = store.get_org_sub(sub.id).await.unwrap().unwrap();
    assert_eq!(reloaded.version, Version::new(1));
    assert_eq!(reloaded.seats_count, 9);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_delete_org_sub_is_conditional() {
    let store = get_test_store().await;
    let sub = store
        .create_org_sub(NewOrgSub {
            org_id: OrgId::new(6),
            billing_email: "billing@example.com".to_string(),
            seats_count: 1,
            card_token: "tok_visa".to_string(),
        })
        .await
        .unwrap();

    let stale = store
        .delete_org_sub(sub.id, SubCommitState::CreateSentToQueue)
        .await
        .unwrap();
    assert_eq!(
        stale,
        CasOutcome::Stale {
            current: Some(SubCommitState::CreateInit)
        }
    );

    let applied = store
        .delete_org_sub(sub.id, SubCommitState::CreateInit)
        .await
        .unwrap();
    assert!(applied.is_applied());
    assert!(store.get_org_sub(sub.id).await.unwrap().is_none());
}
