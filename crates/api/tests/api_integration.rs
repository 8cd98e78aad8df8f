//! Integration tests for the API server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use api::config::Config;
use api::runtime::{Backends, build_state, build_worker};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use async_trait::async_trait;
use queue::{InMemoryQueue, Queue, QueueError};
use saga::{InMemoryPaymentGateway, InMemoryVcsProvider, ProviderRepo};
use store::{InMemoryStore, OrgSubId, RepoCommitState, RepoId, SubCommitState};
use tokio::sync::watch;
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

/// Primary queue whose next `put` can be made to fail.
struct FlakyQueue {
    inner: InMemoryQueue,
    fail_next: Arc<AtomicBool>,
}

#[async_trait]
impl Queue for FlakyQueue {
    async fn put(&self, body: String) -> Result<(), QueueError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(QueueError::Transport("connection reset".to_string()));
        }
        self.inner.put(body).await
    }
}

struct TestHarness {
    app: axum::Router,
    config: Config,
    backends: Backends,
    store: InMemoryStore,
    primary: InMemoryQueue,
    fail_next_put: Arc<AtomicBool>,
}

impl TestHarness {
    fn new() -> Self {
        let config = Config::default();
        let store = InMemoryStore::new();
        let primary = InMemoryQueue::new();
        let fail_next_put = Arc::new(AtomicBool::new(false));

        let mut backends = Backends::in_memory(&config);
        backends.repos = Arc::new(store.clone());
        backends.subs = Arc::new(store.clone());
        backends.primary = Arc::new(FlakyQueue {
            inner: primary.clone(),
            fail_next: fail_next_put.clone(),
        });
        backends.primary_receiver = Arc::new(primary.clone());

        let state = build_state(&backends).unwrap();
        let app = api::create_app(state, get_metrics_handle());
        Self {
            app,
            config,
            backends,
            store,
            primary,
            fail_next_put,
        }
    }

    async fn send(
        &self,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_string(&json).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    async fn post_repo(&self, full_name: &str) -> (StatusCode, serde_json::Value) {
        self.send(
            "POST",
            "/repos",
            Some(serde_json::json!({ "full_name": full_name })),
        )
        .await
    }

    async fn post_sub(&self, org_id: i64, seats: i32) -> (StatusCode, serde_json::Value) {
        self.send(
            "POST",
            "/subs",
            Some(serde_json::json!({
                "org_id": org_id,
                "billing_email": "billing@acme.dev",
                "seats_count": seats,
                "card_token": "tok_visa"
            })),
        )
        .await
    }

    async fn pending_subqueues(&self) -> Vec<String> {
        self.primary
            .pending_bodies()
            .await
            .iter()
            .map(|body| {
                let envelope: serde_json::Value = serde_json::from_str(body).unwrap();
                envelope["SubqueueID"].as_str().unwrap().to_string()
            })
            .collect()
    }
}

#[tokio::test]
async fn test_health_check() {
    let h = TestHarness::new();
    let (status, json) = h.send("GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["backends"]["store"], "memory");
    assert_eq!(json["backends"]["queue"], "memory");
    assert_eq!(json["backends"]["lock"], "memory");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let h = TestHarness::new();
    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/plain")
    );
}

#[tokio::test]
async fn test_create_repo_enqueues_and_advances() {
    let h = TestHarness::new();
    let (status, json) = h.post_repo("acme/api").await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["full_name"], "acme/api");
    assert_eq!(json["commit_state"], "create/sent_to_queue");
    assert_eq!(h.pending_subqueues().await, vec!["repos/create"]);
}

#[tokio::test]
async fn test_create_repo_rejects_bad_name() {
    let h = TestHarness::new();
    let (status, json) = h.post_repo("not-a-repo").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("owner/name"));
    assert_eq!(h.primary.pending_count().await, 0);
}

#[tokio::test]
async fn test_reposting_stuck_repo_reenqueues() {
    let h = TestHarness::new();
    let (_, first) = h.post_repo("acme/api").await;
    let (status, second) = h.post_repo("acme/api").await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(first["id"], second["id"]);
    assert_eq!(h.store.repo_count().await, 1);
    assert_eq!(h.primary.pending_count().await, 2);
}

#[tokio::test]
async fn test_create_connected_repo_conflicts() {
    let h = TestHarness::new();
    let (_, json) = h.post_repo("acme/api").await;
    let id = RepoId::new(json["id"].as_i64().unwrap());
    h.store.force_repo_state(id, RepoCommitState::CreateDone).await;

    let (status, _) = h.post_repo("acme/api").await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_get_missing_repo() {
    let h = TestHarness::new();
    let (status, json) = h.send("GET", "/repos/999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().is_some());
}

#[tokio::test]
async fn test_delete_repo() {
    let h = TestHarness::new();
    let (_, json) = h.post_repo("acme/api").await;
    let id = json["id"].as_i64().unwrap();
    let uri = format!("/repos/{id}");

    let (status, _) = h.send("DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    h.store
        .force_repo_state(RepoId::new(id), RepoCommitState::CreateDone)
        .await;
    let (status, json) = h.send("DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["commit_state"], "delete/sent_to_queue");
    assert_eq!(
        h.pending_subqueues().await,
        vec!["repos/create", "repos/delete"]
    );
}

#[tokio::test]
async fn test_create_sub_validates_input() {
    let h = TestHarness::new();
    let (status, _) = h.post_sub(1, 0).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(h.store.org_sub_count().await, 0);
}

#[tokio::test]
async fn test_sub_update_rules() {
    let h = TestHarness::new();
    let (status, json) = h.post_sub(1, 3).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["commit_state"], "create/sent_to_queue");
    assert_eq!(json["version"], 0);
    let id = json["id"].as_i64().unwrap();
    let uri = format!("/subs/{id}");
    let update = |version: i64| {
        serde_json::json!({ "seats_count": 5, "card_token": "tok_visa", "version": version })
    };

    // Create still in flight.
    let (status, _) = h.send("PUT", &uri, Some(update(0))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    h.store
        .force_org_sub_state(OrgSubId::new(id), SubCommitState::CreateDone)
        .await;
    let (status, _) = h.send("PUT", &uri, Some(update(3))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, json) = h.send("PUT", &uri, Some(update(0))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["commit_state"], "update/sent_to_queue");
    assert_eq!(json["seats_count"], 3);

    // Retrying the in-flight update re-enqueues it; a stale version does not.
    let (status, json) = h.send("PUT", &uri, Some(update(0))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["commit_state"], "update/sent_to_queue");
    let (status, _) = h.send("PUT", &uri, Some(update(1))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(
        h.pending_subqueues().await,
        vec!["subs/create", "subs/update", "subs/update"]
    );
}

#[tokio::test]
async fn test_sub_update_retry_recovers_from_failed_enqueue() {
    let h = TestHarness::new();
    let (_, json) = h.post_sub(2, 3).await;
    let id = json["id"].as_i64().unwrap();
    let uri = format!("/subs/{id}");
    h.store
        .force_org_sub_state(OrgSubId::new(id), SubCommitState::CreateDone)
        .await;
    let update = serde_json::json!({ "seats_count": 5, "card_token": "tok_visa", "version": 0 });

    h.fail_next_put.store(true, Ordering::SeqCst);
    let (status, _) = h.send("PUT", &uri, Some(update.clone())).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let (_, json) = h.send("GET", &uri, None).await;
    assert_eq!(json["commit_state"], "update/init");
    assert_eq!(h.pending_subqueues().await, vec!["subs/create"]);

    let (status, json) = h.send("PUT", &uri, Some(update)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["commit_state"], "update/sent_to_queue");
    assert_eq!(
        h.pending_subqueues().await,
        vec!["subs/create", "subs/update"]
    );
}

#[tokio::test]
async fn test_second_sub_for_org_conflicts() {
    let h = TestHarness::new();
    let (_, json) = h.post_sub(7, 3).await;
    let id = json["id"].as_i64().unwrap();
    h.store
        .force_org_sub_state(OrgSubId::new(id), SubCommitState::CreateDone)
        .await;

    let (status, _) = h.post_sub(7, 4).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, json) = h.send("DELETE", &format!("/subs/{id}"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["commit_state"], "delete/sent_to_queue");

    let bodies = h.primary.pending_bodies().await;
    let envelope: serde_json::Value = serde_json::from_str(bodies.last().unwrap()).unwrap();
    assert_eq!(envelope["SubqueueID"], "subs/delete");
    assert_eq!(envelope["Message"]["restore_to"], "create/done");
}

#[tokio::test]
async fn test_requests_flow_through_worker() {
    let h = TestHarness::new();
    let vcs = InMemoryVcsProvider::new();
    vcs.add_repo(ProviderRepo {
        full_name: "acme/api".to_string(),
        private: false,
        archived: false,
        default_branch: "main".to_string(),
        head_commit_sha: Some("c0ffee".to_string()),
    })
    .await;
    let worker = build_worker(
        &h.config,
        &h.backends,
        Arc::new(vcs.clone()),
        Arc::new(InMemoryPaymentGateway::new()),
    )
    .unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(worker.run(shutdown_rx));

    let (_, repo) = h.post_repo("acme/api").await;
    let (_, sub) = h.post_sub(1, 3).await;
    let repo_uri = format!("/repos/{}", repo["id"]);
    let sub_uri = format!("/subs/{}", sub["id"]);

    let mut settled = false;
    for _ in 0..200 {
        let (_, repo) = h.send("GET", &repo_uri, None).await;
        let (_, sub) = h.send("GET", &sub_uri, None).await;
        if repo["commit_state"] == "create/done" && sub["commit_state"] == "create/done" {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown_tx.send(true).unwrap();
    worker.await.unwrap();
    assert!(settled, "sagas did not finish");
    assert_eq!(vcs.hooks("acme/api").await.len(), 1);
    assert_eq!(h.primary.acked_count().await, 2);
}
