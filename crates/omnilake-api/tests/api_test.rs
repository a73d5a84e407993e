//! HTTP tests for the OmniLake API.
//!
//! Each test serves the real router on an ephemeral port, backed by the
//! in-memory repositories and the mock inference backend. Background
//! processing is driven explicitly with `run_until_idle`.

use std::sync::Arc;

use omnilake_api::{router, AppState};
use omnilake_db::memory;
use omnilake_inference::MockInferenceBackend;
use omnilake_jobs::{ArchiveRepository, EngineContext, LakeService, WorkerConfig};
use serde_json::{json, Value};

struct TestServer {
    base_url: String,
    service: LakeService,
    client: reqwest::Client,
}

impl TestServer {
    async fn spawn() -> Self {
        let backend = Arc::new(
            MockInferenceBackend::new().with_response_mapping("USER GOAL:", "api summary"),
        );
        let service = LakeService::new(EngineContext::new(
            memory::repositories(),
            backend.clone(),
            backend,
        ));
        let app = router(AppState::new(service.clone()));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            service,
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    async fn delete(&self, path: &str) -> (u16, Value) {
        let response = self
            .client
            .delete(format!("{}{}", self.base_url, path))
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    async fn drain(&self) {
        self.service
            .worker(
                WorkerConfig::default()
                    .with_retry_backoff(0)
                    .with_poll_interval(1),
            )
            .await
            .run_until_idle()
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_health() {
    let server = TestServer::spawn().await;
    let (status, body) = server.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_lake_request_round_trip() {
    let server = TestServer::spawn().await;
    let (status, _) = server.post("/api/v1/archives", json!({"archive_id": "docs"})).await;
    assert_eq!(status, 201);
    let (status, entry) = server
        .post(
            "/api/v1/entries",
            json!({"content": "pumps need service every 90 days", "archive_id": "docs"}),
        )
        .await;
    assert_eq!(status, 201);
    assert!(entry["entry_id"].is_string());

    let (status, submitted) = server
        .post(
            "/api/v1/lake_requests",
            json!({
                "lookup_instructions": [{"request_type": "BASIC", "archive_id": "docs"}],
                "processing_instructions": {"processor_type": "SUMMARIZATION", "goal": "maintenance"},
            }),
        )
        .await;
    assert_eq!(status, 201);
    assert_eq!(submitted["job_type"], "LAKE_REQUEST");

    server.drain().await;

    let id = submitted["lake_request_id"].as_str().unwrap();
    let (status, description) = server.get(&format!("/api/v1/lake_requests/{}", id)).await;
    assert_eq!(status, 200);
    assert_eq!(description["request_status"], "COMPLETED");
    assert_eq!(description["response_body"], "api summary");

    let job_id = submitted["job_id"].as_str().unwrap();
    let (status, job) = server
        .get(&format!("/api/v1/jobs/LAKE_REQUEST/{}", job_id))
        .await;
    assert_eq!(status, 200);
    assert_eq!(job["status"], "COMPLETED");
}

#[tokio::test]
async fn test_unknown_ids_are_404() {
    let server = TestServer::spawn().await;
    let missing = "0190f5a2-0000-7000-8000-000000000000";

    let (status, body) = server.get(&format!("/api/v1/lake_requests/{}", missing)).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"], "lake request not found");

    let (status, body) = server.get(&format!("/api/v1/chains/{}", missing)).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"], "chain request not found");

    let (status, _) = server.get("/api/v1/archives/nope").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_invalid_requests_are_400() {
    let server = TestServer::spawn().await;

    let (status, _) = server
        .post(
            "/api/v1/lake_requests",
            json!({
                "lookup_instructions": [{"request_type": "DIRECT_ENTRY", "entry_id": "REF:a.response_entry_id"}],
                "processing_instructions": {"processor_type": "SUMMARIZATION", "goal": "g"},
            }),
        )
        .await;
    assert_eq!(status, 400);

    let (status, body) = server
        .post(
            "/api/v1/chains",
            json!({"chain": [{
                "name": "a",
                "lake_request": {
                    "lookup_instructions": [{"request_type": "DIRECT_ENTRY", "entry_id": "REF:b.response_entry_id"}],
                    "processing_instructions": {"processor_type": "SUMMARIZATION", "goal": "g"},
                },
            }]}),
        )
        .await;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("unknown step"));

    let (status, _) = server
        .get("/api/v1/jobs/NOT_A_JOB/0190f5a2-0000-7000-8000-000000000000")
        .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_delete_during_maintenance_is_409_retryable() {
    let server = TestServer::spawn().await;
    server.post("/api/v1/archives", json!({"archive_id": "docs"})).await;
    server
        .service
        .context()
        .repos
        .archives
        .begin_maintenance("docs", "ARCHIVE_VACUUM/held-by-test")
        .await
        .unwrap();

    let (status, body) = server.delete("/api/v1/archives/docs").await;
    assert_eq!(status, 409);
    assert_eq!(body["retryable"], true);

    server
        .service
        .context()
        .repos
        .archives
        .end_maintenance("docs", "ARCHIVE_VACUUM/held-by-test")
        .await
        .unwrap();
    let (status, body) = server.delete("/api/v1/archives/docs").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "DELETING");
}

#[tokio::test]
async fn test_reindex_is_accepted_and_completes() {
    let server = TestServer::spawn().await;
    server.post("/api/v1/archives", json!({"archive_id": "docs"})).await;
    server
        .post("/api/v1/entries", json!({"content": "a", "archive_id": "docs"}))
        .await;

    let (status, job) = server.post("/api/v1/archives/docs/reindex", json!({})).await;
    assert_eq!(status, 202);
    assert_eq!(job["job_type"], "ARCHIVE_REINDEX");

    server.drain().await;

    let (_, job) = server
        .get(&format!(
            "/api/v1/jobs/ARCHIVE_REINDEX/{}",
            job["job_id"].as_str().unwrap()
        ))
        .await;
    assert_eq!(job["status"], "COMPLETED");
    assert_eq!(job["status_message"], "reindexed 1 entries");
}
