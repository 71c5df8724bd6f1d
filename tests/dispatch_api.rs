use std::net::SocketAddr;
use std::time::Duration;

use reqwest::StatusCode;
use rosie::config::{AppConfig, QueueConfig};
use rosie::context::AppContext;
use rosie::core::{JobQueue, JobState};
use rosie::{db, web};
use serde_json::{Value, json};
use tempfile::TempDir;

struct TestApi {
    addr: SocketAddr,
    queue: JobQueue,
    client: reqwest::Client,
    dir: TempDir,
}

impl TestApi {
    async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let config = AppConfig {
            node_name: Some("node_1".to_string()),
            queue: QueueConfig {
                path: dir.path().join("queue.db"),
                ..Default::default()
            },
            ..Default::default()
        };

        let ctx = AppContext::connect(config).await.expect("connect");
        let queue = ctx.queue.clone();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, web::router(ctx)).await.unwrap();
        });

        Self {
            addr,
            queue,
            client: reqwest::Client::new(),
            dir,
        }
    }

    /// Drop the jobs table behind the API's back, leaving its connection
    /// pointed at a store it can no longer use.
    async fn break_store(&self) {
        let conn = db::open(&self.dir.path().join("queue.db"), Duration::from_secs(5))
            .await
            .unwrap();
        conn.call(|c| c.execute_batch("DROP TABLE jobs"))
            .await
            .unwrap();
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn post_run_test(&self, content_type: &str, body: &str) -> reqwest::Response {
        self.client
            .post(self.url("/run-test"))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body.to_string())
            .send()
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_status_reports_idle_node() {
    let api = TestApi::start().await;

    let response = api.client.get(api.url("/status")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["node_name"], "node_1");
    assert_eq!(body["busy"], false);
    assert_eq!(body["job_count"], 0);
    assert_eq!(body["queue_reachable"], true);
}

#[tokio::test]
async fn test_status_is_busy_while_job_runs() {
    let api = TestApi::start().await;

    let response = api
        .post_run_test("application/json", r#"{"commit_sha": "abc123"}"#)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    api.queue.claim_next().await.unwrap().expect("claimed");

    let body: Value = api
        .client
        .get(api.url("/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["busy"], true);
    assert_eq!(body["job_count"], 1);
}

#[tokio::test]
async fn test_run_test_queues_one_job() {
    let api = TestApi::start().await;

    let response = api
        .post_run_test("application/json", r#"{"commit_sha": "abc123"}"#)
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["result"], "success");
    let job_id = body["job_id"].as_str().expect("job id").to_string();

    assert_eq!(api.queue.count_queued().await.unwrap(), 1);
    let job = api.queue.get(&job_id).await.unwrap().expect("job exists");
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.commit_sha(), Some("abc123"));
}

#[tokio::test]
async fn test_run_test_rejects_non_json() {
    let api = TestApi::start().await;

    for (content_type, body) in [
        ("text/plain", r#"{"commit_sha": "abc123"}"#),
        ("application/json", "commit_sha=abc123"),
        ("application/json", r#"["abc123"]"#),
    ] {
        let response = api.post_run_test(content_type, body).await;
        assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE, "{content_type} {body}");

        let body: Value = response.json().await.unwrap();
        assert!(body["error"].is_string());
    }

    assert_eq!(api.queue.count_queued().await.unwrap(), 0);
}

#[tokio::test]
async fn test_run_test_requires_commit_sha() {
    let api = TestApi::start().await;

    for body in [
        json!({}),
        json!({"commit": "abc123"}),
        json!({"commit_sha": ""}),
        json!({"commit_sha": 123}),
    ] {
        let response = api
            .post_run_test("application/json", &body.to_string())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
    }

    assert_eq!(api.queue.count_queued().await.unwrap(), 0);
}

#[tokio::test]
async fn test_run_test_only_accepts_post() {
    let api = TestApi::start().await;

    let response = api.client.get(api.url("/run-test")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(
        response
            .headers()
            .get(reqwest::header::ALLOW)
            .and_then(|v| v.to_str().ok()),
        Some("POST")
    );
}

#[tokio::test]
async fn test_job_lookup() {
    let api = TestApi::start().await;

    let accepted: Value = api
        .post_run_test("application/json", r#"{"commit_sha": "abc123"}"#)
        .await
        .json()
        .await
        .unwrap();
    let job_id = accepted["job_id"].as_str().expect("job id");

    let response = api
        .client
        .get(api.url(&format!("/jobs/{job_id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let job: Value = response.json().await.unwrap();
    assert_eq!(job["state"], "queued");
    assert_eq!(job["args"]["commit_sha"], "abc123");

    let response = api
        .client
        .get(api.url("/jobs/no-such-job"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_status_degrades_when_store_is_gone() {
    let api = TestApi::start().await;
    api.break_store().await;

    let response = api.client.get(api.url("/status")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["node_name"], "node_1");
    assert_eq!(body["busy"], false);
    assert_eq!(body["job_count"], 0);
    assert_eq!(body["queue_reachable"], false);
}

#[tokio::test]
async fn test_run_test_reports_unavailable_store() {
    let api = TestApi::start().await;
    api.break_store().await;

    let response = api
        .post_run_test("application/json", r#"{"commit_sha": "abc123"}"#)
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "queue_unavailable");
}
