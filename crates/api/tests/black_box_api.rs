use std::sync::Arc;

use pagewatch_api::app::{build_app, AppServices};
use reqwest::StatusCode;
use serde_json::{json, Value};

const ADMIN_TOKEN: &str = "test-admin-token";

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        // Same router as prod, no workers, bound to an ephemeral port.
        let services = Arc::new(AppServices::in_memory());
        let app = build_app(services, Some(ADMIN_TOKEN.to_string()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            client: reqwest::Client::new(),
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn provision(&self, tenant: &str) {
        let res = self
            .client
            .post(self.url("/webhooks/identity"))
            .json(&json!({
                "type": "user.created",
                "data": {
                    "tenant_id": tenant,
                    "external_id": format!("user_{tenant}"),
                    "email": format!("owner@{tenant}.test"),
                    "org_name": format!("{tenant} inc"),
                }
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    async fn post(&self, tenant: &str, path: &str, body: Value) -> (StatusCode, Value) {
        let res = self
            .client
            .post(self.url(path))
            .header("x-tenant-id", tenant)
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = res.status();
        (status, res.json().await.unwrap_or(Value::Null))
    }

    async fn get(&self, tenant: &str, path: &str) -> (StatusCode, Value) {
        let res = self
            .client
            .get(self.url(path))
            .header("x-tenant-id", tenant)
            .send()
            .await
            .unwrap();
        let status = res.status();
        (status, res.json().await.unwrap_or(Value::Null))
    }

    /// Project with one screenshot; returns (project_id, screenshot_id).
    async fn site(&self, tenant: &str) -> (String, String) {
        let (status, project) = self
            .post(tenant, "/projects", json!({ "name": "Site", "diff_threshold": 5.0 }))
            .await;
        assert_eq!(status, StatusCode::CREATED, "{project}");
        let project_id = project["id"].as_str().unwrap().to_string();

        let (status, screenshot) = self
            .post(
                tenant,
                &format!("/projects/{project_id}/screenshots"),
                json!({ "name": "Home", "url": "https://example.com" }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{screenshot}");
        (project_id, screenshot["id"].as_str().unwrap().to_string())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[tokio::test]
async fn health_is_public() {
    let server = TestServer::spawn().await;
    let res = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn tenant_routes_require_tenant_header() {
    let server = TestServer::spawn().await;
    let res = server.client.get(server.url("/projects")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "missing_tenant");
}

#[tokio::test]
async fn unknown_tenant_cannot_create_projects() {
    let server = TestServer::spawn().await;
    let (status, body) = server.post("org_ghost", "/projects", json!({ "name": "Site" })).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unknown_tenant");
}

#[tokio::test]
async fn rerun_queues_a_capture_visible_to_admin() {
    let server = TestServer::spawn().await;
    server.provision("org_a").await;
    let (_, screenshot_id) = server.site("org_a").await;

    let (status, submission) = server
        .post("org_a", &format!("/screenshots/{screenshot_id}/rerun"), json!({}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(submission["lane"], "capture");
    assert_eq!(submission["outcome"], "created");

    let (_, screenshot) = server.get("org_a", &format!("/screenshots/{screenshot_id}")).await;
    assert_eq!(screenshot["status"], "pending");

    let unauthorized = server
        .client
        .get(server.url("/admin/lanes/capture"))
        .send()
        .await
        .unwrap();
    assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);

    let lane: Value = server
        .client
        .get(server.url("/admin/lanes/capture"))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(lane["counts"]["waiting"], 1);
    assert_eq!(lane["sample"]["waiting"][0]["id"], submission["job_id"]);

    let (_, quota) = server.get("org_a", "/quota").await;
    assert_eq!(quota["usage"]["captures_this_period"], 1);

    let job_id = submission["job_id"].as_str().unwrap();
    let cancelled = server
        .client
        .delete(server.url(&format!("/admin/lanes/capture/jobs/{job_id}")))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(cancelled.status(), StatusCode::OK);
    let cancelled: Value = cancelled.json().await.unwrap();
    assert_eq!(cancelled["outcome"], "removed");
}

#[tokio::test]
async fn bulk_run_reports_one_job_per_screenshot() {
    let server = TestServer::spawn().await;
    server.provision("org_a").await;
    let (project_id, _) = server.site("org_a").await;
    server
        .post(
            "org_a",
            &format!("/projects/{project_id}/screenshots"),
            json!({ "name": "Pricing", "url": "https://example.com/pricing", "viewport": { "width": 1280, "height": 800 } }),
        )
        .await;

    let (status, body) = server
        .post("org_a", &format!("/projects/{project_id}/run"), json!({}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|i| i["outcome"] == "created"));
    assert!(items.iter().all(|i| i["job_id"].as_str().unwrap().starts_with("capture:")));
}

#[tokio::test]
async fn tenants_never_see_each_others_rows() {
    let server = TestServer::spawn().await;
    server.provision("org_a").await;
    server.provision("org_b").await;
    let (a_project, a_screenshot) = server.site("org_a").await;
    server.site("org_b").await;

    let (_, projects) = server.get("org_a", "/projects").await;
    let items = projects["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["id"], a_project.as_str());

    let (status, _) = server.get("org_b", &format!("/screenshots/{a_screenshot}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = server
        .post("org_b", &format!("/screenshots/{a_screenshot}/rerun"), json!({}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn approval_requires_principal_and_valid_transition() {
    let server = TestServer::spawn().await;
    server.provision("org_a").await;
    let (_, screenshot_id) = server.site("org_a").await;
    let path = format!("/screenshots/{screenshot_id}/approval");

    let (status, body) = server.post("org_a", &path, json!({ "action": "approved" })).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "missing_principal");

    let approve = |action: &'static str| {
        server
            .client
            .post(server.url(&path))
            .header("x-tenant-id", "org_a")
            .header("x-principal-id", "user_org_a")
            .json(&json!({ "action": action, "reason": "looks right" }))
            .send()
    };

    let res = approve("approved").await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let screenshot: Value = res.json().await.unwrap();
    assert_eq!(screenshot["approval_status"], "approved");
    assert_eq!(screenshot["approved_by"], "user_org_a");

    let res = approve("rejected").await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let res = approve("maybe").await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let (_, events) = server
        .get("org_a", &format!("/screenshots/{screenshot_id}/approvals"))
        .await;
    let events = events["items"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["action"], "approved");
    assert_eq!(events[0]["actor"], "user_org_a");
}

#[tokio::test]
async fn free_plan_project_limit_is_429() {
    let server = TestServer::spawn().await;
    server.provision("org_a").await;
    for i in 0..3 {
        let (status, _) = server
            .post("org_a", "/projects", json!({ "name": format!("Site {i}") }))
            .await;
        assert_eq!(status, StatusCode::CREATED);
    }
    let (status, body) = server.post("org_a", "/projects", json!({ "name": "One too many" })).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "quota_exceeded");
}

#[tokio::test]
async fn schedule_replaces_and_removes() {
    let server = TestServer::spawn().await;
    server.provision("org_a").await;
    let (_, screenshot_id) = server.site("org_a").await;
    let path = format!("/screenshots/{screenshot_id}/schedule");

    let put = |cron: &'static str| {
        server
            .client
            .put(server.url(&path))
            .header("x-tenant-id", "org_a")
            .json(&json!({ "cron": cron }))
            .send()
    };

    assert_eq!(put("not a cron").await.unwrap().status(), StatusCode::BAD_REQUEST);
    assert_eq!(put("0 * * * *").await.unwrap().status(), StatusCode::OK);
    let res = put("*/15 * * * *").await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let entry: Value = res.json().await.unwrap();
    assert_eq!(entry["expression"], "*/15 * * * *");

    let (status, _) = server.get("org_b", &path).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let res = server
        .client
        .delete(server.url(&path))
        .header("x-tenant-id", "org_a")
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["removed"], true);
}

#[tokio::test]
async fn malformed_ids_are_400() {
    let server = TestServer::spawn().await;
    server.provision("org_a").await;
    let (status, body) = server.get("org_a", "/screenshots/not-a-uuid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_id");
}

#[tokio::test]
async fn screenshot_url_must_be_http() {
    let server = TestServer::spawn().await;
    server.provision("org_a").await;
    let (status, project) = server.post("org_a", "/projects", json!({ "name": "Site" })).await;
    assert_eq!(status, StatusCode::CREATED);
    let path = format!("/projects/{}/screenshots", project["id"].as_str().unwrap());

    let (status, body) = server
        .post("org_a", &path, json!({ "name": "Home", "url": "not a url" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let (status, _) = server
        .post("org_a", &path, json!({ "name": "Home", "url": "ftp://example.com" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, screenshots) = server.get("org_a", &path).await;
    assert!(screenshots["items"].as_array().unwrap().is_empty());
}
