//! End-to-end tests: the full router against wiremock upstreams.

use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tollgate::auth::projects::{NewProject, Project};
use tollgate::config::Config;
use tollgate::db::Database;
use tollgate::providers::Provider;
use tollgate::providers::rotation::{CredentialKind, NewKey};
use tollgate::store::unix_now;
use tollgate::{AppState, build_router};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

const ADMIN_TOKEN: &str = "admin-secret";

struct Gateway {
    app: Router,
    state: AppState,
    server: MockServer,
    _dir: TempDir,
}

async fn gateway_with(admin_token: Option<&str>) -> Gateway {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let mut config = Config::default();
    config.database.path = dir.path().join("tollgate.db");
    config.providers.gemini.base_url = server.uri();
    config.providers.openai.base_url = server.uri();
    config.providers.audio.base_url = server.uri();
    config.auth.admin_token = admin_token.map(str::to_string);
    config.retry.max_retries = 0;

    let db = Database::open(&config.database.path).unwrap();
    let (state, _dispatcher) = AppState::build(config, db).unwrap();
    let app = build_router(state.clone());
    Gateway {
        app,
        state,
        server,
        _dir: dir,
    }
}

async fn gateway() -> Gateway {
    gateway_with(Some(ADMIN_TOKEN)).await
}

impl Gateway {
    fn project(&self, token: &str, new: NewProject) -> Project {
        self.state.projects.create_with_token(&new, token).unwrap()
    }

    fn add_key(&self, provider: &str, credential: &str) {
        self.state
            .rotation
            .add_key(&NewKey {
                provider: provider.into(),
                credential: credential.into(),
                kind: CredentialKind::Bearer,
                models: vec!["*".into()],
            })
            .unwrap();
    }

    async fn mount_gemini(&self, reply: &str) {
        Mock::given(method("POST"))
            .and(path_regex(r"^/v1beta/models/[^/]+:generateContent$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": reply}]}}],
                "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 8}
            })))
            .mount(&self.server)
            .await;
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, body)
    }

    async fn ask(&self, token: &str, body: Value) -> (StatusCode, HeaderMap, Value) {
        self.send(
            Request::post("/ask")
                .header("authorization", format!("Bearer {token}"))
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    async fn get(&self, token: &str, uri: &str) -> (StatusCode, Value) {
        let (status, _, body) = self
            .send(
                Request::get(uri)
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        (status, body)
    }

    async fn admin(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {ADMIN_TOKEN}"))
            .header("content-type", "application/json");
        let body = body.map_or_else(Body::empty, |b| Body::from(b.to_string()));
        let (status, _, value) = self.send(builder.body(body).unwrap()).await;
        (status, value)
    }

    /// Poll `/status` until the request leaves `PENDING`.
    async fn wait_terminal(&self, token: &str, request_id: &str) -> Value {
        for _ in 0..200 {
            let (status, body) = self.get(token, &format!("/status/{request_id}")).await;
            assert_eq!(status, StatusCode::OK);
            if body["status"] != "PENDING" {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("request {request_id} never completed");
    }

    fn usage(&self, project_id: &str) -> f64 {
        self.state
            .projects
            .get(project_id)
            .unwrap()
            .unwrap()
            .current_usage
    }
}

fn budget(amount: f64) -> NewProject {
    NewProject {
        name: "test-project".into(),
        monthly_budget: Some(amount),
        ..Default::default()
    }
}

fn multipart_upload(token: &str, file_name: &str, bytes: &[u8]) -> Request<Body> {
    let boundary = "tollgate-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\
             Content-Type: audio/mpeg\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    Request::post("/upload")
        .header("authorization", format!("Bearer {token}"))
        .header(
            "content-type",
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap()
}

/// Avoid straddling a minute boundary in tests that count per-minute requests.
async fn wait_for_fresh_minute() {
    let into_minute = unix_now().rem_euclid(60);
    if into_minute >= 45 {
        let secs = u64::try_from(61 - into_minute).unwrap_or(16);
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_ask_is_accepted_then_succeeds() {
    let gw = gateway().await;
    gw.mount_gemini("Hello back").await;
    gw.add_key("gemini", "AIza-one");
    let project = gw.project("abc", budget(1000.0));

    let (status, _, body) = gw
        .ask("abc", json!({"model": "gemini-2.5-flash", "input": "hello"}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let request_id = body["requestId"].as_str().unwrap().to_string();
    assert!(request_id.starts_with("req_"));

    let done = gw.wait_terminal("abc", &request_id).await;
    assert_eq!(done["status"], "SUCCESS");
    assert_eq!(done["requestId"], request_id.as_str());

    let (status, result) = gw.get("abc", &format!("/result/{request_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["content"], "Hello back");
    assert_eq!(result["provider"], "gemini");
    assert_eq!(result["promptTokens"], 4);
    assert_eq!(result["completionTokens"], 8);

    let cost = result["cost"].as_f64().unwrap();
    assert!(cost > 0.0);
    assert!((gw.usage(&project.id) - cost).abs() < 1e-12);
}

#[tokio::test]
async fn test_budget_exceeded_until_corrected() {
    let gw = gateway().await;
    gw.mount_gemini("ok").await;
    gw.add_key("gemini", "AIza-one");
    let project = gw.project("tok", budget(10.0));
    gw.state.budget.record_usage(&project.id, 10.0).unwrap();

    let (status, _, body) = gw
        .ask("tok", json!({"model": "gemini-2.5-flash", "input": "hi"}))
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"], "Budget exceeded");

    let (status, corrected) = gw
        .admin(
            "PUT",
            &format!("/admin/projects/{}/usage", project.id),
            Some(json!({"currentUsage": 0.0})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(corrected["currentUsage"], 0.0);

    let (status, _, _) = gw
        .ask("tok", json!({"model": "gemini-2.5-flash", "input": "hi"}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_sixty_first_request_is_rate_limited() {
    let gw = gateway().await;
    gw.mount_gemini("ok").await;
    gw.add_key("gemini", "AIza-one");
    gw.project(
        "tok",
        NewProject {
            requests_per_minute: Some(60),
            ..budget(1000.0)
        },
    );

    wait_for_fresh_minute().await;
    for i in 0..60 {
        let (status, _, _) = gw
            .ask("tok", json!({"model": "gemini-2.5-flash", "input": format!("q{i}")}))
            .await;
        assert_eq!(status, StatusCode::ACCEPTED, "request {i}");
    }
    let (status, headers, body) = gw
        .ask("tok", json!({"model": "gemini-2.5-flash", "input": "one too many"}))
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "Too Many Requests");
    assert!(headers.contains_key("retry-after"));
}

#[tokio::test]
async fn test_repeat_request_is_served_from_cache() {
    let gw = gateway().await;
    gw.mount_gemini("cached answer").await;
    gw.add_key("gemini", "AIza-one");
    let project = gw.project("tok", budget(1000.0));

    let body = json!({"model": "gemini-2.5-flash", "input": "what is rust?"});
    let (status, _, first) = gw.ask("tok", body.clone()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let request_id = first["requestId"].as_str().unwrap().to_string();
    gw.wait_terminal("tok", &request_id).await;
    let (_, result) = gw.get("tok", &format!("/result/{request_id}")).await;
    let usage_after_first = gw.usage(&project.id);

    let (status, _, second) = gw.ask("tok", body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["cached"], true);
    assert_eq!(second["content"], result["content"]);
    assert_eq!(second["requestId"], request_id.as_str());

    // Cache hits are free and never reach the provider.
    assert_eq!(gw.usage(&project.id), usage_after_first);
    assert_eq!(gw.server.received_requests().await.unwrap().len(), 1);
}

/// The `model` form field of a multipart transcription request.
fn multipart_model_field(body: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(body);
    let (_, rest) = text.split_once("name=\"model\"")?;
    let value = rest.trim_start_matches(['\r', '\n']);
    value.split("\r\n").next().map(str::to_string)
}

#[tokio::test]
async fn test_audio_on_ask_is_transcribed_with_transcription_model() {
    let gw = gateway().await;
    Mock::given(method("POST"))
        .and(path("/v1/audio/transcriptions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "hello from audio"})))
        .mount(&gw.server)
        .await;
    gw.add_key("groq", "gsk-A");
    gw.project("tok", budget(1000.0));

    let (status, _, body) = gw
        .ask(
            "tok",
            json!({"model": "gemini-2.5-flash", "audio": BASE64.encode(b"ID3fake"), "audioFormat": "mp3"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"], "hello from audio");
    let request_id = body["requestId"].as_str().unwrap().to_string();

    let requests = gw.server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        multipart_model_field(&requests[0].body).as_deref(),
        Some("whisper-large-v3")
    );

    let (_, result) = gw.get("tok", &format!("/result/{request_id}")).await;
    assert_eq!(result["provider"], "groq");
    assert_eq!(result["model"], "whisper-large-v3");
}

#[tokio::test]
async fn test_round_robin_over_two_transcription_keys() {
    let gw = gateway().await;
    Mock::given(method("POST"))
        .and(path("/v1/audio/transcriptions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "spoken words"})))
        .mount(&gw.server)
        .await;
    gw.project("tok", budget(1000.0));

    for credential in ["gsk-A", "gsk-B"] {
        let (status, _) = gw
            .admin(
                "POST",
                "/admin/keys",
                Some(json!({"provider": "groq", "credential": credential, "models": ["*"]})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    for _ in 0..3 {
        let (status, _, body) = gw.send(multipart_upload("tok", "clip.mp3", b"ID3fake")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["content"], "spoken words");
        assert!(body["requestId"].as_str().unwrap().starts_with("req_"));
    }

    let seen: Vec<String> = gw
        .server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter_map(|r| r.headers.get("authorization")?.to_str().ok().map(str::to_string))
        .collect();
    assert_eq!(seen, vec!["Bearer gsk-A", "Bearer gsk-B", "Bearer gsk-A"]);

    let keys = gw.state.rotation.all_keys(Provider::Groq).unwrap();
    let usage: Vec<i64> = keys.iter().map(|k| k.usage_count).collect();
    assert_eq!(usage, vec![2, 1]);

    let (status, pools) = gw.get("tok", "/keys/status").await;
    assert_eq!(status, StatusCode::OK);
    let groq = pools
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["provider"] == "groq")
        .unwrap();
    assert_eq!(groq["keyCount"], 2);
    assert_eq!(groq["cursor"], 3);
}

// ---------------------------------------------------------------------------
// Authentication & errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_invalid_token_never_mutates_state() {
    let gw = gateway().await;
    gw.mount_gemini("ok").await;
    gw.add_key("gemini", "AIza-one");
    let project = gw.project("good", budget(1000.0));

    let (status, _, body) = gw
        .ask("bad", json!({"model": "gemini-2.5-flash", "input": "hello"}))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["type"], "authentication_error");

    let (status, _, _) = gw
        .send(
            Request::post("/ask")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"model":"gemini-2.5-flash","input":"x"}"#))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    assert_eq!(gw.usage(&project.id), 0.0);
    assert!(gw.state.ledger.usage_summary().unwrap().is_empty());
    assert_eq!(
        gw.state
            .admission
            .limiter
            .current_count(&project.id, tollgate::limits::Window::Minute, unix_now())
            .unwrap(),
        0
    );
    assert!(gw.server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_json_and_forbidden_model() {
    let gw = gateway().await;
    gw.project(
        "tok",
        NewProject {
            allowed_models: Some(vec!["gemini-*".into()]),
            ..budget(1000.0)
        },
    );

    let (status, _, body) = gw
        .send(
            Request::post("/ask")
                .header("authorization", "Bearer tok")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "invalid_request_error");

    let (status, _, _) = gw.ask("tok", json!({"model": "gemini-2.5-flash"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = gw.ask("tok", json!({"model": "gpt-4o", "input": "hi"})).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_unknown_request_reads_as_pending_and_result_is_404() {
    let gw = gateway().await;
    gw.project("tok", budget(1000.0));

    let (status, body) = gw.get("tok", "/status/req_doesnotexist").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "PENDING");
    assert_eq!(body["requestId"], "req_doesnotexist");
    assert!(body.get("createdAt").is_none());

    let (status, _) = gw.get("tok", "/result/req_doesnotexist").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_provider_failure_is_recorded_as_error() {
    let gw = gateway().await;
    Mock::given(method("POST"))
        .and(path_regex(r":generateContent$"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .mount(&gw.server)
        .await;
    gw.add_key("gemini", "AIza-one");
    let project = gw.project("tok", budget(1000.0));

    let (_, _, body) = gw
        .ask("tok", json!({"model": "gemini-2.5-flash", "input": "boom"}))
        .await;
    let request_id = body["requestId"].as_str().unwrap().to_string();
    let done = gw.wait_terminal("tok", &request_id).await;
    assert_eq!(done["status"], "ERROR");
    assert!(done["message"].as_str().unwrap().contains("upstream exploded"));
    assert_eq!(gw.usage(&project.id), 0.0);

    // Failures are never cached.
    let (status, _, _) = gw
        .ask("tok", json!({"model": "gemini-2.5-flash", "input": "boom"}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_transcription_failure_is_500() {
    let gw = gateway().await;
    Mock::given(method("POST"))
        .and(path("/v1/audio/transcriptions"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad audio"))
        .mount(&gw.server)
        .await;
    gw.add_key("groq", "gsk-A");
    gw.project("tok", budget(1000.0));

    let (status, _, body) = gw.send(multipart_upload("tok", "clip.wav", b"RIFF")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["type"], "provider_error");
}

// ---------------------------------------------------------------------------
// Admin surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_admin_provisioning_flow() {
    let gw = gateway().await;

    let (status, created) = gw
        .admin(
            "POST",
            "/admin/projects",
            Some(json!({"name": "mobile-app", "monthlyBudget": 25.0, "allowedModels": ["gemini-*"]})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let token = created["token"].as_str().unwrap().to_string();
    let project_id = created["project"]["id"].as_str().unwrap().to_string();
    assert!(created["project"].get("tokenHash").is_none());

    let (status, _) = gw.get(&token, "/keys/status").await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = gw
        .admin("POST", &format!("/admin/projects/{project_id}/deactivate"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = gw.get(&token, "/keys/status").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = gw.admin("GET", "/admin/usage", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, flushed) = gw.admin("DELETE", "/admin/cache", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(flushed["flushed"], 0);

    let (status, _) = gw.admin("DELETE", "/admin/keys/key_missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_requires_configured_token() {
    let gw = gateway().await;
    let (status, _, _) = gw
        .send(
            Request::get("/admin/usage")
                .header("authorization", "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let disabled = gateway_with(None).await;
    let (status, _, _) = disabled
        .send(
            Request::get("/admin/usage")
                .header("authorization", format!("Bearer {ADMIN_TOKEN}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_health() {
    let gw = gateway().await;
    let (status, _, body) = gw
        .send(Request::get("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true}));
}
