use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use futures::{SinkExt, StreamExt};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;

use scribe_api::app::{AppServices, build_app, build_services};
use scribe_api::config::ServerConfig;
use scribe_auth::{JwtClaims, Role};
use scribe_core::{TenantId, UserId};
use scribe_infra::jobs::{HandlerError, HandlerRegistry, JobOutput};

const SECRET: &str = "test-secret-0123456789";

struct TestServer {
    base_url: String,
    ws_url: String,
    services: Arc<AppServices>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    /// Same router as prod, in-memory job core, ephemeral port.
    ///
    /// Job types:
    /// - `hold`: runs until canceled
    /// - everything else: completes immediately
    async fn spawn_with(tweak: impl FnOnce(&mut ServerConfig)) -> Self {
        let mut config = ServerConfig::new(SECRET);
        tweak(&mut config);

        let mut handlers = HandlerRegistry::new();
        handlers.register_fn("hold", |ctx| async move {
            ctx.cancelled().await;
            Err::<JobOutput, _>(HandlerError::Canceled)
        });
        handlers.register_fn("*", |ctx| async move {
            ctx.report_progress(50);
            Ok::<_, HandlerError>(JobOutput::new(format!("results/{}.json", ctx.job().id)))
        });

        let services = Arc::new(build_services(&config, handlers).await.expect("failed to build services"));
        let app = build_app(SECRET, Arc::clone(&services));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            ws_url: format!("ws://{}/ws", addr),
            services,
            handle,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn mint_jwt(tenant_id: TenantId, user_id: UserId, roles: Vec<Role>) -> String {
    let now = Utc::now();
    let claims = JwtClaims {
        sub: user_id,
        tenant_id,
        roles,
        issued_at: now,
        expires_at: now + ChronoDuration::minutes(10),
    };

    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("failed to encode jwt")
}

fn user_token(tenant_id: TenantId) -> String {
    mint_jwt(tenant_id, UserId::new(), vec![Role::USER])
}

async fn create_job(client: &reqwest::Client, srv: &TestServer, token: &str, body: Value) -> Value {
    let res = client
        .post(format!("{}/jobs", srv.base_url))
        .bearer_auth(token)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    res.json().await.unwrap()
}

async fn wait_for_status(client: &reqwest::Client, srv: &TestServer, token: &str, id: &str, status: &str) -> Value {
    for _ in 0..100 {
        let res = client
            .get(format!("{}/jobs/{}", srv.base_url, id))
            .bearer_auth(token)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body: Value = res.json().await.unwrap();
        if body["status"] == status {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} did not reach {status} within timeout");
}

async fn next_json<S>(stream: &mut S) -> Value
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn health_is_public() {
    let srv = TestServer::spawn().await;
    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn auth_required_for_protected_endpoints() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    for path in ["/whoami", "/jobs", "/usage"] {
        let res = client.get(format!("{}{}", srv.base_url, path)).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED, "{path}");
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["error"], "unauthenticated");
    }

    let res = client
        .get(format!("{}/whoami", srv.base_url))
        .bearer_auth("not-a-jwt")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn identity_is_derived_from_token() {
    let srv = TestServer::spawn().await;
    let tenant_id = TenantId::new();
    let user_id = UserId::new();
    let token = mint_jwt(tenant_id, user_id, vec![Role::ADMIN]);

    let res = reqwest::Client::new()
        .get(format!("{}/whoami", srv.base_url))
        .bearer_auth(token)
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["tenant_id"].as_str().unwrap(), tenant_id.to_string());
    assert_eq!(body["user_id"].as_str().unwrap(), user_id.to_string());
    assert!(body["roles"].as_array().unwrap().iter().any(|r| r == "admin"));
}

#[tokio::test]
async fn job_lifecycle_submit_complete_list() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let tenant_id = TenantId::new();
    let token = user_token(tenant_id);

    let created = create_job(
        &client,
        &srv,
        &token,
        json!({ "input_location": "uploads/a.wav", "priority": 3 }),
    )
    .await;
    assert_eq!(created["tenant_id"].as_str().unwrap(), tenant_id.to_string());
    assert_eq!(created["job_type"], "transcription");
    assert_eq!(created["priority"], 3);
    let id = created["id"].as_str().unwrap().to_string();

    let done = wait_for_status(&client, &srv, &token, &id, "completed").await;
    assert_eq!(done["result_location"], format!("results/{id}.json"));
    assert!(done["completed_at"].is_string());

    let res = client
        .get(format!("{}/jobs?status=completed", srv.base_url))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let list: Value = res.json().await.unwrap();
    let ids: Vec<&str> = list["jobs"].as_array().unwrap().iter().map(|j| j["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec![id.as_str()]);

    let res = client
        .get(format!("{}/usage", srv.base_url))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let usage: Value = res.json().await.unwrap();
    assert_eq!(usage["tenant_id"].as_str().unwrap(), tenant_id.to_string());
    assert!(usage["processing_minutes"].as_f64().unwrap() >= 0.0);
}

#[tokio::test]
async fn status_polling_uses_etags() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let token = user_token(TenantId::new());

    let created = create_job(
        &client,
        &srv,
        &token,
        json!({ "input_location": "uploads/hold.wav", "job_type": "hold" }),
    )
    .await;
    let id = created["id"].as_str().unwrap().to_string();
    wait_for_status(&client, &srv, &token, &id, "processing").await;

    let status_url = format!("{}/jobs/{}/status", srv.base_url, id);
    let res = client.get(&status_url).bearer_auth(&token).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let etag = res.headers()["etag"].to_str().unwrap().to_string();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "processing");

    let res = client
        .get(&status_url)
        .bearer_auth(&token)
        .header("If-None-Match", &etag)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(res.headers()["etag"].to_str().unwrap(), etag);

    let res = client
        .put(format!("{}/jobs/{}/cancel", srv.base_url, id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    wait_for_status(&client, &srv, &token, &id, "canceled").await;

    let res = client
        .get(format!("{}?etag={}", status_url, etag.trim_matches('"')))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_ne!(res.headers()["etag"].to_str().unwrap(), etag);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "canceled");
}

#[tokio::test]
async fn jobs_are_isolated_by_tenant_and_owner() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let tenant_id = TenantId::new();
    let owner = user_token(tenant_id);

    let created = create_job(&client, &srv, &owner, json!({ "input_location": "uploads/a.wav" })).await;
    let id = created["id"].as_str().unwrap();

    let outsider = user_token(TenantId::new());
    let colleague = user_token(tenant_id);
    for token in [&outsider, &colleague] {
        let res = client
            .get(format!("{}/jobs/{}", srv.base_url, id))
            .bearer_auth(token)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["error"], "unauthorized");
    }

    let admin = mint_jwt(tenant_id, UserId::new(), vec![Role::ADMIN]);
    let res = client
        .get(format!("{}/jobs/{}", srv.base_url, id))
        .bearer_auth(admin)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let token = user_token(TenantId::new());

    let res = client
        .post(format!("{}/jobs", srv.base_url))
        .bearer_auth(&token)
        .json(&json!({ "input_location": "uploads/a.wav", "priority": 42 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .get(format!("{}/jobs/not-a-uuid", srv.base_url))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .get(format!("{}/jobs/{}", srv.base_url, scribe_core::JobId::new()))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admission_ceiling_returns_429() {
    let srv = TestServer::spawn_with(|config| config.default_limits.max_queued_jobs = 1).await;
    let client = reqwest::Client::new();
    let token = user_token(TenantId::new());

    let held = create_job(&client, &srv, &token, json!({ "input_location": "a", "job_type": "hold" })).await;
    wait_for_status(&client, &srv, &token, held["id"].as_str().unwrap(), "processing").await;

    let res = client
        .post(format!("{}/jobs", srv.base_url))
        .bearer_auth(&token)
        .json(&json!({ "input_location": "b" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "capacity_exceeded");

    let res = client
        .get(format!("{}/queue", srv.base_url))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let stats: Value = res.json().await.unwrap();
    assert_eq!(stats["in_flight"], 1);
    assert!(stats.get("active_tenants").is_none());
}

#[tokio::test]
async fn retry_creates_a_successor() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let token = user_token(TenantId::new());

    let created = create_job(&client, &srv, &token, json!({ "input_location": "a", "job_type": "hold" })).await;
    let id = created["id"].as_str().unwrap().to_string();
    wait_for_status(&client, &srv, &token, &id, "processing").await;

    let res = client
        .put(format!("{}/jobs/{}/retry", srv.base_url, id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    client
        .put(format!("{}/jobs/{}/cancel", srv.base_url, id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let canceled = wait_for_status(&client, &srv, &token, &id, "canceled").await;
    assert_eq!(canceled["error"], "job canceled");

    let res = client
        .put(format!("{}/jobs/{}/retry", srv.base_url, id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let successor: Value = res.json().await.unwrap();
    assert_eq!(successor["retry_of"].as_str().unwrap(), id);
    assert_ne!(successor["id"].as_str().unwrap(), id);
}

#[tokio::test]
async fn websocket_subscription_streams_updates() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let tenant_id = TenantId::new();
    let token = user_token(tenant_id);

    let created = create_job(&client, &srv, &token, json!({ "input_location": "a", "job_type": "hold" })).await;
    let id = created["id"].as_str().unwrap().to_string();

    let (socket, _) = tokio_tungstenite::connect_async(format!("{}?token={}", srv.ws_url, token))
        .await
        .expect("websocket handshake failed");
    let (mut sink, mut stream) = socket.split();

    sink.send(Message::Text(json!({ "type": "subscribe", "job_id": id }).to_string()))
        .await
        .unwrap();
    let ack = next_json(&mut stream).await;
    assert_eq!(ack, json!({ "type": "subscribed", "job_id": id }));
    let snapshot = next_json(&mut stream).await;
    assert_eq!(snapshot["type"], "job_update");
    assert_eq!(snapshot["job_id"], id.as_str());

    client
        .put(format!("{}/jobs/{}/cancel", srv.base_url, id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();

    loop {
        let update = next_json(&mut stream).await;
        assert_eq!(update["type"], "job_update");
        if update["status"] == "canceled" {
            break;
        }
    }
    assert_eq!(srv.services.system.fanout.connection_count(), 1);
}

#[tokio::test]
async fn websocket_rejects_unknown_messages_and_foreign_jobs() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let owner = user_token(TenantId::new());
    let created = create_job(&client, &srv, &owner, json!({ "input_location": "a" })).await;
    let id = created["id"].as_str().unwrap().to_string();

    let outsider = user_token(TenantId::new());
    let (socket, _) = tokio_tungstenite::connect_async(format!("{}?token={}", srv.ws_url, outsider))
        .await
        .expect("websocket handshake failed");
    let (mut sink, mut stream) = socket.split();

    sink.send(Message::Text(json!({ "type": "shout" }).to_string())).await.unwrap();
    let reply = next_json(&mut stream).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "invalid_message");

    sink.send(Message::Text(json!({ "type": "subscribe", "job_id": id }).to_string()))
        .await
        .unwrap();
    let reply = next_json(&mut stream).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "unauthorized");

    sink.send(Message::Text(json!({ "type": "ping" }).to_string())).await.unwrap();
    assert_eq!(next_json(&mut stream).await, json!({ "type": "pong" }));
}

#[tokio::test]
async fn websocket_requires_a_token() {
    let srv = TestServer::spawn().await;
    let err = tokio_tungstenite::connect_async(srv.ws_url.clone()).await;
    assert!(err.is_err());
}
