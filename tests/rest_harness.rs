use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use quill_sdk::rest::{
    Method, RequestDispatcher, RequestDispatcherOptions, RequestOptions, RestError,
};
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;

const TEST_TOKEN: &str = "test-token";

fn dispatcher(addr: SocketAddr, bot: bool) -> RequestDispatcher {
    RequestDispatcher::with_options(
        Some(SecretString::new(TEST_TOKEN.to_string())),
        bot,
        RequestDispatcherOptions {
            base_url: format!("http://{addr}"),
            shard: 3,
            ..RequestDispatcherOptions::default()
        },
    )
    .expect("build request dispatcher")
}

#[derive(Clone)]
struct ObservedState {
    observed_tx: Arc<Mutex<Option<oneshot::Sender<Result<Value, String>>>>>,
}

impl ObservedState {
    fn new() -> (Self, oneshot::Receiver<Result<Value, String>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                observed_tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    async fn report(&self, result: Result<Value, String>) {
        if let Some(tx) = self.observed_tx.lock().await.take() {
            let _ = tx.send(result);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn message_post_sends_auth_header_and_json_body() {
    let (state, observed_rx) = ObservedState::new();
    let app = Router::new()
        .route("/v6/channels/:id/messages", post(message_handler))
        .with_state(state);
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let dispatcher = dispatcher(addr, true);
    let response = dispatcher
        .request(
            Method::Post,
            "/channels/42/messages",
            RequestOptions::authenticated().with_body(json!({ "content": "hello" })),
        )
        .await
        .expect("message post succeeds");
    assert_eq!(response.get("id").and_then(Value::as_str), Some("9000"));

    let observed = timeout(Duration::from_secs(2), observed_rx)
        .await
        .expect("timed out waiting for server observation")
        .expect("observation channel closed")
        .expect("server-side assertions failed");
    assert_eq!(
        observed.get("content").and_then(Value::as_str),
        Some("hello")
    );

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn throttle_response_surfaces_diagnostics_without_retry() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/v6/channels/:id/messages",
            post({
                let hits = Arc::clone(&hits);
                move |Path(_id): Path<String>| {
                    let hits = Arc::clone(&hits);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        (
                            StatusCode::TOO_MANY_REQUESTS,
                            Json(json!({ "retry_after": 5000, "message": "throttled" })),
                        )
                    }
                }
            }),
        );
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let dispatcher = dispatcher(addr, true);
    let error = dispatcher
        .request(
            Method::Post,
            "/channels/42/messages",
            RequestOptions::authenticated().with_body(json!({ "content": "x" })),
        )
        .await
        .expect_err("throttle must surface as an error");

    match error {
        RestError::RateLimited {
            retry_after_ms,
            buckets,
            shard,
            ..
        } => {
            assert_eq!(retry_after_ms, Some(5000));
            assert_eq!(shard, 3);
            assert!(buckets.iter().any(|bucket| bucket == "global"), "{buckets:?}");
            assert!(
                buckets.iter().any(|bucket| bucket == "channel-send:42"),
                "{buckets:?}"
            );
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
    // The scheduler never retries a 429 on its own.
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_attachment_switches_to_multipart() {
    let (state, observed_rx) = ObservedState::new();
    let app = Router::new()
        .route("/v6/channels/:id/messages", post(multipart_handler))
        .with_state(state);
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let dispatcher = dispatcher(addr, true);
    dispatcher
        .request(
            Method::Post,
            "/channels/42/messages",
            RequestOptions::authenticated()
                .with_body(json!({ "content": "see attachment" }))
                .with_file("report.txt", b"file-bytes".to_vec()),
        )
        .await
        .expect("multipart upload succeeds");

    let observed = timeout(Duration::from_secs(2), observed_rx)
        .await
        .expect("timed out waiting for multipart observation")
        .expect("observation channel closed")
        .expect("multipart assertions failed");
    assert_eq!(
        observed.get("file_name").and_then(Value::as_str),
        Some("report.txt")
    );
    assert_eq!(
        observed.get("file_len").and_then(Value::as_u64),
        Some(10)
    );
    assert_eq!(
        observed
            .get("payload_json")
            .and_then(|payload| payload.get("content"))
            .and_then(Value::as_str),
        Some("see attachment")
    );

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gateway_discovery_parses_the_url() {
    let app = Router::new().route(
        "/v6/gateway",
        get(|headers: HeaderMap| async move {
            if auth_header(&headers).as_deref() != Some(&format!("Bot {TEST_TOKEN}")) {
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({ "message": "unauthorized" })),
                );
            }
            (StatusCode::OK, Json(json!({ "url": "wss://gw.quill.test" })))
        }),
    );
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let dispatcher = dispatcher(addr, true);
    let url = dispatcher.get_gateway().await.expect("gateway discovery");
    assert_eq!(url, "wss://gw.quill.test");

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_statuses_carry_the_server_message() {
    let app = Router::new().route(
        "/v6/users/@me",
        patch(|| async {
            (
                StatusCode::FORBIDDEN,
                Json(json!({ "message": "Missing Permissions" })),
            )
        }),
    );
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let dispatcher = dispatcher(addr, false);
    let error = dispatcher
        .request(
            Method::Patch,
            "/users/@me",
            RequestOptions::authenticated().with_body(json!({ "username": "nope" })),
        )
        .await
        .expect_err("forbidden must error");

    match error {
        RestError::HttpStatus { status, body } => {
            assert_eq!(status, StatusCode::FORBIDDEN);
            assert_eq!(body, "Missing Permissions");
        }
        other => panic!("expected HttpStatus, got {other:?}"),
    }

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

async fn message_handler(
    State(state): State<ObservedState>,
    Path(_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    if auth_header(&headers).as_deref() != Some(&format!("Bot {TEST_TOKEN}")) {
        state
            .report(Err("missing or invalid authorization header".to_string()))
            .await;
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "unauthorized" })),
        );
    }
    let user_agent_ok = headers
        .get("user-agent")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("quill-sdk/"));
    if !user_agent_ok {
        state.report(Err("missing quill-sdk user agent".to_string())).await;
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": "bad user agent" })),
        );
    }

    state.report(Ok(payload.clone())).await;
    (
        StatusCode::OK,
        Json(json!({
            "id": "9000",
            "channel_id": "42",
            "content": payload.get("content").cloned().unwrap_or(Value::Null),
        })),
    )
}

async fn multipart_handler(
    State(state): State<ObservedState>,
    Path(_id): Path<String>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let mut file_name = None;
    let mut file_len = None;
    let mut payload_json = None;

    while let Ok(Some(field)) = multipart.next_field().await {
        match field.name() {
            Some("file") => {
                file_name = field.file_name().map(str::to_string);
                file_len = field.bytes().await.ok().map(|bytes| bytes.len());
            }
            Some("payload_json") => {
                payload_json = field
                    .text()
                    .await
                    .ok()
                    .and_then(|text| serde_json::from_str::<Value>(&text).ok());
            }
            _ => {}
        }
    }

    state
        .report(Ok(json!({
            "file_name": file_name,
            "file_len": file_len,
            "payload_json": payload_json,
        })))
        .await;
    (StatusCode::OK, Json(json!({ "id": "9001", "channel_id": "42" })))
}

fn auth_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}
