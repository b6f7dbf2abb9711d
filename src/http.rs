use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{LokiMcpError, Result};
use crate::mcp::{process_request, RpcRequest};
use crate::service::LokiService;

type Sessions = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Event>>>>;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<LokiService>,
    pub sessions: Sessions,
    next_session: Arc<AtomicU64>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> axum::response::Response {
        (StatusCode::BAD_REQUEST, Json(self)).into_response()
    }
}

impl AppState {
    pub fn new(service: Arc<LokiService>) -> Self {
        Self {
            service,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_session: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn session_count(&self) -> usize {
        lock_read(&self.sessions).len()
    }
}

/// SSE 事件流；客户端断开时 axum 丢弃响应体，随之注销会话
struct SessionStream {
    inner: UnboundedReceiverStream<Event>,
    session_id: String,
    sessions: Sessions,
}

impl Stream for SessionStream {
    type Item = std::result::Result<Event, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx).map(|ev| ev.map(Ok))
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        lock_write(&self.sessions).remove(&self.session_id);
        debug!(session_id = %self.session_id, "SSE session closed");
    }
}

async fn sse_handler(State(state): State<AppState>) -> Sse<SessionStream> {
    let (tx, rx) = mpsc::unbounded_channel();
    let seq = state.next_session.fetch_add(1, Ordering::Relaxed);
    let session_id = format!(
        "{:x}{:04x}",
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0),
        seq
    );

    // 第一个事件告知客户端 POST 消息的地址
    let endpoint_url = format!("/message?session_id={session_id}");
    let _ = tx.send(Event::default().event("endpoint").data(endpoint_url));

    lock_write(&state.sessions).insert(session_id.clone(), tx);
    info!(session_id = %session_id, "SSE session opened");

    let stream = SessionStream {
        inner: UnboundedReceiverStream::new(rx),
        session_id,
        sessions: state.sessions.clone(),
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Deserialize)]
struct MessageQuery {
    session_id: String,
}

async fn message_handler(
    State(state): State<AppState>,
    Query(q): Query<MessageQuery>,
    payload: std::result::Result<Json<RpcRequest>, JsonRejection>,
) -> impl IntoResponse {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(e) => {
            return ErrorResponse {
                error: format!("invalid request body: {e}"),
            }
            .into_response()
        }
    };

    let sender = lock_read(&state.sessions).get(&q.session_id).cloned();
    let Some(sender) = sender else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let service = state.service.clone();
    let sessions = state.sessions.clone();
    tokio::spawn(async move {
        let Some(resp) = process_request(service, req).await else {
            return;
        };
        match serde_json::to_string(&resp) {
            Ok(json) => {
                if sender.send(Event::default().event("message").data(json)).is_err() {
                    debug!(session_id = %q.session_id, "SSE client gone, dropping session");
                    lock_write(&sessions).remove(&q.session_id);
                }
            }
            Err(e) => warn!("failed to encode response: {e}"),
        }
    });
    StatusCode::ACCEPTED.into_response()
}

async fn health_handler() -> &'static str {
    "ok"
}

fn lock_read(
    sessions: &Sessions,
) -> std::sync::RwLockReadGuard<'_, HashMap<String, mpsc::UnboundedSender<Event>>> {
    sessions.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_write(
    sessions: &Sessions,
) -> std::sync::RwLockWriteGuard<'_, HashMap<String, mpsc::UnboundedSender<Event>>> {
    sessions.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn build_router(service: Arc<LokiService>) -> Router {
    router_with_state(AppState::new(service))
}

pub fn router_with_state(state: AppState) -> Router {
    Router::new()
        .route("/sse", get(sse_handler))
        .route("/message", post(message_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

pub async fn serve_http(service: Arc<LokiService>, server: &ServerConfig) -> Result<()> {
    let router = build_router(service);
    let addr = server.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| LokiMcpError::ConfigError(format!("bind {addr} failed: {e}")))?;
    info!("SSE transport listening on http://{addr}/sse");
    axum::serve(listener, router).await.map_err(|e| e.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;
    use tower::util::ServiceExt;

    use crate::grafana::GrafanaClient;

    fn create_test_service() -> Arc<LokiService> {
        let client = GrafanaClient::new("http://127.0.0.1:9", "k", Duration::from_millis(200)).unwrap();
        Arc::new(LokiService::new(client))
    }

    async fn next_chunk(body: &mut (impl Stream<Item = std::result::Result<axum::body::Bytes, axum::Error>> + Unpin)) -> String {
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("SSE event in time")
            .expect("stream open")
            .unwrap();
        String::from_utf8(chunk.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint() {
        let app = build_router(create_test_service());
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn message_to_unknown_session_is_404() {
        let app = build_router(create_test_service());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/message?session_id=nope")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_message_body_returns_400() {
        let app = build_router(create_test_service());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/message?session_id=whatever")
                    .header("content-type", "application/json")
                    .body(Body::from("not-json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn sse_session_round_trip() {
        let app = build_router(create_test_service());

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/sse").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "text/event-stream");
        let mut events = Box::pin(resp.into_body().into_data_stream());

        let first = next_chunk(&mut events).await;
        assert!(first.contains("event: endpoint"), "{first}");
        let endpoint = first
            .lines()
            .find_map(|l| l.strip_prefix("data: "))
            .expect("endpoint data")
            .to_string();
        assert!(endpoint.starts_with("/message?session_id="));

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(endpoint)
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"jsonrpc": "2.0", "id": 7, "method": "ping"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let second = next_chunk(&mut events).await;
        assert!(second.contains("event: message"), "{second}");
        assert!(second.contains(r#""id":7"#), "{second}");
    }

    #[tokio::test]
    async fn disconnected_sse_clients_leave_no_sessions() {
        let state = AppState::new(create_test_service());
        let app = router_with_state(state.clone());

        let mut open = Vec::new();
        for _ in 0..3 {
            let resp = app
                .clone()
                .oneshot(Request::builder().uri("/sse").body(Body::empty()).unwrap())
                .await
                .unwrap();
            let mut events = Box::pin(resp.into_body().into_data_stream());
            assert!(next_chunk(&mut events).await.contains("event: endpoint"));
            open.push(events);
        }
        assert_eq!(state.session_count(), 3);

        open.pop();
        assert_eq!(state.session_count(), 2);
        drop(open);
        assert_eq!(state.session_count(), 0);
    }
}
