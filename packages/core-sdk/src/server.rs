use std::{convert::Infallible, sync::Arc};

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, get_service, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tower_http::services::ServeDir;

use crate::{
    buddy::{AskError, Buddy, ExchangeReport, KeyCapture, KeyFieldState},
    models::{ChatMessage, Identity, Notice},
    ports::QueuedNotifier,
    telemetry,
};

/**
 * \brief 路由共享状态：控制器 + 待拉取的通知队列。
 */
#[derive(Clone)]
pub struct AppState {
    pub buddy: Buddy,
    pub notices: Arc<QueuedNotifier>,
}

/**
 * \brief 构建 API 路由与静态页面。
 */
pub fn router(state: AppState) -> Router {
    let ui_root = std::env::var("ASKMEBUDDY_UI_DIR").unwrap_or_else(|_| "web".to_string());
    let static_service = get_service(ServeDir::new(ui_root).append_index_html_on_directories(true));

    Router::new()
        .route("/api/identity", get(get_identity))
        .route("/api/status", get(get_status))
        .route("/api/transcript", get(get_transcript))
        .route("/api/ask", post(ask))
        .route("/api/key", get(get_key_field).post(save_key))
        .route("/api/notices", get(drain_notices))
        .route("/api/events", get(events))
        .fallback_service(static_service)
        .with_state(state)
}

/**
 * \brief 启动本地 HTTP 服务，提供聊天页面与 API。
 * \param addr 监听地址，如 "127.0.0.1:5174"
 */
pub async fn run(addr: &str, state: AppState) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on http://{}", addr);
    telemetry::log_event("server", &format!("listening on {}", addr));
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Serialize, Debug)]
struct StatusDto {
    has_key: bool,
    is_loading: bool,
    in_flight: usize,
    is_saving_key: bool,
}

#[derive(Deserialize, Debug)]
struct AskRequest {
    /** \brief 用户输入的问题 */
    query: String,
}

#[derive(Serialize, Debug)]
struct AskRejected {
    error: String,
    notice: Option<Notice>,
}

#[derive(Deserialize, Debug)]
struct KeyRequest {
    #[serde(default)]
    api_key: String,
}

async fn get_identity(State(state): State<AppState>) -> Json<Identity> {
    Json(state.buddy.identity())
}

async fn get_status(State(state): State<AppState>) -> Json<StatusDto> {
    let buddy = &state.buddy;
    Json(StatusDto {
        has_key: buddy.has_key(),
        is_loading: buddy.is_loading(),
        in_flight: buddy.in_flight(),
        is_saving_key: buddy.is_saving_key(),
    })
}

async fn get_transcript(State(state): State<AppState>) -> Json<Vec<ChatMessage>> {
    Json(state.buddy.transcript())
}

fn internal_err(e: impl std::fmt::Display) -> (StatusCode, Json<AskRejected>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(AskRejected {
            error: e.to_string(),
            notice: None,
        }),
    )
}

/**
 * \brief 提问：POST /api/ask {query}，返回本次追加的助手消息。
 *
 * 问答在独立任务中完成，客户端断开后回复仍会写入对话记录。
 */
async fn ask(
    State(state): State<AppState>,
    Json(req): Json<AskRequest>,
) -> Result<Json<ExchangeReport>, (StatusCode, Json<AskRejected>)> {
    let mut input = req.query;
    match state.buddy.submit(&mut input) {
        Ok(pending) => {
            let report = tokio::spawn(pending.settle())
                .await
                .map_err(internal_err)?;
            Ok(Json(report))
        }
        Err(e) => {
            let (status, notice) = match e {
                AskError::EmptyQuery => (StatusCode::BAD_REQUEST, Some(Notice::missing_query())),
                AskError::NoCredential => (StatusCode::CONFLICT, None),
            };
            Err((
                status,
                Json(AskRejected {
                    error: e.to_string(),
                    notice,
                }),
            ))
        }
    }
}

async fn get_key_field(State(state): State<AppState>) -> Json<KeyFieldState> {
    Json(state.buddy.key_field())
}

/**
 * \brief 保存 API Key：POST /api/key {api_key}。
 */
async fn save_key(
    State(state): State<AppState>,
    Json(req): Json<KeyRequest>,
) -> Json<KeyCapture> {
    Json(state.buddy.save_api_key(&req.api_key).await)
}

async fn drain_notices(State(state): State<AppState>) -> Json<Vec<Notice>> {
    Json(state.notices.drain())
}

/**
 * \brief 对话记录 SSE：每追加一条消息推送一个 `message` 事件。
 */
async fn events(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.buddy.subscribe();
    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(message) => match serde_json::to_string(&message) {
                    Ok(data) => {
                        yield Ok(Event::default().event("message").data(data));
                    }
                    Err(e) => {
                        telemetry::log_error("server.events", &format!("encode failed: {}", e));
                    }
                },
                Err(RecvError::Lagged(skipped)) => {
                    yield Ok(Event::default().event("lagged").data(skipped.to_string()));
                }
                Err(RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Choice, CompletionApi, CompletionOutcome};
    use crate::models::{Credential, UserProfile, WireMessage};
    use crate::ports::{CredentialStore, MemoryStore};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;

    struct EchoApi;

    #[async_trait]
    impl CompletionApi for EchoApi {
        async fn complete(
            &self,
            credential: &Credential,
            messages: &[WireMessage],
        ) -> CompletionOutcome {
            if credential.expose() == "sk-bad" {
                return CompletionOutcome::ApiError {
                    message: "bad key".into(),
                };
            }
            CompletionOutcome::Success {
                id: Some("echo".into()),
                choices: vec![Choice {
                    content: Some(format!("echo: {}", messages[0].content)),
                }],
            }
        }
    }

    async fn spawn_app(store: MemoryStore) -> (String, AppState) {
        let store = Arc::new(store);
        let notices = Arc::new(QueuedNotifier::new());
        let buddy = Buddy::new(Arc::new(EchoApi), store.clone(), store, notices.clone());
        buddy.connect();
        let state = AppState { buddy, notices };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (format!("http://{}", addr), state)
    }

    #[tokio::test]
    async fn test_identity_and_status() {
        let store = MemoryStore::with_profile(UserProfile {
            name: "Jane Doe".into(),
            alias: "jdoe".into(),
        });
        let (base, _) = spawn_app(store).await;
        let client = reqwest::Client::new();

        let identity: Value = client
            .get(format!("{}/api/identity", base))
            .send()
            .await
            .expect("identity")
            .json()
            .await
            .expect("json");
        assert_eq!(identity["initials"], "JD");

        let status: Value = client
            .get(format!("{}/api/status", base))
            .send()
            .await
            .expect("status")
            .json()
            .await
            .expect("json");
        assert_eq!(status["has_key"], false);
        assert_eq!(status["in_flight"], 0);
    }

    #[tokio::test]
    async fn test_key_then_ask() {
        let (base, state) = spawn_app(MemoryStore::new()).await;
        let client = reqwest::Client::new();

        let rejected = client
            .post(format!("{}/api/ask", base))
            .json(&json!({"query": "hello"}))
            .send()
            .await
            .expect("ask");
        assert_eq!(rejected.status(), reqwest::StatusCode::CONFLICT);

        let field: Value = client
            .post(format!("{}/api/key", base))
            .json(&json!({"api_key": "sk-bad"}))
            .send()
            .await
            .expect("key")
            .json()
            .await
            .expect("json");
        assert_eq!(field["outcome"], "invalid");
        assert_eq!(field["field"]["validity"], "api key is invalid");
        assert_eq!(field["field"]["alignment"], "center");

        let field: Value = client
            .post(format!("{}/api/key", base))
            .json(&json!({"api_key": "sk-good"}))
            .send()
            .await
            .expect("key")
            .json()
            .await
            .expect("json");
        assert_eq!(field["outcome"], "saved");
        assert_eq!(field["field"]["validity"], Value::Null);

        let report: Value = client
            .post(format!("{}/api/ask", base))
            .json(&json!({"query": "hello"}))
            .send()
            .await
            .expect("ask")
            .json()
            .await
            .expect("json");
        assert_eq!(report["state"], "rendered");
        assert_eq!(report["replies"], 1);
        assert_eq!(report["appended"][0]["content"], "echo: hello");

        let transcript: Vec<ChatMessage> = client
            .get(format!("{}/api/transcript", base))
            .send()
            .await
            .expect("transcript")
            .json()
            .await
            .expect("json");
        assert_eq!(transcript.len(), 2);
        assert_eq!(state.buddy.transcript(), transcript);
    }

    #[tokio::test]
    async fn test_empty_query_returns_notice() {
        let store = MemoryStore::new();
        store.save_key(&Credential::new("sk-good")).expect("seed");
        let (base, _) = spawn_app(store).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/api/ask", base))
            .json(&json!({"query": ""}))
            .send()
            .await
            .expect("ask");
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: Value = resp.json().await.expect("json");
        assert_eq!(
            body["notice"]["message"],
            "Please enter some text to ask from buddy!"
        );

        // 队列中的通知留给 /api/notices 拉取。
        let notices: Vec<Notice> = reqwest::Client::new()
            .get(format!("{}/api/notices", base))
            .send()
            .await
            .expect("notices")
            .json()
            .await
            .expect("json");
        assert_eq!(notices, vec![Notice::missing_query()]);
    }

    /** 延迟作答，用于模拟慢速上游。 */
    struct SlowApi;

    #[async_trait]
    impl CompletionApi for SlowApi {
        async fn complete(
            &self,
            _credential: &Credential,
            messages: &[WireMessage],
        ) -> CompletionOutcome {
            tokio::time::sleep(Duration::from_millis(300)).await;
            CompletionOutcome::Success {
                id: None,
                choices: vec![Choice {
                    content: Some(format!("late: {}", messages[0].content)),
                }],
            }
        }
    }

    #[tokio::test]
    async fn test_reply_lands_after_client_disconnects() {
        let store = Arc::new(MemoryStore::new());
        store.save_key(&Credential::new("sk-good")).expect("seed");
        let notices = Arc::new(QueuedNotifier::new());
        let buddy = Buddy::new(Arc::new(SlowApi), store.clone(), store, notices.clone());
        buddy.connect();
        let state = AppState { buddy, notices };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        let result = reqwest::Client::new()
            .post(format!("http://{}/api/ask", addr))
            .timeout(Duration::from_millis(50))
            .json(&json!({"query": "hello"}))
            .send()
            .await;
        assert!(result.is_err());

        let mut contents = Vec::new();
        for _ in 0..40 {
            contents = state
                .buddy
                .transcript()
                .into_iter()
                .map(|m| m.content)
                .collect::<Vec<_>>();
            if contents.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(contents, vec!["hello", "late: hello"]);
        assert_eq!(state.buddy.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_events_stream_pushes_appends() {
        use futures_util::StreamExt;

        let store = MemoryStore::new();
        store.save_key(&Credential::new("sk-good")).expect("seed");
        let (base, state) = spawn_app(store).await;
        let client = reqwest::Client::new();

        let resp = client
            .get(format!("{}/api/events", base))
            .send()
            .await
            .expect("events");
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let mut body = resp.bytes_stream();

        state.buddy.ask("ping").await.expect("ask");

        let mut seen = String::new();
        while !seen.contains("echo: ping") {
            let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
                .await
                .expect("event in time")
                .expect("stream open")
                .expect("chunk");
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }
        assert!(seen.contains("event: message"));
        assert!(seen.find("ping").unwrap() < seen.find("echo: ping").unwrap());
    }
}
