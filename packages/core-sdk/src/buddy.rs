use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, RwLock,
};

use anyhow::Result;
use rusqlite::Connection;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::BuddyConfig;
use crate::db::{self, SqliteStore};
use crate::llm::{single_turn, CompletionApi, CompletionOutcome, OpenAiClient, PROBE_CONTENT};
use crate::models::{ChatMessage, Credential, Identity, MessageId, Notice, Role};
use crate::ports::{CredentialStore, Notifier, ProfileSource};
use crate::render::{render_code_fences, render_failure, CONNECTION_ERROR};
use crate::telemetry;

pub const KEY_REQUIRED: &str = "api key is required";
pub const KEY_INVALID: &str = "api key is invalid";

const EVENT_CAPACITY: usize = 256;

/**
 * \brief 提问阶段被本地拦截的错误。
 */
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AskError {
    #[error("Please enter some text to ask from buddy!")]
    EmptyQuery,
    #[error("no api key configured, save one first")]
    NoCredential,
}

/**
 * \brief 保存按钮的对齐位置，随 Key 校验结果切换。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveAlignment {
    Bottom,
    Center,
}

/**
 * \brief API Key 输入框的可见状态。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyFieldState {
    /** \brief 校验提示，None 表示有效 */
    pub validity: Option<String>,
    pub alignment: SaveAlignment,
}

impl Default for KeyFieldState {
    fn default() -> Self {
        Self {
            validity: None,
            alignment: SaveAlignment::Bottom,
        }
    }
}

impl KeyFieldState {
    fn invalid(message: &str) -> Self {
        Self {
            validity: Some(message.to_string()),
            alignment: SaveAlignment::Center,
        }
    }
}

/**
 * \brief Key 保存流程的结果。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyOutcome {
    /** \brief 输入为空，未发请求 */
    Required,
    /** \brief 校验通过并已写入配置记录 */
    Saved,
    /** \brief 校验通过但写入失败，仅在内存中生效 */
    Unsaved,
    /** \brief API 拒绝该 Key */
    Invalid,
    /** \brief 校验请求未能完成 */
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyCapture {
    pub outcome: KeyOutcome,
    pub field: KeyFieldState,
}

/**
 * \brief 一次问答的终态。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExchangeState {
    Rendered { replies: usize },
    ApiError,
    TransportError,
}

/**
 * \brief 问答结束后的汇总：终态与本次追加的助手消息。
 */
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeReport {
    #[serde(flatten)]
    pub state: ExchangeState,
    pub appended: Vec<ChatMessage>,
}

/**
 * \brief 计数式忙碌标记，drop 时自动归还。
 */
struct BusyGuard(Arc<AtomicUsize>);

impl BusyGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Inner {
    api: Arc<dyn CompletionApi>,
    keys: Arc<dyn CredentialStore>,
    profiles: Arc<dyn ProfileSource>,
    notifier: Arc<dyn Notifier>,
    credential: RwLock<Option<Credential>>,
    transcript: Mutex<Vec<ChatMessage>>,
    identity: RwLock<Identity>,
    key_field: Mutex<KeyFieldState>,
    in_flight: Arc<AtomicUsize>,
    saving_key: Arc<AtomicUsize>,
    events: broadcast::Sender<ChatMessage>,
}

/**
 * \brief 聊天小部件控制器：持有对话记录、当前 Key 与身份信息。
 *
 * 克隆代价很低，所有克隆共享同一份状态。
 */
#[derive(Clone)]
pub struct Buddy {
    inner: Arc<Inner>,
}

impl Buddy {
    pub fn new(
        api: Arc<dyn CompletionApi>,
        keys: Arc<dyn CredentialStore>,
        profiles: Arc<dyn ProfileSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                api,
                keys,
                profiles,
                notifier,
                credential: RwLock::new(None),
                transcript: Mutex::new(Vec::new()),
                identity: RwLock::new(Identity::default()),
                key_field: Mutex::new(KeyFieldState::default()),
                in_flight: Arc::new(AtomicUsize::new(0)),
                saving_key: Arc::new(AtomicUsize::new(0)),
                events,
            }),
        }
    }

    /**
     * \brief 初始化：读取已保存的 Key 与当前用户资料。失败只记录日志。
     */
    pub fn connect(&self) {
        match self.inner.keys.load_key() {
            Ok(Some(key)) => {
                self.set_credential(Some(key));
                telemetry::log_event("buddy.key", "loaded stored api key");
            }
            Ok(None) => telemetry::log_event("buddy.key", "no stored api key"),
            Err(e) => telemetry::log_error(
                "buddy.key",
                &format!("error while reading configuration record: {}", e),
            ),
        }
        self.refresh_identity();
    }

    /**
     * \brief 重新读取用户资料，刷新显示名与缩写。
     */
    pub fn refresh_identity(&self) {
        match self.inner.profiles.current_user() {
            Ok(Some(profile)) => {
                if let Ok(mut identity) = self.inner.identity.write() {
                    *identity = Identity::from_profile(&profile);
                }
            }
            Ok(None) => {}
            Err(e) => telemetry::log_error(
                "buddy.profile",
                &format!("error in reading current user info: {}", e),
            ),
        }
    }

    pub fn identity(&self) -> Identity {
        self.inner
            .identity
            .read()
            .map(|i| i.clone())
            .unwrap_or_default()
    }

    pub fn has_key(&self) -> bool {
        self.credential().is_some()
    }

    fn credential(&self) -> Option<Credential> {
        self.inner.credential.read().ok().and_then(|c| c.clone())
    }

    fn set_credential(&self, key: Option<Credential>) -> Option<Credential> {
        match self.inner.credential.write() {
            Ok(mut guard) => std::mem::replace(&mut *guard, key),
            Err(_) => None,
        }
    }

    /**
     * \brief 仅当当前 Key 仍是 `candidate` 时才回退，避免覆盖其他保存操作的结果。
     */
    fn restore_credential(&self, candidate: &Credential, previous: Option<Credential>) {
        if let Ok(mut guard) = self.inner.credential.write() {
            if guard.as_ref() == Some(candidate) {
                *guard = previous;
            }
        }
    }

    pub fn key_field(&self) -> KeyFieldState {
        self.inner
            .key_field
            .lock()
            .map(|k| k.clone())
            .unwrap_or_default()
    }

    fn set_key_field(&self, state: KeyFieldState) -> KeyFieldState {
        if let Ok(mut guard) = self.inner.key_field.lock() {
            *guard = state.clone();
        }
        state
    }

    pub fn is_saving_key(&self) -> bool {
        self.inner.saving_key.load(Ordering::SeqCst) > 0
    }

    /**
     * \brief 校验并保存 API Key。
     *
     * 空值直接提示 required；否则先启用候选 Key 并发送一次探测请求，
     * API 接受后写入配置记录。写入失败只记录日志，内存中的 Key 仍然生效。
     */
    pub async fn save_api_key(&self, candidate: &str) -> KeyCapture {
        let candidate = candidate.trim();
        if candidate.is_empty() {
            return KeyCapture {
                outcome: KeyOutcome::Required,
                field: self.set_key_field(KeyFieldState::invalid(KEY_REQUIRED)),
            };
        }

        let _busy = BusyGuard::enter(&self.inner.saving_key);
        let candidate = Credential::new(candidate);
        let previous = self.set_credential(Some(candidate.clone()));

        let check = single_turn(Role::User, PROBE_CONTENT);
        let outcome = match self.inner.api.complete(&candidate, &check).await {
            CompletionOutcome::Success { .. } => match self.inner.keys.save_key(&candidate) {
                Ok(()) => {
                    telemetry::log_event("buddy.key", "api key validated and saved");
                    KeyOutcome::Saved
                }
                Err(e) => {
                    telemetry::log_warn(
                        "buddy.key",
                        &format!("error while creating configuration record: {}", e),
                    );
                    KeyOutcome::Unsaved
                }
            },
            CompletionOutcome::ApiError { message } => {
                telemetry::log_warn("buddy.key", &format!("api key rejected: {}", message));
                self.restore_credential(&candidate, previous);
                KeyOutcome::Invalid
            }
            CompletionOutcome::TransportError { reason } => {
                telemetry::log_error(
                    "buddy.key",
                    &format!("api key validation request failed: {}", reason),
                );
                self.restore_credential(&candidate, previous);
                KeyOutcome::Unreachable
            }
        };

        let field = match outcome {
            KeyOutcome::Saved | KeyOutcome::Unsaved => self.set_key_field(KeyFieldState::default()),
            KeyOutcome::Invalid => self.set_key_field(KeyFieldState::invalid(KEY_INVALID)),
            KeyOutcome::Required | KeyOutcome::Unreachable => self.key_field(),
        };
        KeyCapture { outcome, field }
    }

    /** \brief 当前未完成的问答数。 */
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight() > 0
    }

    /** \brief 对话记录快照。 */
    pub fn transcript(&self) -> Vec<ChatMessage> {
        self.inner
            .transcript
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    /**
     * \brief 订阅新追加的消息。
     */
    pub fn subscribe(&self) -> broadcast::Receiver<ChatMessage> {
        self.inner.events.subscribe()
    }

    fn append(&self, messages: &[ChatMessage]) {
        if messages.is_empty() {
            return;
        }
        // 持锁推送，保证订阅者看到的顺序与记录一致。
        if let Ok(mut transcript) = self.inner.transcript.lock() {
            transcript.extend_from_slice(messages);
            for m in messages {
                let _ = self.inner.events.send(m.clone());
            }
        }
    }

    /**
     * \brief 提交输入框内容：立即追加用户消息并清空输入，返回待完成的问答。
     */
    pub fn submit(&self, input: &mut String) -> Result<PendingExchange, AskError> {
        if input.trim().is_empty() {
            self.inner.notifier.notify(Notice::missing_query());
            return Err(AskError::EmptyQuery);
        }
        let credential = self.credential().ok_or(AskError::NoCredential)?;

        let query = std::mem::take(input);
        let user_message = ChatMessage::user(query.clone());
        let user_message_id = user_message.id;
        let busy = BusyGuard::enter(&self.inner.in_flight);
        self.append(&[user_message]);

        Ok(PendingExchange {
            buddy: self.clone(),
            credential,
            query,
            user_message_id,
            _busy: busy,
        })
    }

    /**
     * \brief submit + settle 的便捷组合。
     */
    pub async fn ask(&self, query: &str) -> Result<ExchangeReport, AskError> {
        let mut input = query.to_string();
        Ok(self.submit(&mut input)?.settle().await)
    }
}

/**
 * \brief 以 SQLite 平台记录 + OpenAI 客户端组装控制器，并完成初始化读取。
 */
pub fn build_sqlite_buddy(
    config: &BuddyConfig,
    conn: Connection,
    notifier: Arc<dyn Notifier>,
) -> Result<Buddy> {
    db::migrate(&conn)?;
    let store = Arc::new(SqliteStore::new(conn));
    let api = Arc::new(OpenAiClient::new(&config.endpoint, &config.model)?);
    let buddy = Buddy::new(api, store.clone(), store, notifier);
    buddy.connect();
    Ok(buddy)
}

/**
 * \brief 已发出、尚未完成的一次问答。drop 时同样归还忙碌计数。
 */
pub struct PendingExchange {
    buddy: Buddy,
    credential: Credential,
    query: String,
    user_message_id: MessageId,
    _busy: BusyGuard,
}

impl PendingExchange {
    pub fn user_message_id(&self) -> MessageId {
        self.user_message_id
    }

    /**
     * \brief 发送请求并把结果追加到对话记录；不做任何重试。
     */
    pub async fn settle(self) -> ExchangeReport {
        let messages = single_turn(Role::User, &self.query);
        let outcome = self
            .buddy
            .inner
            .api
            .complete(&self.credential, &messages)
            .await;

        let (state, appended) = match outcome {
            CompletionOutcome::Success { choices, .. } => {
                let replies: Vec<ChatMessage> = choices
                    .into_iter()
                    .filter_map(|c| c.content)
                    .map(|c| ChatMessage::assistant(render_code_fences(&c)))
                    .collect();
                (
                    ExchangeState::Rendered {
                        replies: replies.len(),
                    },
                    replies,
                )
            }
            CompletionOutcome::ApiError { message } => {
                telemetry::log_warn("buddy.chat", &format!("api error: {}", message));
                (
                    ExchangeState::ApiError,
                    vec![ChatMessage::failure(render_failure(&message))],
                )
            }
            CompletionOutcome::TransportError { reason } => {
                telemetry::log_error("buddy.chat", &format!("connection error: {}", reason));
                (
                    ExchangeState::TransportError,
                    vec![ChatMessage::failure(render_failure(CONNECTION_ERROR))],
                )
            }
        };

        self.buddy.append(&appended);
        ExchangeReport { state, appended }
    }
}
