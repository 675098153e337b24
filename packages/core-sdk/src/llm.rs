use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};

use crate::models::{Credential, Role, WireMessage};

/** \brief 默认的 Chat Completions 地址。 */
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
/** \brief 默认模型。 */
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
/** \brief 校验 API Key 时发送的探测内容。 */
pub const PROBE_CONTENT: &str = "test";

/**
 * \brief 单个候选回复；content 缺失时由调用方跳过。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub content: Option<String>,
}

/**
 * \brief 一次请求的结果：成功 / API 报错 / 网络层失败。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    Success {
        id: Option<String>,
        choices: Vec<Choice>,
    },
    ApiError {
        message: String,
    },
    TransportError {
        reason: String,
    },
}

/**
 * \brief Chat Completions 调用端口，便于在测试中替换。
 */
#[async_trait]
pub trait CompletionApi: Send + Sync {
    async fn complete(&self, credential: &Credential, messages: &[WireMessage])
        -> CompletionOutcome;
}

/**
 * \brief 基于 reqwest 的 OpenAI Chat Completions 客户端。
 */
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            endpoint: endpoint.into(),
            model: model.into(),
        })
    }

    async fn post(&self, credential: &Credential, messages: &[WireMessage]) -> Result<Value> {
        let body = json!({
            "model": self.model,
            "messages": messages,
        });

        // 不按状态码判错：401 等响应体里同样带 error.message。
        let resp = self
            .http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, credential.authorization())
            .json(&body)
            .send()
            .await?;
        Ok(resp.json::<Value>().await?)
    }
}

#[async_trait]
impl CompletionApi for OpenAiClient {
    async fn complete(
        &self,
        credential: &Credential,
        messages: &[WireMessage],
    ) -> CompletionOutcome {
        match self.post(credential, messages).await {
            Ok(v) => parse_completion(&v),
            Err(e) => CompletionOutcome::TransportError {
                reason: e.to_string(),
            },
        }
    }
}

/**
 * \brief 构造单轮请求消息，不携带历史记录。
 */
pub fn single_turn(role: Role, content: &str) -> Vec<WireMessage> {
    vec![WireMessage {
        role,
        content: content.to_string(),
    }]
}

/**
 * \brief 把响应 JSON 解析为 CompletionOutcome。
 */
pub fn parse_completion(v: &Value) -> CompletionOutcome {
    if let Some(err) = v.get("error").filter(|e| !e.is_null()) {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .or_else(|| err.as_str())
            .unwrap_or("unknown error")
            .to_string();
        return CompletionOutcome::ApiError { message };
    }

    let id = v.get("id").and_then(|i| i.as_str()).map(|s| s.to_string());
    let choices = v
        .get("choices")
        .and_then(|c| c.as_array())
        .map(|arr| {
            arr.iter()
                .map(|c| Choice {
                    content: c
                        .get("message")
                        .and_then(|m| m.get("content"))
                        .and_then(|c| c.as_str())
                        .map(|s| s.to_string()),
                })
                .collect()
        })
        .unwrap_or_default();
    CompletionOutcome::Success { id, choices }
}
