use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/**
 * \brief 消息角色，序列化为小写字符串，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/**
 * \brief 会话内唯一的消息标识（UUID v4）。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/**
 * \brief 对话记录中的一条消息，创建后不可变。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /** \brief 本地生成的唯一 ID */
    pub id: MessageId,
    /** \brief 角色：user/assistant */
    pub role: Role,
    /** \brief 内容，可能包含代码块等少量标记 */
    pub content: String,
    /** \brief 是否为错误提示（以失败样式展示） */
    pub failed: bool,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role: Role::User,
            content: content.into(),
            failed: false,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role: Role::Assistant,
            content: content.into(),
            failed: false,
        }
    }

    /**
     * \brief 以助手身份追加的错误消息。
     */
    pub fn failure(content: impl Into<String>) -> Self {
        Self {
            failed: true,
            ..Self::assistant(content)
        }
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }
}

/**
 * \brief 请求体中的单条消息 `{role, content}`。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: String,
}

/**
 * \brief 平台用户记录（只读）。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /** \brief 显示名称 */
    pub name: String,
    /** \brief 短别名 */
    pub alias: String,
}

/**
 * \brief 界面上展示的身份信息：显示名 + 两位大写缩写。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub display_name: String,
    pub initials: String,
}

impl Identity {
    pub fn from_profile(profile: &UserProfile) -> Self {
        let initials: String = profile.alias.chars().take(2).collect();
        Self {
            display_name: profile.name.clone(),
            initials: initials.to_uppercase(),
        }
    }
}

/**
 * \brief API Key。Debug 输出不会泄露明文。
 */
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /**
     * \brief 生成 Authorization 请求头的值。
     */
    pub fn authorization(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeVariant {
    Info,
    Success,
    Warning,
    Error,
}

/**
 * \brief 通知的消失方式：dismissible 可手动关闭，pester 自动消失，sticky 需手动关闭。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeMode {
    Dismissible,
    Pester,
    Sticky,
}

/**
 * \brief Toast 风格的用户通知。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub title: String,
    pub message: String,
    pub variant: NoticeVariant,
    pub mode: NoticeMode,
}

impl Notice {
    /**
     * \brief 提问内容为空时的提示。
     */
    pub fn missing_query() -> Self {
        Self {
            title: "value missing".to_string(),
            message: "Please enter some text to ask from buddy!".to_string(),
            variant: NoticeVariant::Error,
            mode: NoticeMode::Pester,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_initials_from_alias() {
        let id = Identity::from_profile(&UserProfile {
            name: "Jane Doe".into(),
            alias: "jdoe".into(),
        });
        assert_eq!(id.display_name, "Jane Doe");
        assert_eq!(id.initials, "JD");

        let short = Identity::from_profile(&UserProfile {
            name: "X".into(),
            alias: "x".into(),
        });
        assert_eq!(short.initials, "X");
    }

    #[test]
    fn test_message_ids_unique() {
        let ids: HashSet<MessageId> = (0..1000).map(|_| MessageId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let key = Credential::new("sk-secret");
        assert_eq!(format!("{:?}", key), "Credential(***)");
        assert_eq!(key.authorization(), "Bearer sk-secret");
    }

    #[test]
    fn test_failure_message_is_assistant() {
        let m = ChatMessage::failure("boom");
        assert!(m.is_assistant());
        assert!(m.failed);
        let json = serde_json::to_value(&m).expect("serialize");
        assert_eq!(json["role"], "assistant");
    }
}
