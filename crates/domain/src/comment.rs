use crate::errors::{optional_text, require_text, DomainError};
use crate::identifiers::{CommentId, TaskId, ThreadId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// タスク作成時に用意されるスレッド名
pub const DEFAULT_THREAD_NAME: &str = "メイン";
/// スレッド名の最大文字数
pub const MAX_THREAD_NAME_LENGTH: usize = 50;
/// コメント本文の最大文字数
pub const MAX_COMMENT_LENGTH: usize = 2000;

/// タスク内のチャットスレッド
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatThread {
    pub id: ThreadId,
    pub task_id: TaskId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl ChatThread {
    pub fn new(task_id: TaskId, name: &str, now: DateTime<Utc>) -> Result<Self, DomainError> {
        Ok(Self {
            id: ThreadId::new(),
            task_id,
            name: require_text("name", name, MAX_THREAD_NAME_LENGTH)?,
            created_at: now,
        })
    }

    /// メインスレッド
    pub fn main(task_id: TaskId, now: DateTime<Utc>) -> Self {
        Self {
            id: ThreadId::new(),
            task_id,
            name: DEFAULT_THREAD_NAME.to_string(),
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Normal,
    System,
}

/// コメント投稿パラメータ
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewComment {
    #[serde(default)]
    pub content: Option<String>,
    /// 添付ファイルの参照（保存先は外部）
    #[serde(default)]
    pub attachment: Option<String>,
    #[serde(default)]
    pub thread_id: Option<ThreadId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub task_id: TaskId,
    pub author: UserId,
    pub content: Option<String>,
    pub attachment: Option<String>,
    pub thread_id: Option<ThreadId>,
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
}

impl Comment {
    /// 通常コメントを作成（本文か添付のどちらかが必要）
    pub fn new(
        task_id: TaskId,
        author: UserId,
        params: NewComment,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let content = optional_text(params.content);
        let attachment = optional_text(params.attachment);
        if content.is_none() && attachment.is_none() {
            return Err(DomainError::Validation(
                "comment needs content or an attachment".to_string(),
            ));
        }
        if let Some(text) = &content {
            require_text("content", text, MAX_COMMENT_LENGTH)?;
        }

        Ok(Self {
            id: CommentId::new(),
            task_id,
            author,
            content,
            attachment,
            thread_id: params.thread_id,
            message_type: MessageType::Normal,
            created_at: now,
        })
    }

    /// システムメッセージを作成
    pub fn system(
        task_id: TaskId,
        author: UserId,
        thread_id: Option<ThreadId>,
        text: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CommentId::new(),
            task_id,
            author,
            content: Some(text.into()),
            attachment: None,
            thread_id,
            message_type: MessageType::System,
            created_at: now,
        }
    }
}
