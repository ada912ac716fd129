use crate::errors::{require_text, DomainError};
use crate::identifiers::{SubtaskId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// サブタスク名の最大文字数
pub const MAX_SUBTASK_TITLE_LENGTH: usize = 100;

/// タスクを分解した作業項目（WBS）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: SubtaskId,
    pub task_id: TaskId,
    pub title: String,
    pub done: bool,
    pub created_at: DateTime<Utc>,
}

impl Subtask {
    pub fn new(task_id: TaskId, title: &str, now: DateTime<Utc>) -> Result<Self, DomainError> {
        Ok(Self {
            id: SubtaskId::new(),
            task_id,
            title: require_text("title", title, MAX_SUBTASK_TITLE_LENGTH)?,
            done: false,
            created_at: now,
        })
    }

    /// 完了フラグを反転し、反転後の値を返す
    pub fn toggle(&mut self) -> bool {
        self.done = !self.done;
        self.done
    }
}
