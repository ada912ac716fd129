use crate::errors::{optional_text, require_text, DomainError};
use crate::identifiers::{TaskId, UserId};
use crate::task::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// ロール名の最大文字数
pub const MAX_ROLE_LENGTH: usize = 50;

/// タスクへの参加記録（タスク × ユーザーで一意）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub status: TaskStatus,
    pub role: Option<String>,
    pub joined_at: DateTime<Utc>,
}

impl Membership {
    /// 新しいメンバーシップを作成（初期ステータスは todo）
    pub fn new(task_id: TaskId, user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            task_id,
            user_id,
            status: TaskStatus::Todo,
            role: None,
            joined_at: now,
        }
    }

    /// ロールを設定
    pub fn with_role(mut self, role: Option<String>) -> Result<Self, DomainError> {
        self.role = match optional_text(role) {
            Some(name) => Some(require_text("role", &name, MAX_ROLE_LENGTH)?),
            None => None,
        };
        Ok(self)
    }

    /// 後続タスク用に複製（ステータスは todo に戻す）
    pub fn carry_over(&self, task_id: TaskId, now: DateTime<Utc>) -> Self {
        Self {
            task_id,
            user_id: self.user_id.clone(),
            status: TaskStatus::Todo,
            role: self.role.clone(),
            joined_at: now,
        }
    }
}

/// 指定ユーザーのメンバーシップを探す
pub fn find_membership<'a>(memberships: &'a [Membership], user_id: &UserId) -> Option<&'a Membership> {
    memberships.iter().find(|m| &m.user_id == user_id)
}

/// 指定ユーザーの「自分のステータス」（未参加なら None）
pub fn my_status(memberships: &[Membership], user_id: &UserId) -> Option<TaskStatus> {
    find_membership(memberships, user_id).map(|m| m.status)
}
