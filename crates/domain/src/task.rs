use crate::errors::{optional_text, require_text, DomainError};
use crate::identifiers::{ShareToken, TaskId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// タスク名の最大文字数
pub const MAX_TASK_TITLE_LENGTH: usize = 100;
/// カテゴリ名の最大文字数
pub const MAX_CATEGORY_LENGTH: usize = 50;

/// タスク・メンバー共通の進捗ステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    Doing,
    Done,
}

impl TaskStatus {
    /// 文字列からステータスを作成
    pub fn from_string(status: &str) -> Result<Self, DomainError> {
        match status.trim().to_lowercase().as_str() {
            "todo" => Ok(TaskStatus::Todo),
            "doing" | "active" => Ok(TaskStatus::Doing),
            "done" => Ok(TaskStatus::Done),
            _ => Err(DomainError::InvalidStatus(status.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::Doing => "doing",
            TaskStatus::Done => "done",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, TaskStatus::Done)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 繰り返し設定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceMode {
    #[default]
    None,
    Daily,
    Weekly,
    Monthly,
}

impl RecurrenceMode {
    pub fn from_string(mode: &str) -> Result<Self, DomainError> {
        match mode.trim().to_lowercase().as_str() {
            "none" | "" => Ok(RecurrenceMode::None),
            "daily" => Ok(RecurrenceMode::Daily),
            "weekly" => Ok(RecurrenceMode::Weekly),
            "monthly" => Ok(RecurrenceMode::Monthly),
            _ => Err(DomainError::InvalidRecurrenceMode(mode.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecurrenceMode::None => "none",
            RecurrenceMode::Daily => "daily",
            RecurrenceMode::Weekly => "weekly",
            RecurrenceMode::Monthly => "monthly",
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, RecurrenceMode::None)
    }
}

/// 進捗率の集計方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressMode {
    /// 完了メンバー数 / メンバー数
    #[default]
    MembershipRatio,
    /// 完了サブタスク数 / サブタスク数
    SubtaskRatio,
}

impl ProgressMode {
    pub fn from_string(mode: &str) -> Result<Self, DomainError> {
        match mode.trim().to_lowercase().as_str() {
            "membership_ratio" | "membership" => Ok(ProgressMode::MembershipRatio),
            "subtask_ratio" | "subtask" => Ok(ProgressMode::SubtaskRatio),
            _ => Err(DomainError::InvalidProgressMode(mode.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressMode::MembershipRatio => "membership_ratio",
            ProgressMode::SubtaskRatio => "subtask_ratio",
        }
    }
}

/// タスク作成パラメータ
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recurrence: RecurrenceMode,
    #[serde(default)]
    pub progress_mode: ProgressMode,
    #[serde(default)]
    pub category: Option<String>,
}

impl NewTask {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_due_at(mut self, due_at: DateTime<Utc>) -> Self {
        self.due_at = Some(due_at);
        self
    }

    pub fn with_recurrence(mut self, recurrence: RecurrenceMode) -> Self {
        self.recurrence = recurrence;
        self
    }

    pub fn with_progress_mode(mut self, progress_mode: ProgressMode) -> Self {
        self.progress_mode = progress_mode;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

/// タスク本体
///
/// `status` はメンバーシップから導出されるキャッシュであり、直接書き換えてはならない。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub recurrence: RecurrenceMode,
    pub progress_mode: ProgressMode,
    pub category: Option<String>,
    pub owner: UserId,
    pub share_token: ShareToken,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 楽観的ロック用バージョン
    pub version: u64,
    /// この完了で後続タスクを生成済みか（再度完了しても再生成しない）
    #[serde(default)]
    pub recurrence_fired: bool,
    #[serde(default)]
    pub successor_id: Option<TaskId>,
}

impl Task {
    /// 新しいタスクを作成
    pub fn new(owner: UserId, params: NewTask, now: DateTime<Utc>) -> Result<Self, DomainError> {
        let title = require_text("title", &params.title, MAX_TASK_TITLE_LENGTH)?;
        let category = validate_category(params.category)?;

        Ok(Self {
            id: TaskId::new(),
            title,
            description: optional_text(params.description),
            due_at: params.due_at,
            status: TaskStatus::Todo,
            recurrence: params.recurrence,
            progress_mode: params.progress_mode,
            category,
            owner,
            share_token: ShareToken::new(),
            created_at: now,
            updated_at: now,
            version: 1,
            recurrence_fired: false,
            successor_id: None,
        })
    }

    pub fn is_owner(&self, user_id: &UserId) -> bool {
        &self.owner == user_id
    }

    /// 編集内容を適用
    pub fn apply_updates(
        &mut self,
        updates: TaskUpdates,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if let Some(title) = updates.title {
            self.title = require_text("title", &title, MAX_TASK_TITLE_LENGTH)?;
        }
        if let Some(description) = updates.description {
            self.description = optional_text(description);
        }
        if let Some(due_at) = updates.due_at {
            self.due_at = due_at;
        }
        if let Some(recurrence) = updates.recurrence {
            self.recurrence = recurrence;
        }
        if let Some(progress_mode) = updates.progress_mode {
            self.progress_mode = progress_mode;
        }
        if let Some(category) = updates.category {
            self.category = validate_category(category)?;
        }
        self.touch(now);
        Ok(())
    }

    /// 更新時刻とバージョンを進める
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
        self.version += 1;
    }
}

fn validate_category(category: Option<String>) -> Result<Option<String>, DomainError> {
    match optional_text(category) {
        Some(name) => Ok(Some(require_text("category", &name, MAX_CATEGORY_LENGTH)?)),
        None => Ok(None),
    }
}

/// タスク更新データ
///
/// 外側の `Option` は「変更するか」、内側の `Option` は「値を消すか」を表す。
#[derive(Debug, Clone, Default)]
pub struct TaskUpdates {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub due_at: Option<Option<DateTime<Utc>>>,
    pub recurrence: Option<RecurrenceMode>,
    pub progress_mode: Option<ProgressMode>,
    pub category: Option<Option<String>>,
}

impl TaskUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_title(mut self, title: String) -> Self {
        self.title = Some(title);
        self
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = Some(description);
        self
    }

    pub fn with_due_at(mut self, due_at: Option<DateTime<Utc>>) -> Self {
        self.due_at = Some(due_at);
        self
    }

    pub fn with_recurrence(mut self, recurrence: RecurrenceMode) -> Self {
        self.recurrence = Some(recurrence);
        self
    }

    pub fn with_progress_mode(mut self, progress_mode: ProgressMode) -> Self {
        self.progress_mode = Some(progress_mode);
        self
    }

    pub fn with_category(mut self, category: Option<String>) -> Self {
        self.category = Some(category);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.due_at.is_none()
            && self.recurrence.is_none()
            && self.progress_mode.is_none()
            && self.category.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_task_status_from_string() {
        assert_eq!(TaskStatus::from_string("todo").unwrap(), TaskStatus::Todo);
        assert_eq!(TaskStatus::from_string("DOING").unwrap(), TaskStatus::Doing);
        assert_eq!(TaskStatus::from_string("active").unwrap(), TaskStatus::Doing);
        assert_eq!(TaskStatus::from_string("done").unwrap(), TaskStatus::Done);
        assert!(matches!(
            TaskStatus::from_string("finished"),
            Err(DomainError::InvalidStatus(_))
        ));
    }

    #[test]
    fn test_recurrence_mode_from_string() {
        assert_eq!(
            RecurrenceMode::from_string("monthly").unwrap(),
            RecurrenceMode::Monthly
        );
        assert!(!RecurrenceMode::from_string("none").unwrap().is_recurring());
        assert!(RecurrenceMode::from_string("yearly").is_err());
    }

    #[test]
    fn test_task_creation() {
        let owner = UserId::new();
        let task = Task::new(
            owner.clone(),
            NewTask::titled(" レポート ")
                .with_description("  ")
                .with_recurrence(RecurrenceMode::Daily),
            now(),
        )
        .unwrap();

        assert_eq!(task.title, "レポート");
        assert_eq!(task.description, None);
        assert_eq!(task.status, TaskStatus::Todo);
        assert_eq!(task.version, 1);
        assert!(task.is_owner(&owner));
        assert!(!task.recurrence_fired);

        // 空のタイトル
        assert!(Task::new(owner.clone(), NewTask::titled(""), now()).is_err());
        // 長すぎるタイトル
        assert!(Task::new(owner, NewTask::titled("a".repeat(101)), now()).is_err());
    }

    #[test]
    fn test_task_apply_updates_bumps_version() {
        let mut task = Task::new(UserId::new(), NewTask::titled("買い物"), now()).unwrap();
        let due = now() + chrono::Duration::days(2);

        task.apply_updates(
            TaskUpdates::new()
                .with_title("週末の買い物".to_string())
                .with_due_at(Some(due))
                .with_category(Some("家事".to_string())),
            now(),
        )
        .unwrap();

        assert_eq!(task.title, "週末の買い物");
        assert_eq!(task.due_at, Some(due));
        assert_eq!(task.category.as_deref(), Some("家事"));
        assert_eq!(task.version, 2);

        task.apply_updates(TaskUpdates::new().with_due_at(None), now())
            .unwrap();
        assert_eq!(task.due_at, None);
    }

    #[test]
    fn test_task_updates_builder() {
        let updates = TaskUpdates::new()
            .with_title("新しいタイトル".to_string())
            .with_description(Some("新しい説明".to_string()));

        assert_eq!(updates.title, Some("新しいタイトル".to_string()));
        assert_eq!(updates.description, Some(Some("新しい説明".to_string())));
        assert!(!updates.is_empty());
        assert!(TaskUpdates::new().is_empty());
    }
}
