//! ボード表示用の読み取りモデル

use crate::store::BoardStore;
use chrono::{DateTime, Utc};
use domain::{
    board_completion, ensure_member, is_overdue, my_status, task_progress, urgency, BoardEvent,
    ChatThread, Clock, Comment, DomainError, Invitation, Membership, Subtask, Task, TaskId,
    TaskStatus, ThreadId, Urgency, UserId,
};
use serde::{Deserialize, Serialize};
use shared::AppError;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

/// ボードの絞り込み条件
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BoardFilter {
    /// タイトル・説明の部分一致（大文字小文字を区別しない）
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

impl BoardFilter {
    fn matches(&self, task: &Task) -> bool {
        let query = self
            .q
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_lowercase);
        if let Some(query) = query {
            let in_title = task.title.to_lowercase().contains(&query);
            let in_description = task
                .description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(&query));
            if !in_title && !in_description {
                return false;
            }
        }

        match self.category.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            Some(category) => task.category.as_deref() == Some(category),
            None => true,
        }
    }
}

/// ボード上のカード
#[derive(Debug, Clone, Serialize)]
pub struct TaskCard {
    pub task: Task,
    pub my_status: Option<TaskStatus>,
    pub member_count: usize,
    pub progress_percent: u8,
    pub urgency: Urgency,
    pub overdue: bool,
}

/// ステータス別の列とボード全体の完了率
#[derive(Debug, Clone, Default, Serialize)]
pub struct BoardView {
    pub todo: Vec<TaskCard>,
    pub doing: Vec<TaskCard>,
    pub done: Vec<TaskCard>,
    /// 表示中のタスクに対する完了率
    pub completion_percent: u8,
    /// 絞り込み前のタスクに含まれるカテゴリ
    pub categories: Vec<String>,
}

impl BoardView {
    pub fn total(&self) -> usize {
        self.todo.len() + self.doing.len() + self.done.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskDetail {
    pub task: Task,
    pub memberships: Vec<Membership>,
    pub subtasks: Vec<Subtask>,
    pub threads: Vec<ChatThread>,
    pub pending_invitations: Vec<Invitation>,
    pub my_status: Option<TaskStatus>,
    pub progress_percent: u8,
    pub urgency: Urgency,
    pub overdue: bool,
}

/// 受信箱の招待（タスク名付き）
#[derive(Debug, Clone, Serialize)]
pub struct InboxEntry {
    pub invitation: Invitation,
    /// タスクが削除済みなら None
    pub task_title: Option<String>,
}

/// 期限の早い順、期限なしは最後
fn by_due_date(a: &TaskCard, b: &TaskCard) -> Ordering {
    match (a.task.due_at, b.task.due_at) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.task.created_at.cmp(&b.task.created_at))
}

pub struct QueryService {
    store: Arc<dyn BoardStore>,
    clock: Arc<dyn Clock>,
}

impl QueryService {
    pub fn new(store: Arc<dyn BoardStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn card(
        task: Task,
        memberships: &[Membership],
        subtasks: &[Subtask],
        viewer: &UserId,
        now: DateTime<Utc>,
    ) -> TaskCard {
        let progress_percent = task_progress(&task, memberships, subtasks);
        TaskCard {
            my_status: my_status(memberships, viewer),
            member_count: memberships.len(),
            progress_percent,
            urgency: urgency(task.due_at, now),
            overdue: is_overdue(task.due_at, progress_percent, now),
            task,
        }
    }

    /// ユーザーのボード
    pub async fn board(&self, viewer: &UserId, filter: &BoardFilter) -> Result<BoardView, AppError> {
        let now = self.clock.now();
        let tasks = self.store.list_tasks_for_user(viewer).await?;

        let mut categories: Vec<String> = tasks.iter().filter_map(|t| t.category.clone()).collect();
        categories.sort();
        categories.dedup();

        let visible: Vec<Task> = tasks.into_iter().filter(|t| filter.matches(t)).collect();
        let completion_percent = board_completion(&visible);

        let mut view = BoardView {
            completion_percent,
            categories,
            ..Default::default()
        };
        for task in visible {
            let memberships = self.store.list_memberships(&task.id).await?;
            let subtasks = self.store.list_subtasks(&task.id).await?;
            let card = Self::card(task, &memberships, &subtasks, viewer, now);
            match card.task.status {
                TaskStatus::Todo => view.todo.push(card),
                TaskStatus::Doing => view.doing.push(card),
                TaskStatus::Done => view.done.push(card),
            }
        }
        for column in [&mut view.todo, &mut view.doing, &mut view.done] {
            column.sort_by(by_due_date);
        }

        debug!("ボード取得: user={}, 件数={}", viewer, view.total());
        Ok(view)
    }

    /// メンバーであることを確認してタスクとメンバー一覧を返す
    async fn load_visible(
        &self,
        task_id: &TaskId,
        viewer: &UserId,
    ) -> Result<(Task, Vec<Membership>), AppError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| DomainError::TaskNotFound(task_id.to_string()))?;
        let memberships = self.store.list_memberships(task_id).await?;
        ensure_member(&task, &memberships, viewer)?;
        Ok((task, memberships))
    }

    /// タスク詳細（メンバーのみ）
    pub async fn task_detail(&self, task_id: &TaskId, viewer: &UserId) -> Result<TaskDetail, AppError> {
        let (task, memberships) = self.load_visible(task_id, viewer).await?;

        let subtasks = self.store.list_subtasks(task_id).await?;
        let threads = self.store.list_threads(task_id).await?;
        let pending_invitations = self
            .store
            .list_task_invitations(task_id)
            .await?
            .into_iter()
            .filter(Invitation::is_pending)
            .collect();

        let now = self.clock.now();
        let card = Self::card(task, &memberships, &subtasks, viewer, now);
        Ok(TaskDetail {
            task: card.task,
            my_status: card.my_status,
            progress_percent: card.progress_percent,
            urgency: card.urgency,
            overdue: card.overdue,
            memberships,
            subtasks,
            threads,
            pending_invitations,
        })
    }

    pub async fn list_threads(
        &self,
        task_id: &TaskId,
        viewer: &UserId,
    ) -> Result<Vec<ChatThread>, AppError> {
        self.load_visible(task_id, viewer).await?;
        self.store.list_threads(task_id).await
    }

    /// コメント一覧（古い順、スレッド指定時はそのスレッドのみ）
    pub async fn list_comments(
        &self,
        task_id: &TaskId,
        viewer: &UserId,
        thread_id: Option<&ThreadId>,
    ) -> Result<Vec<Comment>, AppError> {
        self.load_visible(task_id, viewer).await?;
        self.store.list_comments(task_id, thread_id).await
    }

    /// タスクのイベント履歴
    pub async fn history(&self, task_id: &TaskId, viewer: &UserId) -> Result<Vec<BoardEvent>, AppError> {
        self.load_visible(task_id, viewer).await?;
        self.store.list_events(task_id).await
    }

    /// 受け取った招待（新しい順）
    pub async fn invitation_inbox(&self, user: &UserId) -> Result<Vec<InboxEntry>, AppError> {
        let invitations = self.store.list_invitations_for_recipient(user).await?;
        let mut entries = Vec::with_capacity(invitations.len());
        for invitation in invitations {
            let task_title = self
                .store
                .get_task(&invitation.task_id)
                .await?
                .map(|t| t.title);
            entries.push(InboxEntry {
                invitation,
                task_title,
            });
        }
        Ok(entries)
    }
}
