//! ボード操作のアプリケーションサービス
//!
//! 読み込み → ドメイン計算 → 一括コミットを1単位とし、バージョン競合時は
//! 単位ごとやり直す。完了判定や繰り返し生成はやり直しのたびに最新の状態から
//! 計算し直すため、同時に完了しても後続タスクは1件しかできない。

use crate::identity::IdentityStore;
use crate::store::{BoardStore, WriteBatch, WriteOp, MAX_BATCH_ITEMS};
use chrono::{DateTime, Utc};
use domain::{
    add_member, change_member_status, ensure_member, ensure_owner, find_membership,
    rearm_recurrence, refresh_status, remove_member, spawn_successor, task_progress, BoardEvent, BoardEventKind,
    ChatThread, Clock, Comment, DomainError, Invitation, InvitationId, InvitationResponse,
    InvitationStatus, JoinSource, Membership, NewComment, NewTask, ShareToken, StatusTransition,
    Subtask, SubtaskId, Successor, Task, TaskId, TaskStatus, TaskUpdates, UserId,
    DEFAULT_THREAD_NAME,
};
use serde::Serialize;
use shared::{AppError, BusinessMetrics, CustomMetric, MetricsSink, NoopMetrics, OptimisticLockRetryExecutor};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// メンバーステータス変更の結果
#[derive(Debug, Clone, Serialize)]
pub struct StatusChangeOutcome {
    pub task: Task,
    pub task_status: TaskStatus,
    pub progress_percent: u8,
    pub recurrence_triggered: bool,
    pub successor: Option<Task>,
}

/// サブタスク操作の結果
#[derive(Debug, Clone, Serialize)]
pub struct SubtaskOutcome {
    pub subtask: Subtask,
    pub progress_percent: u8,
}

/// ユーザー削除時の後始末の結果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeSummary {
    pub deleted_tasks: usize,
    pub left_tasks: usize,
}

/// コミット後に行う処理
#[derive(Default)]
struct Pending {
    metrics: Vec<CustomMetric>,
    /// 1回のコミットに収まらなかった後続タスクのメンバー
    remaining_members: Vec<Membership>,
}

pub struct BoardService {
    store: Arc<dyn BoardStore>,
    identity: Arc<dyn IdentityStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    retry: OptimisticLockRetryExecutor,
}

impl BoardService {
    pub fn new(
        store: Arc<dyn BoardStore>,
        identity: Arc<dyn IdentityStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            identity,
            clock,
            metrics: Arc::new(NoopMetrics),
            retry: OptimisticLockRetryExecutor::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_retry(mut self, retry: OptimisticLockRetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// 1回分の試行。競合したらメトリクスを残して呼び出し元に返す
    async fn attempt<T, Fut>(&self, operation: &str, fut: Fut) -> Result<T, AppError>
    where
        Fut: Future<Output = Result<T, AppError>>,
    {
        let result = fut.await;
        if let Err(AppError::ConcurrentModification) = &result {
            warn!("バージョン競合のため再試行: operation={}", operation);
            self.metrics
                .record(vec![BusinessMetrics::optimistic_lock_conflict(operation)])
                .await;
        }
        result
    }

    /// メトリクスを送り、積み残したメンバーを書き込む
    async fn finish(&self, pending: Pending) -> Result<(), AppError> {
        self.metrics.record(pending.metrics).await;

        // 各回 UpdateTask の1項目を残す
        for chunk in pending.remaining_members.chunks(MAX_BATCH_ITEMS - 1) {
            self.retry
                .execute(|| self.attempt("carry_over_members", self.carry_over_once(chunk)))
                .await?;
        }
        Ok(())
    }

    /// 後続タスクにメンバーを追加する（追加済みのメンバーは飛ばす）
    async fn carry_over_once(&self, members: &[Membership]) -> Result<(), AppError> {
        let Some(task_id) = members.first().map(|m| m.task_id.clone()) else {
            return Ok(());
        };
        let Some(mut task) = self.store.get_task(&task_id).await? else {
            warn!("後続タスクが削除済みのためメンバーを追加しません: task_id={}", task_id);
            return Ok(());
        };
        let expected_version = task.version;
        let mut memberships = self.store.list_memberships(&task_id).await?;

        let missing: Vec<Membership> = members
            .iter()
            .filter(|m| find_membership(&memberships, &m.user_id).is_none())
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        memberships.extend(missing.iter().cloned());
        refresh_status(&mut task, &memberships);
        task.touch(self.now());

        let mut batch = WriteBatch::new();
        for membership in &missing {
            batch.push(WriteOp::AddMembership(membership.clone()));
        }
        batch.push(WriteOp::UpdateTask {
            task,
            expected_version,
        });
        self.store.commit(batch).await?;

        debug!("後続タスクにメンバーを追加: task_id={}, 件数={}", task_id, missing.len());
        Ok(())
    }

    async fn load_task(&self, task_id: &TaskId) -> Result<Task, AppError> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| DomainError::TaskNotFound(task_id.to_string()).into())
    }

    async fn load_aggregate(&self, task_id: &TaskId) -> Result<(Task, Vec<Membership>), AppError> {
        let task = self.load_task(task_id).await?;
        let memberships = self.store.list_memberships(task_id).await?;
        Ok((task, memberships))
    }

    async fn load_subtask(&self, subtask_id: &SubtaskId) -> Result<Subtask, AppError> {
        self.store
            .get_subtask(subtask_id)
            .await?
            .ok_or_else(|| DomainError::SubtaskNotFound(subtask_id.to_string()).into())
    }

    /// 進捗率（サブタスク比率のときだけサブタスクを読む）
    async fn progress_of(&self, task: &Task, memberships: &[Membership]) -> Result<u8, AppError> {
        let subtasks = match task.progress_mode {
            domain::ProgressMode::SubtaskRatio => self.store.list_subtasks(&task.id).await?,
            domain::ProgressMode::MembershipRatio => Vec::new(),
        };
        Ok(task_progress(task, memberships, &subtasks))
    }

    async fn display_name(&self, user_id: &UserId) -> String {
        match self.identity.get_user(user_id).await {
            Ok(Some(profile)) => profile.username,
            _ => user_id.to_string(),
        }
    }

    /// メインスレッドへのシステムメッセージ
    async fn system_message(
        &self,
        task_id: &TaskId,
        actor: &UserId,
        text: String,
        now: DateTime<Utc>,
    ) -> Result<Comment, AppError> {
        let threads = self.store.list_threads(task_id).await?;
        let main = threads
            .iter()
            .find(|t| t.name == DEFAULT_THREAD_NAME)
            .or_else(|| threads.first())
            .map(|t| t.id.clone());
        Ok(Comment::system(task_id.clone(), actor.clone(), main, text, now))
    }

    /// 状態遷移に伴うイベントと、完了時の後続タスク生成をバッチに積む
    ///
    /// 元タスクの書き込み（`UpdateTask`）は呼び出し側で最後に積む。
    fn apply_transition(
        task: &mut Task,
        memberships: &[Membership],
        transition: StatusTransition,
        actor: &UserId,
        now: DateTime<Utc>,
        batch: &mut WriteBatch,
        pending: &mut Pending,
    ) -> Option<Successor> {
        if transition.reopened() {
            batch.event(BoardEvent::new(
                task.id.clone(),
                actor.clone(),
                BoardEventKind::TaskReopenedV1 {
                    status: transition.current,
                },
                now,
            ));
        }
        if !transition.completed() {
            return None;
        }

        batch.event(BoardEvent::new(
            task.id.clone(),
            actor.clone(),
            BoardEventKind::TaskCompletedV1 {
                members: memberships.len(),
            },
            now,
        ));
        pending
            .metrics
            .push(BusinessMetrics::task_completed(memberships.len()));

        let successor = spawn_successor(task, memberships, now)?;
        info!(
            "繰り返しタスクを生成: task_id={}, successor_id={}, next_due={:?}",
            task.id, successor.task.id, successor.task.due_at
        );

        batch.event(BoardEvent::new(
            task.id.clone(),
            actor.clone(),
            BoardEventKind::RecurrenceSpawnedV1 {
                successor_id: successor.task.id.clone(),
                next_due_at: successor.task.due_at,
            },
            now,
        ));
        batch
            .push(WriteOp::CreateTask(successor.task.clone()))
            .push(WriteOp::PutThread(ChatThread::main(
                successor.task.id.clone(),
                now,
            )))
            .event(BoardEvent::new(
                successor.task.id.clone(),
                actor.clone(),
                BoardEventKind::TaskCreatedV1 {
                    title: successor.task.title.clone(),
                    recurrence: successor.task.recurrence,
                    due_at: successor.task.due_at,
                },
                now,
            ));

        // 引き継ぎイベントと呼び出し側の UpdateTask の分を残して入るだけ積む
        let capacity = batch
            .remaining_capacity()
            .saturating_sub(2)
            .min(successor.memberships.len());
        let (now_members, later_members) = successor.memberships.split_at(capacity);
        for membership in now_members {
            batch.push(WriteOp::AddMembership(membership.clone()));
        }
        batch.event(BoardEvent::new(
            successor.task.id.clone(),
            actor.clone(),
            BoardEventKind::MembersCarriedOverV1 {
                from_task: task.id.clone(),
                user_ids: successor
                    .memberships
                    .iter()
                    .map(|m| m.user_id.clone())
                    .collect(),
            },
            now,
        ));
        if !later_members.is_empty() {
            debug!(
                "後続タスクのメンバーを分割して書き込む: successor_id={}, 残り={}",
                successor.task.id,
                later_members.len()
            );
            pending.remaining_members = later_members.to_vec();
        }
        pending
            .metrics
            .push(BusinessMetrics::recurrence_spawned(successor.task.recurrence.as_str()));

        Some(successor)
    }

    // ---------------------------------------------------------------
    // タスク
    // ---------------------------------------------------------------

    /// タスクを作成（オーナーはメンバーとして登録される）
    pub async fn create_task(&self, owner: &UserId, params: NewTask) -> Result<Task, AppError> {
        let now = self.now();
        let task = Task::new(owner.clone(), params, now)?;
        let membership = Membership::new(task.id.clone(), owner.clone(), now);

        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::CreateTask(task.clone()))
            .push(WriteOp::AddMembership(membership))
            .push(WriteOp::PutThread(ChatThread::main(task.id.clone(), now)))
            .event(BoardEvent::new(
                task.id.clone(),
                owner.clone(),
                BoardEventKind::TaskCreatedV1 {
                    title: task.title.clone(),
                    recurrence: task.recurrence,
                    due_at: task.due_at,
                },
                now,
            ))
            .event(BoardEvent::new(
                task.id.clone(),
                owner.clone(),
                BoardEventKind::MemberJoinedV1 {
                    user_id: owner.clone(),
                    via: JoinSource::Owner,
                },
                now,
            ));
        self.store.commit(batch).await?;

        info!("タスク作成完了: task_id={}, owner={}", task.id, owner);
        self.metrics
            .record(vec![BusinessMetrics::task_created(task.recurrence.as_str())])
            .await;
        Ok(task)
    }

    /// タスクの内容を編集
    pub async fn update_task(
        &self,
        task_id: &TaskId,
        actor: &UserId,
        updates: TaskUpdates,
    ) -> Result<Task, AppError> {
        if updates.is_empty() {
            return Err(DomainError::Validation("no fields to update".to_string()).into());
        }
        self.retry
            .execute(|| {
                let updates = updates.clone();
                self.attempt("update_task", self.update_task_once(task_id, actor, updates))
            })
            .await
    }

    async fn update_task_once(
        &self,
        task_id: &TaskId,
        actor: &UserId,
        updates: TaskUpdates,
    ) -> Result<Task, AppError> {
        let now = self.now();
        let (mut task, memberships) = self.load_aggregate(task_id).await?;
        ensure_member(&task, &memberships, actor)?;

        let expected_version = task.version;
        task.apply_updates(updates, now)?;

        let mut batch = WriteBatch::new();
        batch
            .event(BoardEvent::new(
                task.id.clone(),
                actor.clone(),
                BoardEventKind::TaskUpdatedV1 {
                    title: task.title.clone(),
                },
                now,
            ))
            .push(WriteOp::UpdateTask {
                task: task.clone(),
                expected_version,
            });
        self.store.commit(batch).await?;

        info!("タスク更新完了: task_id={}, version={}", task.id, task.version);
        Ok(task)
    }

    /// タスクと配下のデータを削除（オーナーのみ）
    pub async fn delete_task(&self, task_id: &TaskId, actor: &UserId) -> Result<(), AppError> {
        self.retry
            .execute(|| self.attempt("delete_task", self.delete_task_once(task_id, actor)))
            .await
    }

    async fn delete_task_once(&self, task_id: &TaskId, actor: &UserId) -> Result<(), AppError> {
        let task = self.load_task(task_id).await?;
        ensure_owner(&task, actor)?;

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::DeleteTask {
            task_id: task.id.clone(),
            expected_version: task.version,
        });
        self.store.commit(batch).await?;

        info!("タスク削除完了: task_id={}, title={}", task.id, task.title);
        Ok(())
    }

    /// オーナーの完了済みタスクをまとめて削除
    pub async fn delete_done_tasks(&self, owner: &UserId) -> Result<usize, AppError> {
        let tasks = self.store.list_tasks_for_user(owner).await?;
        let mut deleted = 0;
        for task in tasks
            .iter()
            .filter(|t| t.is_owner(owner) && t.status.is_done())
        {
            match self.delete_task(&task.id, owner).await {
                Ok(()) => deleted += 1,
                // 別リクエストで既に消えている
                Err(AppError::Domain(DomainError::TaskNotFound(_))) => {}
                Err(e) => return Err(e),
            }
        }
        info!("完了済みタスクを削除: owner={}, 件数={}", owner, deleted);
        Ok(deleted)
    }

    // ---------------------------------------------------------------
    // メンバーシップ
    // ---------------------------------------------------------------

    /// メンバーのステータスを変更し、タスクのステータスを導出し直す
    pub async fn set_member_status(
        &self,
        task_id: &TaskId,
        actor: &UserId,
        target: &UserId,
        status: TaskStatus,
    ) -> Result<StatusChangeOutcome, AppError> {
        let (outcome, pending) = self
            .retry
            .execute(|| {
                self.attempt(
                    "set_member_status",
                    self.set_member_status_once(task_id, actor, target, status),
                )
            })
            .await?;
        self.finish(pending).await?;
        Ok(outcome)
    }

    async fn set_member_status_once(
        &self,
        task_id: &TaskId,
        actor: &UserId,
        target: &UserId,
        status: TaskStatus,
    ) -> Result<(StatusChangeOutcome, Pending), AppError> {
        let now = self.now();
        let (mut task, mut memberships) = self.load_aggregate(task_id).await?;
        let expected_version = task.version;
        let previous = find_membership(&memberships, target).map(|m| m.status);

        let transition = change_member_status(&mut task, &mut memberships, actor, target, status)?;
        task.touch(now);

        let mut batch = WriteBatch::new();
        let mut pending = Pending::default();
        if let Some(updated) = find_membership(&memberships, target) {
            batch.push(WriteOp::UpdateMembership(updated.clone()));
        }
        batch.event(BoardEvent::new(
            task.id.clone(),
            actor.clone(),
            BoardEventKind::MemberStatusChangedV1 {
                user_id: target.clone(),
                from: previous.unwrap_or(TaskStatus::Todo),
                to: status,
                task_status: task.status,
            },
            now,
        ));

        let successor = Self::apply_transition(
            &mut task,
            &memberships,
            transition,
            actor,
            now,
            &mut batch,
            &mut pending,
        );
        batch.push(WriteOp::UpdateTask {
            task: task.clone(),
            expected_version,
        });
        self.store.commit(batch).await?;

        let progress_percent = self.progress_of(&task, &memberships).await?;
        info!(
            "メンバーステータス変更: task_id={}, target={}, status={}, task_status={}",
            task.id, target, status, task.status
        );

        Ok((
            StatusChangeOutcome {
                task_status: task.status,
                progress_percent,
                recurrence_triggered: successor.is_some(),
                successor: successor.map(|s| s.task),
                task,
            },
            pending,
        ))
    }

    /// 共有リンクで参加（参加済みなら既存のメンバーシップを返す）
    pub async fn join_by_share_token(
        &self,
        token: &ShareToken,
        user: &UserId,
    ) -> Result<Membership, AppError> {
        let joined = self
            .retry
            .execute(|| self.attempt("join_by_share_token", self.join_once(token, user)))
            .await;
        match joined {
            // 同じユーザーの参加が同時に走った
            Err(AppError::Domain(DomainError::AlreadyMember)) => self.join_once(token, user).await,
            other => other,
        }
    }

    async fn join_once(&self, token: &ShareToken, user: &UserId) -> Result<Membership, AppError> {
        let now = self.now();
        let mut task = self
            .store
            .find_task_by_share_token(token)
            .await?
            .ok_or_else(|| DomainError::ShareTokenNotFound(token.to_string()))?;
        let mut memberships = self.store.list_memberships(&task.id).await?;
        if let Some(existing) = find_membership(&memberships, user) {
            debug!("参加済み: task_id={}, user={}", task.id, user);
            return Ok(existing.clone());
        }

        let expected_version = task.version;
        let (membership, transition) = add_member(&mut task, &mut memberships, user, now)?;
        task.touch(now);

        let name = self.display_name(user).await;
        let message = self
            .system_message(&task.id, user, format!("{name}さんが参加しました"), now)
            .await?;

        let mut batch = WriteBatch::new();
        let mut pending = Pending::default();
        batch
            .push(WriteOp::AddMembership(membership.clone()))
            .push(WriteOp::PutComment(message))
            .event(BoardEvent::new(
                task.id.clone(),
                user.clone(),
                BoardEventKind::MemberJoinedV1 {
                    user_id: user.clone(),
                    via: JoinSource::ShareLink,
                },
                now,
            ));
        Self::apply_transition(
            &mut task,
            &memberships,
            transition,
            user,
            now,
            &mut batch,
            &mut pending,
        );
        batch.push(WriteOp::UpdateTask {
            task: task.clone(),
            expected_version,
        });
        self.store.commit(batch).await?;

        info!("共有リンクで参加: task_id={}, user={}", task.id, user);
        Ok(membership)
    }

    /// タスクから抜ける（オーナーは抜けられない）
    ///
    /// 残りのメンバーが全員完了していればタスクは完了になり、繰り返しも発火する。
    pub async fn leave_task(&self, task_id: &TaskId, user: &UserId) -> Result<(), AppError> {
        let pending = self
            .retry
            .execute(|| self.attempt("leave_task", self.leave_once(task_id, user)))
            .await?;
        self.finish(pending).await?;
        Ok(())
    }

    async fn leave_once(&self, task_id: &TaskId, user: &UserId) -> Result<Pending, AppError> {
        let now = self.now();
        let (mut task, mut memberships) = self.load_aggregate(task_id).await?;
        let expected_version = task.version;
        let (removed, transition) = remove_member(&mut task, &mut memberships, user)?;
        task.touch(now);

        let name = self.display_name(user).await;
        let message = self
            .system_message(&task.id, user, format!("{name}さんが退出しました"), now)
            .await?;

        let mut batch = WriteBatch::new();
        let mut pending = Pending::default();
        batch
            .push(WriteOp::RemoveMembership {
                task_id: removed.task_id,
                user_id: removed.user_id,
            })
            .push(WriteOp::PutComment(message))
            .event(BoardEvent::new(
                task.id.clone(),
                user.clone(),
                BoardEventKind::MemberLeftV1 {
                    user_id: user.clone(),
                },
                now,
            ));
        Self::apply_transition(
            &mut task,
            &memberships,
            transition,
            user,
            now,
            &mut batch,
            &mut pending,
        );
        batch.push(WriteOp::UpdateTask {
            task: task.clone(),
            expected_version,
        });
        self.store.commit(batch).await?;

        info!("タスクから退出: task_id={}, user={}", task.id, user);
        Ok(pending)
    }

    /// 繰り返しを再び有効にする（オーナーのみ）
    pub async fn rearm_recurrence(&self, task_id: &TaskId, actor: &UserId) -> Result<Task, AppError> {
        self.retry
            .execute(|| self.attempt("rearm_recurrence", self.rearm_once(task_id, actor)))
            .await
    }

    async fn rearm_once(&self, task_id: &TaskId, actor: &UserId) -> Result<Task, AppError> {
        let now = self.now();
        let mut task = self.load_task(task_id).await?;
        let expected_version = task.version;
        let previous_successor = task.successor_id.clone();
        rearm_recurrence(&mut task, actor)?;
        task.touch(now);

        let mut batch = WriteBatch::new();
        batch
            .event(BoardEvent::new(
                task.id.clone(),
                actor.clone(),
                BoardEventKind::RecurrenceRearmedV1 { previous_successor },
                now,
            ))
            .push(WriteOp::UpdateTask {
                task: task.clone(),
                expected_version,
            });
        self.store.commit(batch).await?;

        info!("繰り返しを再設定: task_id={}", task.id);
        Ok(task)
    }

    // ---------------------------------------------------------------
    // 招待
    // ---------------------------------------------------------------

    /// ユーザー名を指定して招待する
    pub async fn invite_user(
        &self,
        task_id: &TaskId,
        sender: &UserId,
        recipient_username: &str,
    ) -> Result<Invitation, AppError> {
        // 非メンバーにはユーザー名の存在を知らせない
        let (task, memberships) = self.load_aggregate(task_id).await?;
        ensure_member(&task, &memberships, sender)
            .inspect_err(|e| warn!("招待できません: task_id={}, reason={}", task_id, e))?;

        let recipient = self
            .identity
            .get_user_by_username(recipient_username)
            .await?
            .ok_or_else(|| DomainError::UnknownUser(recipient_username.to_string()))?;

        let invitation = self
            .retry
            .execute(|| {
                self.attempt(
                    "invite_user",
                    self.invite_once(task_id, sender, &recipient.id),
                )
            })
            .await?;

        self.metrics
            .record(vec![BusinessMetrics::invitation_sent()])
            .await;
        Ok(invitation)
    }

    async fn invite_once(
        &self,
        task_id: &TaskId,
        sender: &UserId,
        recipient: &UserId,
    ) -> Result<Invitation, AppError> {
        let now = self.now();
        let (task, memberships) = self.load_aggregate(task_id).await?;
        let pending = self.store.has_pending_invitation(task_id, recipient).await?;
        let invitation = Invitation::create(&task, &memberships, pending, sender, recipient, now)
            .inspect_err(|e| warn!("招待できません: task_id={}, reason={}", task_id, e))?;

        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::CheckTaskVersion {
                task_id: task.id.clone(),
                expected_version: task.version,
            })
            .push(WriteOp::CreateInvitation(invitation.clone()))
            .event(BoardEvent::new(
                task.id.clone(),
                sender.clone(),
                BoardEventKind::MemberInvitedV1 {
                    invitation_id: invitation.id.clone(),
                    recipient: recipient.clone(),
                },
                now,
            ));
        self.store.commit(batch).await?;

        info!(
            "招待作成完了: invitation_id={}, task_id={}, recipient={}",
            invitation.id, task_id, recipient
        );
        Ok(invitation)
    }

    /// 招待に回答する
    ///
    /// 承諾ならメンバーシップを返す。承諾済みの招待をもう一度承諾した場合は既存の
    /// メンバーシップを返し、何も書き込まない。
    pub async fn respond_invitation(
        &self,
        invitation_id: &InvitationId,
        actor: &UserId,
        response: InvitationResponse,
    ) -> Result<Option<Membership>, AppError> {
        let (membership, pending) = self
            .retry
            .execute(|| {
                self.attempt(
                    "respond_invitation",
                    self.respond_once(invitation_id, actor, response),
                )
            })
            .await?;
        self.finish(pending).await?;
        Ok(membership)
    }

    async fn respond_once(
        &self,
        invitation_id: &InvitationId,
        actor: &UserId,
        response: InvitationResponse,
    ) -> Result<(Option<Membership>, Pending), AppError> {
        let now = self.now();
        let mut invitation = self
            .store
            .get_invitation(invitation_id)
            .await?
            .ok_or_else(|| DomainError::InvitationNotFound(invitation_id.to_string()))?;
        let (mut task, mut memberships) = self.load_aggregate(&invitation.task_id).await?;

        let outcome = invitation.respond(actor, response, now)?;
        let mut pending = Pending::default();
        if !outcome.is_new() {
            debug!("回答済みの招待: invitation_id={}", invitation_id);
            let existing = match outcome.status() {
                InvitationStatus::Accepted => find_membership(&memberships, actor).cloned(),
                _ => None,
            };
            return Ok((existing, pending));
        }

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::CloseInvitation(invitation.clone()));

        if outcome.status() == InvitationStatus::Declined {
            batch.event(BoardEvent::new(
                task.id.clone(),
                actor.clone(),
                BoardEventKind::InvitationDeclinedV1 {
                    invitation_id: invitation.id.clone(),
                    recipient: actor.clone(),
                },
                now,
            ));
            self.store.commit(batch).await?;
            info!("招待を辞退: invitation_id={}", invitation.id);
            pending
                .metrics
                .push(BusinessMetrics::invitation_responded(false));
            return Ok((None, pending));
        }

        batch.event(BoardEvent::new(
            task.id.clone(),
            actor.clone(),
            BoardEventKind::InvitationAcceptedV1 {
                invitation_id: invitation.id.clone(),
                recipient: actor.clone(),
            },
            now,
        ));
        pending
            .metrics
            .push(BusinessMetrics::invitation_responded(true));

        // 共有リンクなどで先に参加していた場合
        if let Some(existing) = find_membership(&memberships, actor).cloned() {
            self.store.commit(batch).await?;
            return Ok((Some(existing), pending));
        }

        let expected_version = task.version;
        let (membership, transition) = add_member(&mut task, &mut memberships, actor, now)?;
        task.touch(now);
        let name = self.display_name(actor).await;
        let message = self
            .system_message(&task.id, actor, format!("{name}さんが参加しました"), now)
            .await?;

        batch
            .push(WriteOp::AddMembership(membership.clone()))
            .push(WriteOp::PutComment(message))
            .event(BoardEvent::new(
                task.id.clone(),
                actor.clone(),
                BoardEventKind::MemberJoinedV1 {
                    user_id: actor.clone(),
                    via: JoinSource::Invitation,
                },
                now,
            ));
        Self::apply_transition(
            &mut task,
            &memberships,
            transition,
            actor,
            now,
            &mut batch,
            &mut pending,
        );
        batch.push(WriteOp::UpdateTask {
            task: task.clone(),
            expected_version,
        });
        self.store.commit(batch).await?;

        info!(
            "招待を承諾: invitation_id={}, task_id={}, user={}",
            invitation.id, task.id, actor
        );
        Ok((Some(membership), pending))
    }

    // ---------------------------------------------------------------
    // サブタスク
    // ---------------------------------------------------------------

    /// サブタスクを追加し、追加後の進捗率を返す
    pub async fn add_subtask(
        &self,
        task_id: &TaskId,
        actor: &UserId,
        title: &str,
    ) -> Result<SubtaskOutcome, AppError> {
        self.retry
            .execute(|| self.attempt("add_subtask", self.add_subtask_once(task_id, actor, title)))
            .await
    }

    async fn add_subtask_once(
        &self,
        task_id: &TaskId,
        actor: &UserId,
        title: &str,
    ) -> Result<SubtaskOutcome, AppError> {
        let now = self.now();
        let (task, memberships) = self.load_aggregate(task_id).await?;
        ensure_member(&task, &memberships, actor)?;

        // タスクが同時に削除されていたら書き込まない
        let subtask = Subtask::new(task.id.clone(), title, now)?;
        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::CheckTaskVersion {
                task_id: task.id.clone(),
                expected_version: task.version,
            })
            .push(WriteOp::PutSubtask(subtask.clone()));
        self.store.commit(batch).await?;

        let progress_percent = self.progress_of(&task, &memberships).await?;
        info!("サブタスク追加: task_id={}, subtask_id={}", task.id, subtask.id);
        Ok(SubtaskOutcome {
            subtask,
            progress_percent,
        })
    }

    /// サブタスクの完了を切り替える
    pub async fn toggle_subtask(
        &self,
        subtask_id: &SubtaskId,
        actor: &UserId,
    ) -> Result<SubtaskOutcome, AppError> {
        self.retry
            .execute(|| self.attempt("toggle_subtask", self.toggle_subtask_once(subtask_id, actor)))
            .await
    }

    async fn toggle_subtask_once(
        &self,
        subtask_id: &SubtaskId,
        actor: &UserId,
    ) -> Result<SubtaskOutcome, AppError> {
        let mut subtask = self.load_subtask(subtask_id).await?;
        let (task, memberships) = self.load_aggregate(&subtask.task_id).await?;
        ensure_member(&task, &memberships, actor)?;

        let expected_done = subtask.done;
        let done = subtask.toggle();
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::UpdateSubtask {
            subtask: subtask.clone(),
            expected_done,
        });
        self.store.commit(batch).await?;

        let progress_percent = self.progress_of(&task, &memberships).await?;
        info!("サブタスク切り替え: subtask_id={}, done={}", subtask.id, done);
        Ok(SubtaskOutcome {
            subtask,
            progress_percent,
        })
    }

    /// サブタスクを削除し、削除後の進捗率を返す
    pub async fn delete_subtask(
        &self,
        subtask_id: &SubtaskId,
        actor: &UserId,
    ) -> Result<u8, AppError> {
        self.retry
            .execute(|| self.attempt("delete_subtask", self.delete_subtask_once(subtask_id, actor)))
            .await
    }

    async fn delete_subtask_once(
        &self,
        subtask_id: &SubtaskId,
        actor: &UserId,
    ) -> Result<u8, AppError> {
        let subtask = self.load_subtask(subtask_id).await?;
        let (task, memberships) = self.load_aggregate(&subtask.task_id).await?;
        ensure_member(&task, &memberships, actor)?;

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::DeleteSubtask {
            task_id: task.id.clone(),
            subtask_id: subtask.id.clone(),
        });
        self.store.commit(batch).await?;

        info!("サブタスク削除: subtask_id={}", subtask.id);
        self.progress_of(&task, &memberships).await
    }

    // ---------------------------------------------------------------
    // スレッドとコメント
    // ---------------------------------------------------------------

    pub async fn create_thread(
        &self,
        task_id: &TaskId,
        actor: &UserId,
        name: &str,
    ) -> Result<ChatThread, AppError> {
        let (task, memberships) = self.load_aggregate(task_id).await?;
        ensure_member(&task, &memberships, actor)?;

        let thread = ChatThread::new(task.id.clone(), name, self.now())?;
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::PutThread(thread.clone()));
        self.store.commit(batch).await?;

        info!("スレッド作成: task_id={}, thread_id={}", task.id, thread.id);
        Ok(thread)
    }

    /// コメントを投稿（スレッド指定時は存在を確認する）
    pub async fn post_comment(
        &self,
        task_id: &TaskId,
        actor: &UserId,
        params: NewComment,
    ) -> Result<Comment, AppError> {
        let (task, memberships) = self.load_aggregate(task_id).await?;
        ensure_member(&task, &memberships, actor)?;

        if let Some(thread_id) = &params.thread_id {
            let threads = self.store.list_threads(task_id).await?;
            if !threads.iter().any(|t| &t.id == thread_id) {
                return Err(DomainError::ThreadNotFound(thread_id.to_string()).into());
            }
        }

        let comment = Comment::new(task.id.clone(), actor.clone(), params, self.now())?;
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::PutComment(comment.clone()));
        self.store.commit(batch).await?;

        debug!("コメント投稿: task_id={}, comment_id={}", task.id, comment.id);
        Ok(comment)
    }

    // ---------------------------------------------------------------
    // ユーザー削除
    // ---------------------------------------------------------------

    /// 削除されたユーザーのデータを片付ける
    ///
    /// オーナーのタスクは削除し、参加中のタスクからは抜ける。
    pub async fn purge_user(&self, user: &UserId) -> Result<PurgeSummary, AppError> {
        let mut summary = PurgeSummary::default();
        for task in self.store.list_tasks_for_user(user).await? {
            let result = if task.is_owner(user) {
                self.delete_task(&task.id, user).await.map(|_| summary.deleted_tasks += 1)
            } else {
                self.leave_task(&task.id, user).await.map(|_| summary.left_tasks += 1)
            };
            match result {
                Ok(()) => {}
                Err(AppError::Domain(DomainError::TaskNotFound(_)))
                | Err(AppError::Domain(DomainError::NotJoined)) => {}
                Err(e) => return Err(e),
            }
        }

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::DeleteChallenge(user.clone()));
        self.store.commit(batch).await?;

        info!(
            "ユーザーのデータを削除: user={}, deleted={}, left={}",
            user, summary.deleted_tasks, summary.left_tasks
        );
        Ok(summary)
    }
}
