//! プロセス内のボードストア（テスト・ローカル実行用）

use crate::store::{BoardStore, WriteBatch, WriteOp, MAX_BATCH_ITEMS};
use async_trait::async_trait;
use domain::{
    BoardEvent, ChatThread, Comment, Invitation, InvitationId, Membership, ShareToken, Subtask,
    SubtaskId, Task, TaskId, ThreadId, TwoFactorChallenge, UserId,
};
use shared::AppError;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
struct State {
    tasks: HashMap<TaskId, Task>,
    memberships: BTreeMap<(TaskId, UserId), Membership>,
    invitations: BTreeMap<InvitationId, Invitation>,
    pending_invites: HashSet<(TaskId, UserId)>,
    subtasks: BTreeMap<SubtaskId, Subtask>,
    threads: BTreeMap<ThreadId, ChatThread>,
    comments: BTreeMap<domain::CommentId, Comment>,
    events: Vec<BoardEvent>,
    challenges: HashMap<UserId, TwoFactorChallenge>,
}

impl State {
    fn task_version_matches(&self, task_id: &TaskId, expected_version: u64) -> bool {
        self.tasks
            .get(task_id)
            .is_some_and(|task| task.version == expected_version)
    }

    /// 適用前に前提条件を検査
    fn check(&self, op: &WriteOp) -> bool {
        match op {
            WriteOp::CreateTask(task) => !self.tasks.contains_key(&task.id),
            WriteOp::UpdateTask {
                task,
                expected_version,
            } => self.task_version_matches(&task.id, *expected_version),
            WriteOp::DeleteTask {
                task_id,
                expected_version,
            }
            | WriteOp::CheckTaskVersion {
                task_id,
                expected_version,
            } => self.task_version_matches(task_id, *expected_version),
            WriteOp::AddMembership(m) => !self
                .memberships
                .contains_key(&(m.task_id.clone(), m.user_id.clone())),
            WriteOp::UpdateMembership(m) => self
                .memberships
                .contains_key(&(m.task_id.clone(), m.user_id.clone())),
            WriteOp::CreateInvitation(inv) => !self
                .pending_invites
                .contains(&(inv.task_id.clone(), inv.recipient.clone())),
            WriteOp::CloseInvitation(inv) => self
                .pending_invites
                .contains(&(inv.task_id.clone(), inv.recipient.clone())),
            WriteOp::PutSubtask(subtask) => !self.subtasks.contains_key(&subtask.id),
            WriteOp::UpdateSubtask {
                subtask,
                expected_done,
            } => self
                .subtasks
                .get(&subtask.id)
                .is_some_and(|stored| stored.done == *expected_done),
            WriteOp::DeleteSubtask { subtask_id, .. } => self.subtasks.contains_key(subtask_id),
            WriteOp::PutChallenge {
                challenge,
                expected_code: Some(code),
            } => self
                .challenges
                .get(&challenge.user_id)
                .is_some_and(|stored| &stored.code == code),
            _ => true,
        }
    }

    fn apply(&mut self, op: WriteOp) {
        match op {
            WriteOp::CreateTask(task) | WriteOp::UpdateTask { task, .. } => {
                self.tasks.insert(task.id.clone(), task);
            }
            WriteOp::DeleteTask { task_id, .. } => self.remove_task(&task_id),
            WriteOp::CheckTaskVersion { .. } => {}
            WriteOp::AddMembership(m) | WriteOp::UpdateMembership(m) => {
                self.memberships
                    .insert((m.task_id.clone(), m.user_id.clone()), m);
            }
            WriteOp::RemoveMembership { task_id, user_id } => {
                self.memberships.remove(&(task_id, user_id));
            }
            WriteOp::CreateInvitation(inv) => {
                self.pending_invites
                    .insert((inv.task_id.clone(), inv.recipient.clone()));
                self.invitations.insert(inv.id.clone(), inv);
            }
            WriteOp::CloseInvitation(inv) => {
                self.pending_invites
                    .remove(&(inv.task_id.clone(), inv.recipient.clone()));
                self.invitations.insert(inv.id.clone(), inv);
            }
            WriteOp::PutSubtask(subtask) | WriteOp::UpdateSubtask { subtask, .. } => {
                self.subtasks.insert(subtask.id.clone(), subtask);
            }
            WriteOp::DeleteSubtask { subtask_id, .. } => {
                self.subtasks.remove(&subtask_id);
            }
            WriteOp::PutThread(thread) => {
                self.threads.insert(thread.id.clone(), thread);
            }
            WriteOp::PutComment(comment) => {
                self.comments.insert(comment.id.clone(), comment);
            }
            WriteOp::AppendEvent(event) => self.events.push(event),
            WriteOp::PutChallenge { challenge, .. } => {
                self.challenges.insert(challenge.user_id.clone(), challenge);
            }
            WriteOp::DeleteChallenge(user_id) => {
                self.challenges.remove(&user_id);
            }
        }
    }

    fn remove_task(&mut self, task_id: &TaskId) {
        self.tasks.remove(task_id);
        self.memberships.retain(|(t, _), _| t != task_id);
        self.invitations.retain(|_, inv| &inv.task_id != task_id);
        self.pending_invites.retain(|(t, _)| t != task_id);
        self.subtasks.retain(|_, s| &s.task_id != task_id);
        self.threads.retain(|_, t| &t.task_id != task_id);
        self.comments.retain(|_, c| &c.task_id != task_id);
        self.events.retain(|e| &e.task_id != task_id);
    }
}

/// メモリ上のボードストア
#[derive(Debug, Default)]
pub struct InMemoryBoardStore {
    state: RwLock<State>,
    injected_conflicts: AtomicU32,
}

impl InMemoryBoardStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 次の `count` 回のコミットをバージョン競合で失敗させる
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    pub async fn task_count(&self) -> usize {
        self.state.read().await.tasks.len()
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BoardStore for InMemoryBoardStore {
    async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>, AppError> {
        Ok(self.state.read().await.tasks.get(task_id).cloned())
    }

    async fn find_task_by_share_token(
        &self,
        token: &ShareToken,
    ) -> Result<Option<Task>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .tasks
            .values()
            .find(|task| &task.share_token == token)
            .cloned())
    }

    async fn list_tasks_for_user(&self, user_id: &UserId) -> Result<Vec<Task>, AppError> {
        let state = self.state.read().await;
        let mut tasks: Vec<Task> = state
            .memberships
            .values()
            .filter(|m| &m.user_id == user_id)
            .filter_map(|m| state.tasks.get(&m.task_id).cloned())
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn list_memberships(&self, task_id: &TaskId) -> Result<Vec<Membership>, AppError> {
        let state = self.state.read().await;
        let mut memberships: Vec<Membership> = state
            .memberships
            .values()
            .filter(|m| &m.task_id == task_id)
            .cloned()
            .collect();
        memberships.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        Ok(memberships)
    }

    async fn get_invitation(
        &self,
        invitation_id: &InvitationId,
    ) -> Result<Option<Invitation>, AppError> {
        Ok(self.state.read().await.invitations.get(invitation_id).cloned())
    }

    async fn list_task_invitations(&self, task_id: &TaskId) -> Result<Vec<Invitation>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .invitations
            .values()
            .filter(|inv| &inv.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn list_invitations_for_recipient(
        &self,
        recipient: &UserId,
    ) -> Result<Vec<Invitation>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .invitations
            .values()
            .rev()
            .filter(|inv| &inv.recipient == recipient)
            .cloned()
            .collect())
    }

    async fn has_pending_invitation(
        &self,
        task_id: &TaskId,
        recipient: &UserId,
    ) -> Result<bool, AppError> {
        Ok(self
            .state
            .read()
            .await
            .pending_invites
            .contains(&(task_id.clone(), recipient.clone())))
    }

    async fn get_subtask(&self, subtask_id: &SubtaskId) -> Result<Option<Subtask>, AppError> {
        Ok(self.state.read().await.subtasks.get(subtask_id).cloned())
    }

    async fn list_subtasks(&self, task_id: &TaskId) -> Result<Vec<Subtask>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .subtasks
            .values()
            .filter(|s| &s.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn list_threads(&self, task_id: &TaskId) -> Result<Vec<ChatThread>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .threads
            .values()
            .filter(|t| &t.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn list_comments(
        &self,
        task_id: &TaskId,
        thread_id: Option<&ThreadId>,
    ) -> Result<Vec<Comment>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .comments
            .values()
            .filter(|c| &c.task_id == task_id)
            .filter(|c| thread_id.is_none() || c.thread_id.as_ref() == thread_id)
            .cloned()
            .collect())
    }

    async fn list_events(&self, task_id: &TaskId) -> Result<Vec<BoardEvent>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .filter(|e| &e.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn get_challenge(
        &self,
        user_id: &UserId,
    ) -> Result<Option<TwoFactorChallenge>, AppError> {
        Ok(self.state.read().await.challenges.get(user_id).cloned())
    }

    async fn find_challenge_by_ticket(
        &self,
        ticket: &str,
    ) -> Result<Option<TwoFactorChallenge>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .challenges
            .values()
            .find(|c| c.ticket == ticket)
            .cloned())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), AppError> {
        // 読み込みとコミットの間に他の処理が割り込めるようにする
        tokio::task::yield_now().await;

        if self.take_injected_conflict() {
            debug!("Injected version conflict");
            return Err(AppError::ConcurrentModification);
        }

        // DynamoDB と同じ上限で弾く
        if batch.item_count() > MAX_BATCH_ITEMS {
            return Err(AppError::InvalidRequest(format!(
                "Too many writes in one transaction: {}",
                batch.item_count()
            )));
        }

        let mut state = self.state.write().await;
        if let Some(failed) = batch.ops().iter().find(|op| !state.check(op)) {
            debug!(op = failed.name(), "Write condition failed");
            return Err(failed.condition_error());
        }

        let size = batch.len();
        for op in batch.into_ops() {
            state.apply(op);
        }
        debug!(ops = size, "Batch committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use domain::{DomainError, NewTask};

    fn new_task() -> Task {
        Task::new(UserId::new(), NewTask::titled("掃除"), Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn test_version_guard_rejects_stale_writes() {
        let store = InMemoryBoardStore::new();
        let task = new_task();
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::CreateTask(task.clone()));
        store.commit(batch).await.unwrap();

        let mut updated = task.clone();
        updated.touch(Utc::now());
        let mut first = WriteBatch::new();
        first.push(WriteOp::UpdateTask {
            task: updated.clone(),
            expected_version: task.version,
        });
        store.commit(first.clone()).await.unwrap();

        // 同じ前提バージョンでの2回目は競合
        let result = store.commit(first).await;
        assert!(matches!(result, Err(AppError::ConcurrentModification)));
        assert_eq!(store.get_task(&task.id).await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_failed_batch_applies_nothing() {
        let store = InMemoryBoardStore::new();
        let task = new_task();
        let member = Membership::new(task.id.clone(), task.owner.clone(), Utc::now());

        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::CreateTask(task.clone()))
            .push(WriteOp::AddMembership(member.clone()));
        store.commit(batch).await.unwrap();

        let subtask = Subtask::new(task.id.clone(), "床を拭く", Utc::now()).unwrap();
        let mut duplicate = WriteBatch::new();
        duplicate
            .push(WriteOp::PutSubtask(subtask))
            .push(WriteOp::AddMembership(member));
        let result = store.commit(duplicate).await;

        assert!(matches!(
            result,
            Err(AppError::Domain(DomainError::AlreadyMember))
        ));
        assert!(store.list_subtasks(&task.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_task_cascades() {
        let store = InMemoryBoardStore::new();
        let task = new_task();
        let now = Utc::now();

        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::CreateTask(task.clone()))
            .push(WriteOp::AddMembership(Membership::new(
                task.id.clone(),
                task.owner.clone(),
                now,
            )))
            .push(WriteOp::PutThread(ChatThread::main(task.id.clone(), now)))
            .push(WriteOp::PutSubtask(
                Subtask::new(task.id.clone(), "買い出し", now).unwrap(),
            ));
        store.commit(batch).await.unwrap();

        let mut delete = WriteBatch::new();
        delete.push(WriteOp::DeleteTask {
            task_id: task.id.clone(),
            expected_version: task.version,
        });
        store.commit(delete).await.unwrap();

        assert!(store.get_task(&task.id).await.unwrap().is_none());
        assert!(store.list_memberships(&task.id).await.unwrap().is_empty());
        assert!(store.list_threads(&task.id).await.unwrap().is_empty());
        assert!(store.list_subtasks(&task.id).await.unwrap().is_empty());
        assert!(store
            .list_tasks_for_user(&task.owner)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_batch_item_limit() {
        let store = InMemoryBoardStore::new();
        let task = new_task();
        let now = Utc::now();

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::CreateTask(task.clone()));
        for _ in 1..MAX_BATCH_ITEMS {
            batch.push(WriteOp::AddMembership(Membership::new(
                task.id.clone(),
                UserId::new(),
                now,
            )));
        }
        assert_eq!(batch.remaining_capacity(), 0);

        let mut oversized = batch.clone();
        oversized.push(WriteOp::PutThread(ChatThread::main(task.id.clone(), now)));
        assert!(matches!(
            store.commit(oversized).await,
            Err(AppError::InvalidRequest(_))
        ));
        assert_eq!(store.task_count().await, 0);

        store.commit(batch).await.unwrap();
        assert_eq!(
            store.list_memberships(&task.id).await.unwrap().len(),
            MAX_BATCH_ITEMS - 1
        );
    }

    #[tokio::test]
    async fn test_stale_subtask_write_after_delete_is_rejected() {
        let store = InMemoryBoardStore::new();
        let task = new_task();
        let subtask = Subtask::new(task.id.clone(), "棚を拭く", Utc::now()).unwrap();

        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::CreateTask(task.clone()))
            .push(WriteOp::PutSubtask(subtask.clone()));
        store.commit(batch).await.unwrap();

        let mut delete = WriteBatch::new();
        delete.push(WriteOp::DeleteSubtask {
            task_id: task.id.clone(),
            subtask_id: subtask.id.clone(),
        });
        store.commit(delete.clone()).await.unwrap();

        // 削除前に読んだ内容での更新は適用されない
        let mut toggled = subtask.clone();
        toggled.toggle();
        let mut update = WriteBatch::new();
        update.push(WriteOp::UpdateSubtask {
            subtask: toggled,
            expected_done: false,
        });
        assert!(matches!(
            store.commit(update).await,
            Err(AppError::ConcurrentModification)
        ));
        assert!(store.get_subtask(&subtask.id).await.unwrap().is_none());
        assert!(matches!(
            store.commit(delete).await,
            Err(AppError::ConcurrentModification)
        ));
    }

    #[tokio::test]
    async fn test_injected_conflicts() {
        let store = InMemoryBoardStore::new();
        store.inject_conflicts(1);

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::CreateTask(new_task()));
        assert!(matches!(
            store.commit(batch.clone()).await,
            Err(AppError::ConcurrentModification)
        ));
        assert!(store.commit(batch).await.is_ok());
        assert_eq!(store.task_count().await, 1);
    }
}
