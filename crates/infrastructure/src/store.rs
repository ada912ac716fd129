use async_trait::async_trait;
use domain::{
    BoardEvent, ChatThread, Comment, DomainError, Invitation, InvitationId, Membership,
    ShareToken, Subtask, SubtaskId, Task, TaskId, ThreadId, TwoFactorChallenge, UserId,
};
use shared::AppError;

/// 1回のコミットに含められる書き込み項目数（DynamoDB TransactWriteItems の上限）
pub const MAX_BATCH_ITEMS: usize = 100;

/// 一括で適用する書き込み操作
///
/// 各操作は前提条件を持ち、1つでも満たされなければバッチ全体が適用されない。
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// 新規タスク（同じIDが存在しないこと）
    CreateTask(Task),
    /// タスクの更新（保存済みバージョンが `expected_version` であること）
    UpdateTask { task: Task, expected_version: u64 },
    /// タスクと配下のデータをすべて削除
    DeleteTask {
        task_id: TaskId,
        expected_version: u64,
    },
    /// 書き込みはせずバージョンだけ検査する
    CheckTaskVersion {
        task_id: TaskId,
        expected_version: u64,
    },
    /// メンバー追加（未参加であること）
    AddMembership(Membership),
    /// メンバーの更新（参加済みであること）
    UpdateMembership(Membership),
    RemoveMembership { task_id: TaskId, user_id: UserId },
    /// 招待の作成（同じ受信者への保留中の招待がないこと）
    CreateInvitation(Invitation),
    /// 招待の確定（まだ保留中であること）
    CloseInvitation(Invitation),
    /// 新規サブタスク（同じIDが存在しないこと）
    PutSubtask(Subtask),
    /// サブタスクの更新（存在し、完了フラグが `expected_done` のままであること）
    UpdateSubtask {
        subtask: Subtask,
        expected_done: bool,
    },
    /// サブタスクの削除（存在すること）
    DeleteSubtask {
        task_id: TaskId,
        subtask_id: SubtaskId,
    },
    PutThread(ChatThread),
    PutComment(Comment),
    AppendEvent(BoardEvent),
    /// チャレンジの保存。`expected_code` があれば保存済みのコードと一致すること
    PutChallenge {
        challenge: TwoFactorChallenge,
        expected_code: Option<String>,
    },
    DeleteChallenge(UserId),
}

impl WriteOp {
    /// 前提条件が満たされなかったときのエラー
    pub fn condition_error(&self) -> AppError {
        match self {
            WriteOp::AddMembership(_) => DomainError::AlreadyMember.into(),
            WriteOp::CreateInvitation(_) => DomainError::AlreadyInvited.into(),
            _ => AppError::ConcurrentModification,
        }
    }

    /// ストア上の書き込み項目数。招待は保留ロックの分だけ多い
    pub fn item_count(&self) -> usize {
        match self {
            WriteOp::CreateInvitation(_) | WriteOp::CloseInvitation(_) => 2,
            _ => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WriteOp::CreateTask(_) => "create_task",
            WriteOp::UpdateTask { .. } => "update_task",
            WriteOp::DeleteTask { .. } => "delete_task",
            WriteOp::CheckTaskVersion { .. } => "check_task_version",
            WriteOp::AddMembership(_) => "add_membership",
            WriteOp::UpdateMembership(_) => "update_membership",
            WriteOp::RemoveMembership { .. } => "remove_membership",
            WriteOp::CreateInvitation(_) => "create_invitation",
            WriteOp::CloseInvitation(_) => "close_invitation",
            WriteOp::PutSubtask(_) => "put_subtask",
            WriteOp::UpdateSubtask { .. } => "update_subtask",
            WriteOp::DeleteSubtask { .. } => "delete_subtask",
            WriteOp::PutThread(_) => "put_thread",
            WriteOp::PutComment(_) => "put_comment",
            WriteOp::AppendEvent(_) => "append_event",
            WriteOp::PutChallenge { .. } => "put_challenge",
            WriteOp::DeleteChallenge(_) => "delete_challenge",
        }
    }
}

/// アトミックに適用する書き込みの集合
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn event(&mut self, event: BoardEvent) -> &mut Self {
        self.push(WriteOp::AppendEvent(event))
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn item_count(&self) -> usize {
        self.ops.iter().map(WriteOp::item_count).sum()
    }

    /// 上限まであと何項目積めるか
    pub fn remaining_capacity(&self) -> usize {
        MAX_BATCH_ITEMS.saturating_sub(self.item_count())
    }
}

/// ボードの永続化
#[async_trait]
pub trait BoardStore: Send + Sync {
    async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>, AppError>;

    async fn find_task_by_share_token(&self, token: &ShareToken)
        -> Result<Option<Task>, AppError>;

    /// ユーザーが参加しているタスク（オーナーとして作成したものを含む）
    async fn list_tasks_for_user(&self, user_id: &UserId) -> Result<Vec<Task>, AppError>;

    async fn list_memberships(&self, task_id: &TaskId) -> Result<Vec<Membership>, AppError>;

    async fn get_invitation(
        &self,
        invitation_id: &InvitationId,
    ) -> Result<Option<Invitation>, AppError>;

    async fn list_task_invitations(&self, task_id: &TaskId) -> Result<Vec<Invitation>, AppError>;

    /// 受信者宛ての招待（新しい順）
    async fn list_invitations_for_recipient(
        &self,
        recipient: &UserId,
    ) -> Result<Vec<Invitation>, AppError>;

    async fn has_pending_invitation(
        &self,
        task_id: &TaskId,
        recipient: &UserId,
    ) -> Result<bool, AppError>;

    async fn get_subtask(&self, subtask_id: &SubtaskId) -> Result<Option<Subtask>, AppError>;

    /// 作成順
    async fn list_subtasks(&self, task_id: &TaskId) -> Result<Vec<Subtask>, AppError>;

    async fn list_threads(&self, task_id: &TaskId) -> Result<Vec<ChatThread>, AppError>;

    /// 作成順。`thread_id` を指定するとそのスレッドのみ
    async fn list_comments(
        &self,
        task_id: &TaskId,
        thread_id: Option<&ThreadId>,
    ) -> Result<Vec<Comment>, AppError>;

    async fn list_events(&self, task_id: &TaskId) -> Result<Vec<BoardEvent>, AppError>;

    async fn get_challenge(&self, user_id: &UserId)
        -> Result<Option<TwoFactorChallenge>, AppError>;

    async fn find_challenge_by_ticket(
        &self,
        ticket: &str,
    ) -> Result<Option<TwoFactorChallenge>, AppError>;

    /// バッチを全体として適用する
    async fn commit(&self, batch: WriteBatch) -> Result<(), AppError>;
}
