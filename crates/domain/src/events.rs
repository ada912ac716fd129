use crate::errors::DomainError;
use crate::identifiers::{InvitationId, TaskId, UserId};
use crate::task::{RecurrenceMode, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 参加経路
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinSource {
    Owner,
    Invitation,
    ShareLink,
}

/// タスクごとに記録するドメインイベント
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardEvent {
    pub event_id: String,
    pub task_id: TaskId,
    pub actor: UserId,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_event_version")]
    pub version: String,
    #[serde(flatten)]
    pub kind: BoardEventKind,
}

/// イベント種別
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum BoardEventKind {
    TaskCreatedV1 {
        title: String,
        recurrence: RecurrenceMode,
        due_at: Option<DateTime<Utc>>,
    },
    TaskUpdatedV1 {
        title: String,
    },
    MemberStatusChangedV1 {
        user_id: UserId,
        from: TaskStatus,
        to: TaskStatus,
        task_status: TaskStatus,
    },
    TaskCompletedV1 {
        members: usize,
    },
    TaskReopenedV1 {
        status: TaskStatus,
    },
    RecurrenceSpawnedV1 {
        successor_id: TaskId,
        next_due_at: Option<DateTime<Utc>>,
    },
    RecurrenceRearmedV1 {
        previous_successor: Option<TaskId>,
    },
    /// 後続タスクへ引き継いだメンバー（後続タスク側に1件だけ記録する）
    MembersCarriedOverV1 {
        from_task: TaskId,
        user_ids: Vec<UserId>,
    },
    MemberInvitedV1 {
        invitation_id: InvitationId,
        recipient: UserId,
    },
    InvitationAcceptedV1 {
        invitation_id: InvitationId,
        recipient: UserId,
    },
    InvitationDeclinedV1 {
        invitation_id: InvitationId,
        recipient: UserId,
    },
    MemberJoinedV1 {
        user_id: UserId,
        via: JoinSource,
    },
    MemberLeftV1 {
        user_id: UserId,
    },
}

fn default_event_version() -> String {
    "1.0".to_string()
}

impl BoardEvent {
    pub fn new(task_id: TaskId, actor: UserId, kind: BoardEventKind, now: DateTime<Utc>) -> Self {
        Self {
            event_id: ulid::Ulid::new().to_string(),
            task_id,
            actor,
            timestamp: now,
            version: default_event_version(),
            kind,
        }
    }

    /// イベントタイプ名を取得
    pub fn event_type(&self) -> &'static str {
        match &self.kind {
            BoardEventKind::TaskCreatedV1 { .. } => "task_created_v1",
            BoardEventKind::TaskUpdatedV1 { .. } => "task_updated_v1",
            BoardEventKind::MemberStatusChangedV1 { .. } => "member_status_changed_v1",
            BoardEventKind::TaskCompletedV1 { .. } => "task_completed_v1",
            BoardEventKind::TaskReopenedV1 { .. } => "task_reopened_v1",
            BoardEventKind::RecurrenceSpawnedV1 { .. } => "recurrence_spawned_v1",
            BoardEventKind::RecurrenceRearmedV1 { .. } => "recurrence_rearmed_v1",
            BoardEventKind::MembersCarriedOverV1 { .. } => "members_carried_over_v1",
            BoardEventKind::MemberInvitedV1 { .. } => "member_invited_v1",
            BoardEventKind::InvitationAcceptedV1 { .. } => "invitation_accepted_v1",
            BoardEventKind::InvitationDeclinedV1 { .. } => "invitation_declined_v1",
            BoardEventKind::MemberJoinedV1 { .. } => "member_joined_v1",
            BoardEventKind::MemberLeftV1 { .. } => "member_left_v1",
        }
    }

    /// イベントをJSONにシリアライズ
    pub fn to_json(&self) -> Result<String, DomainError> {
        serde_json::to_string(self).map_err(|e| DomainError::EventSerialization(e.to_string()))
    }

    /// JSONからイベントをデシリアライズ
    pub fn from_json(json: &str) -> Result<Self, DomainError> {
        serde_json::from_str(json).map_err(|e| DomainError::EventDeserialization(e.to_string()))
    }
}
