use crate::errors::DomainError;
use crate::identifiers::{InvitationId, TaskId, UserId};
use crate::lifecycle::ensure_member;
use crate::membership::{find_membership, Membership};
use crate::task::Task;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 招待ステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Declined,
}

impl InvitationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvitationStatus::Pending => "pending",
            InvitationStatus::Accepted => "accepted",
            InvitationStatus::Declined => "declined",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, InvitationStatus::Pending)
    }
}

/// 招待への回答
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationResponse {
    Accept,
    Decline,
}

impl InvitationResponse {
    fn resulting_status(&self) -> InvitationStatus {
        match self {
            InvitationResponse::Accept => InvitationStatus::Accepted,
            InvitationResponse::Decline => InvitationStatus::Declined,
        }
    }
}

/// 回答処理の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// 今回の回答でステータスが確定した
    Recorded(InvitationStatus),
    /// 同じ回答が既に記録済み（冪等）
    AlreadyRecorded(InvitationStatus),
}

impl ResponseOutcome {
    pub fn status(&self) -> InvitationStatus {
        match self {
            ResponseOutcome::Recorded(s) | ResponseOutcome::AlreadyRecorded(s) => *s,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, ResponseOutcome::Recorded(_))
    }
}

/// タスクへの招待
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub id: InvitationId,
    pub task_id: TaskId,
    pub sender: UserId,
    pub recipient: UserId,
    pub status: InvitationStatus,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl Invitation {
    /// 招待を作成する
    ///
    /// 送信者の権限、自己招待、既存メンバー、保留中の招待の順に検査する。
    pub fn create(
        task: &Task,
        memberships: &[Membership],
        pending_exists: bool,
        sender: &UserId,
        recipient: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        ensure_member(task, memberships, sender)?;
        if sender == recipient {
            return Err(DomainError::SelfInvite);
        }
        if task.is_owner(recipient) || find_membership(memberships, recipient).is_some() {
            return Err(DomainError::AlreadyMember);
        }
        if pending_exists {
            return Err(DomainError::AlreadyInvited);
        }

        Ok(Self {
            id: InvitationId::new(),
            task_id: task.id.clone(),
            sender: sender.clone(),
            recipient: recipient.clone(),
            status: InvitationStatus::Pending,
            created_at: now,
            responded_at: None,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.status == InvitationStatus::Pending
    }

    /// 招待に回答する（受信者のみ）
    pub fn respond(
        &mut self,
        actor: &UserId,
        response: InvitationResponse,
        now: DateTime<Utc>,
    ) -> Result<ResponseOutcome, DomainError> {
        if actor != &self.recipient {
            return Err(DomainError::NotInvitationRecipient(self.id.to_string()));
        }

        let requested = response.resulting_status();
        match self.status {
            InvitationStatus::Pending => {
                self.status = requested;
                self.responded_at = Some(now);
                Ok(ResponseOutcome::Recorded(requested))
            }
            current if current == requested => Ok(ResponseOutcome::AlreadyRecorded(current)),
            current => Err(DomainError::InvitationClosed(current.as_str().to_string())),
        }
    }
}
