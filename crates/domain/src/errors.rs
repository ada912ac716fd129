use serde::{Deserialize, Serialize};
use thiserror::Error;

/// ドメインエラーの分類
///
/// フロントエンドはこの分類と [`DomainError::code`] を組み合わせて表示を切り替える。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    Conflict,
    Validation,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    // 存在しないリソース
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invitation not found: {0}")]
    InvitationNotFound(String),

    #[error("Subtask not found: {0}")]
    SubtaskNotFound(String),

    #[error("Chat thread not found: {0}")]
    ThreadNotFound(String),

    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("No task is shared with token: {0}")]
    ShareTokenNotFound(String),

    #[error("No active two-factor challenge")]
    ChallengeNotFound,

    // 権限
    #[error("User {user_id} is not a member of task {task_id}")]
    NotTaskMember { task_id: String, user_id: String },

    #[error("Only the owner can perform this operation on task {0}")]
    NotTaskOwner(String),

    #[error("Only the recipient can respond to invitation {0}")]
    NotInvitationRecipient(String),

    // 競合
    #[error("User is already invited to this task")]
    AlreadyInvited,

    #[error("User is already a member of this task")]
    AlreadyMember,

    #[error("Cannot invite yourself")]
    SelfInvite,

    #[error("Invitation is already {0}")]
    InvitationClosed(String),

    #[error("The owner cannot leave their own task")]
    OwnerCannotLeave,

    #[error("User has not joined this task")]
    NotJoined,

    // バリデーション
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Invalid recurrence mode: {0}")]
    InvalidRecurrenceMode(String),

    #[error("Invalid progress mode: {0}")]
    InvalidProgressMode(String),

    #[error("Invalid id: {0}")]
    InvalidId(String),

    #[error("Event serialization error: {0}")]
    EventSerialization(String),

    #[error("Event deserialization error: {0}")]
    EventDeserialization(String),
}

impl DomainError {
    /// エラー分類を取得
    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::TaskNotFound(_)
            | DomainError::InvitationNotFound(_)
            | DomainError::SubtaskNotFound(_)
            | DomainError::ThreadNotFound(_)
            | DomainError::UnknownUser(_)
            | DomainError::ShareTokenNotFound(_)
            | DomainError::ChallengeNotFound => ErrorKind::NotFound,

            DomainError::NotTaskMember { .. }
            | DomainError::NotTaskOwner(_)
            | DomainError::NotInvitationRecipient(_) => ErrorKind::PermissionDenied,

            DomainError::AlreadyInvited
            | DomainError::AlreadyMember
            | DomainError::SelfInvite
            | DomainError::InvitationClosed(_)
            | DomainError::OwnerCannotLeave
            | DomainError::NotJoined => ErrorKind::Conflict,

            DomainError::Validation(_)
            | DomainError::InvalidStatus(_)
            | DomainError::InvalidRecurrenceMode(_)
            | DomainError::InvalidProgressMode(_)
            | DomainError::InvalidId(_)
            | DomainError::EventSerialization(_)
            | DomainError::EventDeserialization(_) => ErrorKind::Validation,
        }
    }

    /// 機械可読なエラーコード
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::TaskNotFound(_) => "TASK_NOT_FOUND",
            DomainError::InvitationNotFound(_) => "INVITATION_NOT_FOUND",
            DomainError::SubtaskNotFound(_) => "SUBTASK_NOT_FOUND",
            DomainError::ThreadNotFound(_) => "THREAD_NOT_FOUND",
            DomainError::UnknownUser(_) => "UNKNOWN_USER",
            DomainError::ShareTokenNotFound(_) => "SHARE_TOKEN_NOT_FOUND",
            DomainError::ChallengeNotFound => "CHALLENGE_NOT_FOUND",
            DomainError::NotTaskMember { .. } => "NOT_TASK_MEMBER",
            DomainError::NotTaskOwner(_) => "NOT_TASK_OWNER",
            DomainError::NotInvitationRecipient(_) => "NOT_INVITATION_RECIPIENT",
            DomainError::AlreadyInvited => "ALREADY_INVITED",
            DomainError::AlreadyMember => "ALREADY_MEMBER",
            DomainError::SelfInvite => "SELF_INVITE",
            DomainError::InvitationClosed(_) => "INVITATION_CLOSED",
            DomainError::OwnerCannotLeave => "OWNER_CANNOT_LEAVE",
            DomainError::NotJoined => "NOT_JOINED",
            DomainError::Validation(_) => "VALIDATION_ERROR",
            DomainError::InvalidStatus(_) => "INVALID_STATUS",
            DomainError::InvalidRecurrenceMode(_) => "INVALID_RECURRENCE_MODE",
            DomainError::InvalidProgressMode(_) => "INVALID_PROGRESS_MODE",
            DomainError::InvalidId(_) => "INVALID_ID",
            DomainError::EventSerialization(_) => "EVENT_SERIALIZATION_ERROR",
            DomainError::EventDeserialization(_) => "EVENT_DESERIALIZATION_ERROR",
        }
    }
}

/// 必須テキストを検証してトリム済みの値を返す
pub fn require_text(field: &str, value: &str, max_chars: usize) -> Result<String, DomainError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DomainError::Validation(format!("{field} is required")));
    }
    if trimmed.chars().count() > max_chars {
        return Err(DomainError::Validation(format!(
            "{field} must be at most {max_chars} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// 任意テキストを正規化（空文字は None）
pub fn optional_text(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invitation_errors_are_distinguishable() {
        let errors = [
            DomainError::AlreadyInvited,
            DomainError::AlreadyMember,
            DomainError::SelfInvite,
            DomainError::UnknownUser("ghost".to_string()),
        ];
        let codes: Vec<&str> = errors.iter().map(|e| e.code()).collect();
        assert_eq!(
            codes,
            vec!["ALREADY_INVITED", "ALREADY_MEMBER", "SELF_INVITE", "UNKNOWN_USER"]
        );
        assert_eq!(errors[3].kind(), ErrorKind::NotFound);
        assert_eq!(errors[0].kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_require_text() {
        assert_eq!(require_text("title", "  レポート ", 10).unwrap(), "レポート");
        assert!(require_text("title", "   ", 10).is_err());
        assert!(require_text("title", "abcdefghijk", 10).is_err());
    }

    #[test]
    fn test_optional_text() {
        assert_eq!(optional_text(Some("  ".to_string())), None);
        assert_eq!(optional_text(Some(" メモ ".to_string())), Some("メモ".to_string()));
        assert_eq!(optional_text(None), None);
    }
}
