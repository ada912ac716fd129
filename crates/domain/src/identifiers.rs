use crate::errors::DomainError;
use serde::{Deserialize, Serialize};

/// ULID ベースの識別子型を定義する
macro_rules! ulid_identifier {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// 新しいIDを生成
            pub fn new() -> Self {
                Self(ulid::Ulid::new().to_string())
            }

            /// 文字列からIDを作成
            pub fn from_string(id: String) -> Result<Self, DomainError> {
                if id.trim().is_empty() {
                    return Err(DomainError::InvalidId(format!(
                        "{} cannot be empty",
                        $label
                    )));
                }
                Ok(Self(id))
            }

            /// IDを文字列として取得
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// ULID に埋め込まれた生成時刻（ミリ秒）
            pub fn timestamp_ms(&self) -> Option<u64> {
                ulid::Ulid::from_string(&self.0)
                    .ok()
                    .map(|ulid| ulid.timestamp_ms())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_identifier!(
    /// タスクID
    TaskId,
    "Task ID"
);
ulid_identifier!(
    /// ユーザーID（外部の認証基盤が払い出す値をそのまま保持する）
    UserId,
    "User ID"
);
ulid_identifier!(
    /// 招待ID
    InvitationId,
    "Invitation ID"
);
ulid_identifier!(
    /// サブタスクID
    SubtaskId,
    "Subtask ID"
);
ulid_identifier!(
    /// チャットスレッドID
    ThreadId,
    "Thread ID"
);
ulid_identifier!(
    /// コメントID（ULID なので作成順にソートできる）
    CommentId,
    "Comment ID"
);

/// 招待リンク用の共有トークン
///
/// 推測困難である必要があるため ULID ではなく UUID v4 を使う。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShareToken(String);

impl ShareToken {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn from_string(token: String) -> Result<Self, DomainError> {
        uuid::Uuid::parse_str(&token)
            .map_err(|_| DomainError::InvalidId(format!("Malformed share token: {token}")))?;
        Ok(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ShareToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ShareToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
