use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, Utc};
use domain::{
    BoardEvent, ChatThread, Comment, Invitation, InvitationId, Membership, ShareToken, Subtask,
    SubtaskId, Task, TaskId, TwoFactorChallenge, UserId,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::AppError;
use std::collections::HashMap;

/// DynamoDB アイテムのエンティティタイプ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityType {
    Task,
    Membership,
    Invitation,
    PendingInvite,
    Subtask,
    Thread,
    Comment,
    Event,
    Challenge,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Task => "Task",
            EntityType::Membership => "Membership",
            EntityType::Invitation => "Invitation",
            EntityType::PendingInvite => "PendingInvite",
            EntityType::Subtask => "Subtask",
            EntityType::Thread => "Thread",
            EntityType::Comment => "Comment",
            EntityType::Event => "Event",
            EntityType::Challenge => "Challenge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Task" => Some(EntityType::Task),
            "Membership" => Some(EntityType::Membership),
            "Invitation" => Some(EntityType::Invitation),
            "PendingInvite" => Some(EntityType::PendingInvite),
            "Subtask" => Some(EntityType::Subtask),
            "Thread" => Some(EntityType::Thread),
            "Comment" => Some(EntityType::Comment),
            "Event" => Some(EntityType::Event),
            "Challenge" => Some(EntityType::Challenge),
            _ => None,
        }
    }
}

/// ソートキーの接頭辞
pub mod sk {
    pub const TASK_META: &str = "META";
    pub const MEMBER: &str = "MEMBER#";
    pub const INVITATION: &str = "INVITATION#";
    pub const PENDING_INVITE: &str = "PENDING_INVITE#";
    pub const SUBTASK: &str = "SUBTASK#";
    pub const THREAD: &str = "THREAD#";
    pub const COMMENT: &str = "COMMENT#";
    pub const EVENT: &str = "EVENT#";
    pub const CHALLENGE: &str = "CHALLENGE";
}

/// DynamoDB Single Table Design のキー構造
///
/// GSI1 はユーザー起点の一覧、GSI2 は ID・トークンからの逆引きに使う。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamoDbKeys {
    pub pk: String,
    pub sk: String,
    pub gsi1_pk: Option<String>,
    pub gsi1_sk: Option<String>,
    pub gsi2_pk: Option<String>,
}

impl DynamoDbKeys {
    fn base(pk: String, sk: String) -> Self {
        Self {
            pk,
            sk,
            gsi1_pk: None,
            gsi1_sk: None,
            gsi2_pk: None,
        }
    }

    pub fn task_pk(task_id: &TaskId) -> String {
        format!("TASK#{}", task_id.as_str())
    }

    pub fn user_pk(user_id: &UserId) -> String {
        format!("USER#{}", user_id.as_str())
    }

    pub fn for_task(task_id: &TaskId, share_token: &ShareToken) -> Self {
        let mut keys = Self::base(Self::task_pk(task_id), sk::TASK_META.to_string());
        keys.gsi2_pk = Some(Self::share_token_index(share_token));
        keys
    }

    pub fn share_token_index(token: &ShareToken) -> String {
        format!("SHARE#{}", token.as_str())
    }

    pub fn for_membership(task_id: &TaskId, user_id: &UserId) -> Self {
        let mut keys = Self::base(
            Self::task_pk(task_id),
            format!("{}{}", sk::MEMBER, user_id.as_str()),
        );
        keys.gsi1_pk = Some(Self::user_pk(user_id));
        keys.gsi1_sk = Some(Self::task_pk(task_id));
        keys
    }

    pub fn for_invitation(task_id: &TaskId, invitation_id: &InvitationId, recipient: &UserId) -> Self {
        let mut keys = Self::base(
            Self::task_pk(task_id),
            format!("{}{}", sk::INVITATION, invitation_id.as_str()),
        );
        keys.gsi1_pk = Some(Self::invitee_index(recipient));
        keys.gsi1_sk = Some(format!("{}{}", sk::INVITATION, invitation_id.as_str()));
        keys.gsi2_pk = Some(Self::invitation_index(invitation_id));
        keys
    }

    pub fn invitee_index(recipient: &UserId) -> String {
        format!("INVITEE#{}", recipient.as_str())
    }

    pub fn invitation_index(invitation_id: &InvitationId) -> String {
        format!("INVITATION#{}", invitation_id.as_str())
    }

    /// 保留中の招待を (タスク, 受信者) で一意にするためのロック
    pub fn for_pending_invite(task_id: &TaskId, recipient: &UserId) -> Self {
        Self::base(
            Self::task_pk(task_id),
            format!("{}{}", sk::PENDING_INVITE, recipient.as_str()),
        )
    }

    pub fn for_subtask(task_id: &TaskId, subtask_id: &SubtaskId) -> Self {
        let mut keys = Self::base(
            Self::task_pk(task_id),
            format!("{}{}", sk::SUBTASK, subtask_id.as_str()),
        );
        keys.gsi2_pk = Some(Self::subtask_index(subtask_id));
        keys
    }

    pub fn subtask_index(subtask_id: &SubtaskId) -> String {
        format!("SUBTASK#{}", subtask_id.as_str())
    }

    pub fn for_thread(thread: &ChatThread) -> Self {
        Self::base(
            Self::task_pk(&thread.task_id),
            format!("{}{}", sk::THREAD, thread.id.as_str()),
        )
    }

    pub fn for_comment(comment: &Comment) -> Self {
        Self::base(
            Self::task_pk(&comment.task_id),
            format!("{}{}", sk::COMMENT, comment.id.as_str()),
        )
    }

    pub fn for_event(event: &BoardEvent) -> Self {
        Self::base(
            Self::task_pk(&event.task_id),
            format!("{}{}", sk::EVENT, event.event_id),
        )
    }

    pub fn for_challenge(user_id: &UserId) -> Self {
        Self::base(Self::user_pk(user_id), sk::CHALLENGE.to_string())
    }

    pub fn ticket_index(ticket: &str) -> String {
        format!("TICKET#{ticket}")
    }
}

/// DynamoDB アイテムの基本構造
#[derive(Debug, Clone)]
pub struct DynamoDbItem {
    pub keys: DynamoDbKeys,
    pub entity_type: EntityType,
    pub data: serde_json::Value,
    pub version: u64,
    pub ttl: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

impl DynamoDbItem {
    /// エンティティを JSON にしてアイテムを作成
    pub fn encode<T: Serialize>(
        keys: DynamoDbKeys,
        entity_type: EntityType,
        entity: &T,
        version: u64,
    ) -> Result<Self, AppError> {
        let data = serde_json::to_value(entity).map_err(|e| {
            AppError::Serialization(format!("Failed to serialize {}: {e}", entity_type.as_str()))
        })?;
        Ok(Self {
            keys,
            entity_type,
            data,
            version,
            ttl: None,
            updated_at: Utc::now(),
        })
    }

    pub fn with_ttl(mut self, ttl: i64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Data を指定のエンティティとして復元
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, AppError> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            AppError::Deserialization(format!(
                "Failed to deserialize {}: {e}",
                self.entity_type.as_str()
            ))
        })
    }

    /// DynamoDB AttributeValue マップに変換
    pub fn to_attribute_map(&self) -> HashMap<String, AttributeValue> {
        let mut map = HashMap::new();

        map.insert("PK".to_string(), AttributeValue::S(self.keys.pk.clone()));
        map.insert("SK".to_string(), AttributeValue::S(self.keys.sk.clone()));
        map.insert(
            "EntityType".to_string(),
            AttributeValue::S(self.entity_type.as_str().to_string()),
        );
        if let Some(gsi1_pk) = &self.keys.gsi1_pk {
            map.insert("GSI1PK".to_string(), AttributeValue::S(gsi1_pk.clone()));
        }
        if let Some(gsi1_sk) = &self.keys.gsi1_sk {
            map.insert("GSI1SK".to_string(), AttributeValue::S(gsi1_sk.clone()));
        }
        if let Some(gsi2_pk) = &self.keys.gsi2_pk {
            map.insert("GSI2PK".to_string(), AttributeValue::S(gsi2_pk.clone()));
        }
        map.insert("Data".to_string(), AttributeValue::S(self.data.to_string()));
        map.insert(
            "Version".to_string(),
            AttributeValue::N(self.version.to_string()),
        );
        if let Some(ttl) = self.ttl {
            map.insert("TTL".to_string(), AttributeValue::N(ttl.to_string()));
        }
        map.insert(
            "UpdatedAt".to_string(),
            AttributeValue::S(self.updated_at.to_rfc3339()),
        );

        map
    }

    /// DynamoDB AttributeValue マップから復元
    pub fn from_attribute_map(map: &HashMap<String, AttributeValue>) -> Result<Self, AppError> {
        let string_attr = |name: &str| map.get(name).and_then(|v| v.as_s().ok()).cloned();
        let missing = |name: &str| AppError::Deserialization(format!("Missing {name}"));

        let pk = string_attr("PK").ok_or_else(|| missing("PK"))?;
        let sk = string_attr("SK").ok_or_else(|| missing("SK"))?;
        let entity_type = string_attr("EntityType")
            .and_then(|s| EntityType::parse(&s))
            .ok_or_else(|| missing("EntityType"))?;
        let data_str = string_attr("Data").ok_or_else(|| missing("Data"))?;
        let data: serde_json::Value = serde_json::from_str(&data_str)
            .map_err(|e| AppError::Deserialization(format!("Failed to parse Data JSON: {e}")))?;
        let version = map
            .get("Version")
            .and_then(|v| v.as_n().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| missing("Version"))?;
        let ttl = map
            .get("TTL")
            .and_then(|v| v.as_n().ok())
            .and_then(|s| s.parse::<i64>().ok());
        let updated_at = string_attr("UpdatedAt")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Self {
            keys: DynamoDbKeys {
                pk,
                sk,
                gsi1_pk: string_attr("GSI1PK"),
                gsi1_sk: string_attr("GSI1SK"),
                gsi2_pk: string_attr("GSI2PK"),
            },
            entity_type,
            data,
            version,
            ttl,
            updated_at,
        })
    }
}

/// ドメインエンティティをアイテムに変換する
pub fn task_item(task: &Task) -> Result<DynamoDbItem, AppError> {
    DynamoDbItem::encode(
        DynamoDbKeys::for_task(&task.id, &task.share_token),
        EntityType::Task,
        task,
        task.version,
    )
}

pub fn membership_item(membership: &Membership) -> Result<DynamoDbItem, AppError> {
    DynamoDbItem::encode(
        DynamoDbKeys::for_membership(&membership.task_id, &membership.user_id),
        EntityType::Membership,
        membership,
        1,
    )
}

pub fn invitation_item(invitation: &Invitation) -> Result<DynamoDbItem, AppError> {
    DynamoDbItem::encode(
        DynamoDbKeys::for_invitation(&invitation.task_id, &invitation.id, &invitation.recipient),
        EntityType::Invitation,
        invitation,
        1,
    )
}

pub fn pending_invite_item(invitation: &Invitation) -> Result<DynamoDbItem, AppError> {
    DynamoDbItem::encode(
        DynamoDbKeys::for_pending_invite(&invitation.task_id, &invitation.recipient),
        EntityType::PendingInvite,
        &invitation.id,
        1,
    )
}

pub fn subtask_item(subtask: &Subtask) -> Result<DynamoDbItem, AppError> {
    DynamoDbItem::encode(
        DynamoDbKeys::for_subtask(&subtask.task_id, &subtask.id),
        EntityType::Subtask,
        subtask,
        1,
    )
}

pub fn thread_item(thread: &ChatThread) -> Result<DynamoDbItem, AppError> {
    DynamoDbItem::encode(DynamoDbKeys::for_thread(thread), EntityType::Thread, thread, 1)
}

pub fn comment_item(comment: &Comment) -> Result<DynamoDbItem, AppError> {
    DynamoDbItem::encode(DynamoDbKeys::for_comment(comment), EntityType::Comment, comment, 1)
}

pub fn event_item(event: &BoardEvent) -> Result<DynamoDbItem, AppError> {
    DynamoDbItem::encode(DynamoDbKeys::for_event(event), EntityType::Event, event, 1)
}

/// チャレンジは有効期限の1日後に TTL で消える
pub fn challenge_item(challenge: &TwoFactorChallenge) -> Result<DynamoDbItem, AppError> {
    let mut keys = DynamoDbKeys::for_challenge(&challenge.user_id);
    keys.gsi2_pk = Some(DynamoDbKeys::ticket_index(&challenge.ticket));
    let ttl = (challenge.expires_at() + chrono::Duration::days(1)).timestamp();
    Ok(DynamoDbItem::encode(keys, EntityType::Challenge, challenge, 1)?.with_ttl(ttl))
}
