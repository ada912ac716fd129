//! タスクとメンバーシップの状態遷移
//!
//! タスクのステータスは常にメンバーのステータスから導出する。ここにある関数は
//! メモリ上の集約を書き換えるだけで、永続化はサービス層が一括で行う。

use crate::errors::DomainError;
use crate::identifiers::UserId;
use crate::membership::{find_membership, Membership};
use crate::progress::derive_status;
use crate::task::{Task, TaskStatus};
use chrono::{DateTime, Utc};

/// タスクステータスの変化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTransition {
    pub previous: TaskStatus,
    pub current: TaskStatus,
}

impl StatusTransition {
    /// done への遷移か
    pub fn completed(&self) -> bool {
        self.previous != TaskStatus::Done && self.current == TaskStatus::Done
    }

    /// done から戻ったか
    pub fn reopened(&self) -> bool {
        self.previous == TaskStatus::Done && self.current != TaskStatus::Done
    }
}

/// オーナーまたはメンバーであることを確認
pub fn ensure_member(
    task: &Task,
    memberships: &[Membership],
    actor: &UserId,
) -> Result<(), DomainError> {
    if task.is_owner(actor) || find_membership(memberships, actor).is_some() {
        Ok(())
    } else {
        Err(DomainError::NotTaskMember {
            task_id: task.id.to_string(),
            user_id: actor.to_string(),
        })
    }
}

/// オーナーであることを確認
pub fn ensure_owner(task: &Task, actor: &UserId) -> Result<(), DomainError> {
    if task.is_owner(actor) {
        Ok(())
    } else {
        Err(DomainError::NotTaskOwner(task.id.to_string()))
    }
}

/// メンバー構成からタスクのステータスを再計算
pub fn refresh_status(task: &mut Task, memberships: &[Membership]) -> StatusTransition {
    let previous = task.status;
    task.status = derive_status(memberships);
    StatusTransition {
        previous,
        current: task.status,
    }
}

/// メンバーのステータスを変更
///
/// オーナーかメンバーであれば、誰のステータスでも変更できる。
pub fn change_member_status(
    task: &mut Task,
    memberships: &mut [Membership],
    actor: &UserId,
    target: &UserId,
    status: TaskStatus,
) -> Result<StatusTransition, DomainError> {
    ensure_member(task, memberships, actor)?;

    let membership = memberships
        .iter_mut()
        .find(|m| &m.user_id == target)
        .ok_or_else(|| DomainError::NotTaskMember {
            task_id: task.id.to_string(),
            user_id: target.to_string(),
        })?;
    membership.status = status;

    Ok(refresh_status(task, memberships))
}

/// メンバーを追加
pub fn add_member(
    task: &mut Task,
    memberships: &mut Vec<Membership>,
    user_id: &UserId,
    now: DateTime<Utc>,
) -> Result<(Membership, StatusTransition), DomainError> {
    if find_membership(memberships, user_id).is_some() {
        return Err(DomainError::AlreadyMember);
    }
    let membership = Membership::new(task.id.clone(), user_id.clone(), now);
    memberships.push(membership.clone());
    let transition = refresh_status(task, memberships);
    Ok((membership, transition))
}

/// メンバーを外す（オーナーは抜けられない）
pub fn remove_member(
    task: &mut Task,
    memberships: &mut Vec<Membership>,
    user_id: &UserId,
) -> Result<(Membership, StatusTransition), DomainError> {
    if task.is_owner(user_id) {
        return Err(DomainError::OwnerCannotLeave);
    }
    let index = memberships
        .iter()
        .position(|m| &m.user_id == user_id)
        .ok_or(DomainError::NotJoined)?;
    let removed = memberships.remove(index);
    let transition = refresh_status(task, memberships);
    Ok((removed, transition))
}

/// 繰り返しのワンショットフラグを戻す
pub fn rearm_recurrence(task: &mut Task, actor: &UserId) -> Result<(), DomainError> {
    ensure_owner(task, actor)?;
    task.recurrence_fired = false;
    task.successor_id = None;
    Ok(())
}
