//! 繰り返しタスクの後続生成

use crate::identifiers::{ShareToken, TaskId};
use crate::membership::Membership;
use crate::task::{RecurrenceMode, Task, TaskStatus};
use chrono::{DateTime, Duration, Months, Utc};

/// 次回の期限を計算する
///
/// 月次は暦月を加算し、存在しない日は月末に丸める（1/31 → 2/28 または 2/29）。
pub fn next_due(mode: RecurrenceMode, due_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match mode {
        RecurrenceMode::None => None,
        RecurrenceMode::Daily => due_at.checked_add_signed(Duration::days(1)),
        RecurrenceMode::Weekly => due_at.checked_add_signed(Duration::days(7)),
        RecurrenceMode::Monthly => due_at.checked_add_months(Months::new(1)),
    }
}

/// 後続タスクを生成すべきか
pub fn should_spawn(task: &Task) -> bool {
    task.status == TaskStatus::Done
        && task.recurrence.is_recurring()
        && task.due_at.is_some()
        && !task.recurrence_fired
}

/// 生成された後続タスクとそのメンバー
#[derive(Debug, Clone, PartialEq)]
pub struct Successor {
    pub task: Task,
    pub memberships: Vec<Membership>,
}

/// 完了したタスクから後続タスクを生成する
///
/// 生成した場合は元タスクに `recurrence_fired` と `successor_id` を記録する。
/// 条件を満たさない場合は何もせず `None` を返す。
pub fn spawn_successor(
    task: &mut Task,
    memberships: &[Membership],
    now: DateTime<Utc>,
) -> Option<Successor> {
    if !should_spawn(task) {
        return None;
    }
    let next_due = task.due_at.and_then(|due| next_due(task.recurrence, due))?;

    let successor_task = Task {
        id: TaskId::new(),
        title: task.title.clone(),
        description: task.description.clone(),
        due_at: Some(next_due),
        status: TaskStatus::Todo,
        recurrence: task.recurrence,
        progress_mode: task.progress_mode,
        category: task.category.clone(),
        owner: task.owner.clone(),
        share_token: ShareToken::new(),
        created_at: now,
        updated_at: now,
        version: 1,
        recurrence_fired: false,
        successor_id: None,
    };

    let mut successor_members: Vec<Membership> = memberships
        .iter()
        .map(|m| m.carry_over(successor_task.id.clone(), now))
        .collect();
    if !successor_members
        .iter()
        .any(|m| m.user_id == successor_task.owner)
    {
        successor_members.push(Membership::new(
            successor_task.id.clone(),
            successor_task.owner.clone(),
            now,
        ));
    }

    task.recurrence_fired = true;
    task.successor_id = Some(successor_task.id.clone());

    Some(Successor {
        task: successor_task,
        memberships: successor_members,
    })
}
