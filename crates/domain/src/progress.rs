//! 進捗率と緊急度の集計
//!
//! いずれも読み取り時に計算する値で、永続化はしない。

use crate::membership::Membership;
use crate::subtask::Subtask;
use crate::task::{ProgressMode, Task, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 残り日数がこの値以下なら赤
pub const RED_MAX_REMAINING_DAYS: i64 = 1;
/// 残り日数がこの値以下なら黄
pub const YELLOW_MAX_REMAINING_DAYS: i64 = 3;

/// 期限に対する緊急度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    None,
    Green,
    Yellow,
    Red,
}

/// 切り捨てのパーセンテージ（分母 0 は 0%）
pub fn ratio_percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    // done <= total なので 100 を超えない
    ((done.min(total) * 100) / total) as u8
}

/// 完了メンバー数による進捗率
pub fn membership_progress(memberships: &[Membership]) -> u8 {
    let done = memberships
        .iter()
        .filter(|m| m.status == TaskStatus::Done)
        .count();
    ratio_percent(done, memberships.len())
}

/// 完了サブタスク数による進捗率
pub fn subtask_progress(subtasks: &[Subtask]) -> u8 {
    let done = subtasks.iter().filter(|s| s.done).count();
    ratio_percent(done, subtasks.len())
}

/// タスクの集計方式に従った進捗率
pub fn task_progress(task: &Task, memberships: &[Membership], subtasks: &[Subtask]) -> u8 {
    match task.progress_mode {
        ProgressMode::MembershipRatio => membership_progress(memberships),
        ProgressMode::SubtaskRatio => subtask_progress(subtasks),
    }
}

/// メンバーのステータスからタスクのステータスを導出する
///
/// 全員 done なら done、全員 todo なら todo、それ以外は doing。
/// メンバーがいない場合は todo。
pub fn derive_status(memberships: &[Membership]) -> TaskStatus {
    if memberships.is_empty() {
        return TaskStatus::Todo;
    }
    if memberships.iter().all(|m| m.status == TaskStatus::Done) {
        TaskStatus::Done
    } else if memberships.iter().all(|m| m.status == TaskStatus::Todo) {
        TaskStatus::Todo
    } else {
        TaskStatus::Doing
    }
}

/// 期限までの残り日数（暦日単位、期限切れは負数）
pub fn remaining_days(due_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (due_at.date_naive() - now.date_naive()).num_days()
}

/// 期限から緊急度を判定
pub fn urgency(due_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Urgency {
    let Some(due_at) = due_at else {
        return Urgency::None;
    };
    let remaining = remaining_days(due_at, now);
    if remaining <= RED_MAX_REMAINING_DAYS {
        Urgency::Red
    } else if remaining <= YELLOW_MAX_REMAINING_DAYS {
        Urgency::Yellow
    } else {
        Urgency::Green
    }
}

/// 期限を過ぎていて未完了か
pub fn is_overdue(due_at: Option<DateTime<Utc>>, progress: u8, now: DateTime<Utc>) -> bool {
    match due_at {
        Some(due_at) => due_at < now && progress < 100,
        None => false,
    }
}

/// ボード全体の完了率（完了タスク数 / タスク数）
pub fn board_completion<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> u8 {
    let (done, total) = tasks.into_iter().fold((0, 0), |(done, total), task| {
        (done + usize::from(task.status.is_done()), total + 1)
    });
    ratio_percent(done, total)
}
