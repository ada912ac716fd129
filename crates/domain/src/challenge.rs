//! 二段階認証のワンタイムコード

use crate::identifiers::UserId;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// コードの桁数
pub const CODE_LENGTH: usize = 6;
/// コードの有効期間（分）
pub const CHALLENGE_VALIDITY_MINUTES: i64 = 10;

/// 6桁の数字コードを生成（先頭ゼロあり）
pub fn generate_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!("{:0width$}", rng.gen_range(0..1_000_000u32), width = CODE_LENGTH)
}

/// ユーザーごとに1件だけ保持するチャレンジ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwoFactorChallenge {
    pub user_id: UserId,
    /// 検証に成功すると空になる
    pub code: String,
    /// ログイン途中の状態を引き継ぐためのチケット
    pub ticket: String,
    pub updated_at: DateTime<Utc>,
}

impl TwoFactorChallenge {
    /// 新しいコードとチケットでチャレンジを発行
    pub fn issue<R: Rng + ?Sized>(user_id: UserId, rng: &mut R, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            code: generate_code(rng),
            ticket: uuid::Uuid::new_v4().to_string(),
            updated_at: now,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.updated_at + Duration::minutes(CHALLENGE_VALIDITY_MINUTES)
    }

    /// 発行から10分未満で、まだ使われていないか
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.code.is_empty() && now < self.expires_at()
    }

    /// コードを検証する。成功時はコードを消して再利用できなくする
    pub fn verify(&mut self, code: &str, now: DateTime<Utc>) -> bool {
        if !self.is_active(now) || self.code != code {
            return false;
        }
        self.code.clear();
        true
    }
}
