//! 二段階認証のチャレンジ発行と検証

use crate::identity::IdentityStore;
use crate::mailer::Mailer;
use crate::store::{BoardStore, WriteBatch, WriteOp};
use domain::{Clock, TwoFactorChallenge, UserId, CHALLENGE_VALIDITY_MINUTES};
use serde::Serialize;
use shared::AppError;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 発行したチャレンジ（コードは帯域外で届ける）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedChallenge {
    pub ticket: String,
    pub code: String,
}

/// パスワード確認後に返すログインチケット
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginTicket {
    pub user_id: UserId,
    pub ticket: String,
}

pub struct ChallengeService {
    store: Arc<dyn BoardStore>,
    identity: Arc<dyn IdentityStore>,
    mailer: Arc<dyn Mailer>,
    clock: Arc<dyn Clock>,
}

impl ChallengeService {
    pub fn new(
        store: Arc<dyn BoardStore>,
        identity: Arc<dyn IdentityStore>,
        mailer: Arc<dyn Mailer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            identity,
            mailer,
            clock,
        }
    }

    /// 新しいコードを発行（既存のチャレンジは上書き）
    pub async fn issue_challenge(&self, user_id: &UserId) -> Result<IssuedChallenge, AppError> {
        let challenge =
            TwoFactorChallenge::issue(user_id.clone(), &mut rand::thread_rng(), self.clock.now());
        let issued = IssuedChallenge {
            ticket: challenge.ticket.clone(),
            code: challenge.code.clone(),
        };

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::PutChallenge {
            challenge,
            expected_code: None,
        });
        self.store.commit(batch).await?;

        info!("チャレンジを発行: user_id={}", user_id);
        Ok(issued)
    }

    /// ユーザーのコードを検証（成功したコードは再利用できない）
    pub async fn verify_challenge(&self, user_id: &UserId, code: &str) -> Result<bool, AppError> {
        match self.store.get_challenge(user_id).await? {
            Some(challenge) => self.consume(challenge, code).await,
            None => {
                warn!("チャレンジが存在しません: user_id={}", user_id);
                Ok(false)
            }
        }
    }

    /// ログインチケットとコードを検証し、成功したらユーザーIDを返す
    pub async fn verify_ticket(&self, ticket: &str, code: &str) -> Result<Option<UserId>, AppError> {
        let Some(challenge) = self.store.find_challenge_by_ticket(ticket).await? else {
            warn!("不明なログインチケット");
            return Ok(None);
        };
        let user_id = challenge.user_id.clone();
        Ok(self.consume(challenge, code).await?.then_some(user_id))
    }

    async fn consume(&self, mut challenge: TwoFactorChallenge, code: &str) -> Result<bool, AppError> {
        let expected_code = challenge.code.clone();
        if !challenge.verify(code, self.clock.now()) {
            warn!("コード検証に失敗: user_id={}", challenge.user_id);
            return Ok(false);
        }

        let user_id = challenge.user_id.clone();
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::PutChallenge {
            challenge,
            expected_code: Some(expected_code),
        });
        match self.store.commit(batch).await {
            Ok(()) => {
                info!("コード検証に成功: user_id={}", user_id);
                Ok(true)
            }
            // 同じコードが並行して使われた
            Err(AppError::ConcurrentModification) => {
                warn!("コードは既に使用済み: user_id={}", user_id);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// パスワードを確認してコードをメールで送り、ログインチケットを返す
    ///
    /// メール送信の失敗はログに残すだけでログイン処理は続ける。
    pub async fn begin_login(&self, username: &str, password: &str) -> Result<LoginTicket, AppError> {
        let invalid = || AppError::Authentication("invalid username or password".to_string());

        let user = self
            .identity
            .get_user_by_username(username)
            .await?
            .ok_or_else(invalid)?;
        if !self.identity.verify_password(&user, password).await? {
            return Err(invalid());
        }

        let issued = self.issue_challenge(&user.id).await?;
        match &user.email {
            Some(email) => {
                let body = format!(
                    "認証コード: {}\n\nこのコードの有効期限は{}分です。",
                    issued.code, CHALLENGE_VALIDITY_MINUTES
                );
                if let Err(e) = self.mailer.send(email, "認証コードのお知らせ", &body).await {
                    error!("認証コードのメール送信に失敗: user_id={}, error={}", user.id, e);
                }
            }
            None => warn!("メールアドレスが未登録のため認証コードを送信できません: user_id={}", user.id),
        }

        Ok(LoginTicket {
            user_id: user.id,
            ticket: issued.ticket,
        })
    }
}
