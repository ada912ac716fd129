use async_trait::async_trait;
use aws_sdk_ses::types::{Body, Content, Destination, Message};
use aws_sdk_ses::Client as SesClient;
use shared::AppError;
use std::sync::Mutex;
use tracing::info;

/// メール送信
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), AppError>;
}

/// SES でテキストメールを送る
#[derive(Clone)]
pub struct SesMailer {
    client: SesClient,
    from: String,
}

impl SesMailer {
    pub fn new(client: SesClient, from: String) -> Self {
        Self { client, from }
    }
}

fn utf8(text: &str) -> Result<Content, AppError> {
    Content::builder()
        .data(text)
        .charset("UTF-8")
        .build()
        .map_err(|e| AppError::Internal(format!("Failed to build mail content: {e}")))
}

#[async_trait]
impl Mailer for SesMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), AppError> {
        self.client
            .send_email()
            .source(&self.from)
            .destination(Destination::builder().to_addresses(to).build())
            .message(
                Message::builder()
                    .subject(utf8(subject)?)
                    .body(Body::builder().text(utf8(body)?).build())
                    .build(),
            )
            .send()
            .await
            .map_err(|e| AppError::ExternalService(format!("SES: {e}")))?;

        info!("メール送信完了: to={}", to);
        Ok(())
    }
}

/// 送信済みメール
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// 送信内容を記録するだけのメーラー（テスト用）
#[derive(Debug, Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentMail>>,
    fail: bool,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 常に失敗するメーラー
    pub fn failing() -> Self {
        Self {
            sent: Mutex::default(),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), AppError> {
        if self.fail {
            return Err(AppError::ExternalService("mail transport is down".to_string()));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(SentMail {
                to: to.to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
            });
        }
        Ok(())
    }
}
