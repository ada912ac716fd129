use domain::{DomainError, ErrorKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// アプリケーション全体で使用される包括的なエラー型
#[derive(Debug, Clone, Error)]
pub enum AppError {
    // ドメインエラー
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    // インフラストラクチャエラー
    #[error("DynamoDB error: {0}")]
    DynamoDb(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Concurrent modification detected")]
    ConcurrentModification,

    // 認証エラー（パスワード・二段階認証）
    #[error("Authentication failed: {0}")]
    Authentication(String),

    // リクエストの形式エラー
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // システムエラー
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Timeout occurred: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    // 外部サービスエラー（メール送信・認証基盤）
    #[error("External service error: {0}")]
    ExternalService(String),
}

/// エラーの分類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCategory {
    /// クライアントエラー（4xx相当）
    Client,
    /// サーバーエラー（5xx相当）
    Server,
    /// 一時的なエラー（リトライ可能）
    Transient,
}

/// エラーの重要度
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// リトライ戦略
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    /// 最大試行回数
    pub max_attempts: u32,
    /// 初期遅延時間
    pub initial_delay: Duration,
    /// 最大遅延時間
    pub max_delay: Duration,
    /// バックオフ倍率
    pub backoff_multiplier: f64,
    /// ジッター追加フラグ
    pub add_jitter: bool,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

/// エラーメタデータ
#[derive(Debug, Clone)]
pub struct ErrorMetadata {
    pub code: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub retryable: bool,
    pub retry_strategy: Option<RetryStrategy>,
    /// 追加コンテキスト
    pub context: HashMap<String, String>,
}

impl ErrorMetadata {
    fn new(code: &str, category: ErrorCategory, severity: ErrorSeverity) -> Self {
        Self {
            code: code.to_string(),
            category,
            severity,
            retryable: false,
            retry_strategy: None,
            context: HashMap::new(),
        }
    }

    fn retry_with(mut self, strategy: RetryStrategy) -> Self {
        self.retryable = true;
        self.retry_strategy = Some(strategy);
        self
    }
}

impl AppError {
    /// エラーメタデータを取得
    pub fn metadata(&self) -> ErrorMetadata {
        match self {
            AppError::Domain(err) => {
                let severity = match err.kind() {
                    ErrorKind::NotFound | ErrorKind::Validation => ErrorSeverity::Info,
                    ErrorKind::PermissionDenied | ErrorKind::Conflict => ErrorSeverity::Warning,
                };
                let mut metadata = ErrorMetadata::new(err.code(), ErrorCategory::Client, severity);
                metadata
                    .context
                    .insert("kind".to_string(), kind_label(err.kind()).to_string());
                metadata
            }

            AppError::DynamoDb(msg) => {
                if is_dynamodb_retryable(msg) {
                    ErrorMetadata::new("DYNAMODB_ERROR", ErrorCategory::Transient, ErrorSeverity::Error)
                        .retry_with(RetryStrategy::default())
                } else {
                    ErrorMetadata::new("DYNAMODB_ERROR", ErrorCategory::Server, ErrorSeverity::Error)
                }
            }

            AppError::Serialization(_) | AppError::Deserialization(_) => ErrorMetadata::new(
                "SERIALIZATION_ERROR",
                ErrorCategory::Server,
                ErrorSeverity::Error,
            ),

            AppError::ConcurrentModification => ErrorMetadata::new(
                "CONCURRENT_MODIFICATION",
                ErrorCategory::Transient,
                ErrorSeverity::Warning,
            )
            .retry_with(RetryStrategy {
                max_attempts: 5,
                initial_delay: Duration::from_millis(50),
                max_delay: Duration::from_secs(5),
                backoff_multiplier: 1.5,
                add_jitter: true,
            }),

            AppError::Authentication(_) => ErrorMetadata::new(
                "AUTHENTICATION_ERROR",
                ErrorCategory::Client,
                ErrorSeverity::Warning,
            ),

            AppError::InvalidRequest(_) => ErrorMetadata::new(
                "INVALID_REQUEST",
                ErrorCategory::Client,
                ErrorSeverity::Info,
            ),

            AppError::ServiceUnavailable(_) => ErrorMetadata::new(
                "SERVICE_UNAVAILABLE",
                ErrorCategory::Transient,
                ErrorSeverity::Error,
            )
            .retry_with(RetryStrategy::default()),

            AppError::Timeout(_) => {
                ErrorMetadata::new("TIMEOUT", ErrorCategory::Transient, ErrorSeverity::Error)
                    .retry_with(RetryStrategy::default())
            }

            AppError::Configuration(_) => ErrorMetadata::new(
                "CONFIGURATION_ERROR",
                ErrorCategory::Server,
                ErrorSeverity::Critical,
            ),

            AppError::Internal(_) => ErrorMetadata::new(
                "INTERNAL_ERROR",
                ErrorCategory::Server,
                ErrorSeverity::Critical,
            ),

            AppError::ExternalService(_) => ErrorMetadata::new(
                "EXTERNAL_SERVICE_ERROR",
                ErrorCategory::Server,
                ErrorSeverity::Error,
            ),
        }
    }

    /// HTTPステータスコードを取得
    pub fn http_status_code(&self) -> u16 {
        match self {
            AppError::Domain(err) => match err.kind() {
                ErrorKind::NotFound => 404,
                ErrorKind::PermissionDenied => 403,
                ErrorKind::Conflict => 409,
                ErrorKind::Validation => 400,
            },
            AppError::Authentication(_) => 401,
            AppError::InvalidRequest(_) => 400,
            AppError::ConcurrentModification => 409,
            AppError::ServiceUnavailable(_) => 503,
            AppError::Timeout(_) => 504,
            _ => 500,
        }
    }

    /// ユーザー向けメッセージを取得
    pub fn user_message(&self) -> String {
        match self {
            AppError::Domain(err) => match err {
                DomainError::AlreadyInvited => "このユーザーは既に招待済みです".to_string(),
                DomainError::AlreadyMember => "このユーザーは既にメンバーです".to_string(),
                DomainError::SelfInvite => "自分自身は招待できません".to_string(),
                DomainError::UnknownUser(_) => "ユーザーが見つかりません".to_string(),
                DomainError::OwnerCannotLeave => "オーナーはタスクから抜けられません".to_string(),
                DomainError::InvitationClosed(_) => "この招待には既に回答済みです".to_string(),
                _ => match err.kind() {
                    ErrorKind::NotFound => "リソースが見つかりません".to_string(),
                    ErrorKind::PermissionDenied => {
                        "この操作を実行する権限がありません".to_string()
                    }
                    ErrorKind::Conflict => "現在の状態ではこの操作を実行できません".to_string(),
                    ErrorKind::Validation => "入力データが無効です".to_string(),
                },
            },
            AppError::Authentication(_) => "認証に失敗しました".to_string(),
            AppError::InvalidRequest(_) => "リクエストの形式が正しくありません".to_string(),
            AppError::ConcurrentModification => {
                "他のユーザーによって変更されました。再度お試しください".to_string()
            }
            AppError::ServiceUnavailable(_) => "サービスが一時的に利用できません".to_string(),
            AppError::Timeout(_) => "処理がタイムアウトしました".to_string(),
            _ => "予期しないエラーが発生しました".to_string(),
        }
    }
}

fn kind_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::NotFound => "not_found",
        ErrorKind::PermissionDenied => "permission_denied",
        ErrorKind::Conflict => "conflict",
        ErrorKind::Validation => "validation",
    }
}

/// DynamoDBエラーがリトライ可能かどうかを判定
fn is_dynamodb_retryable(error_message: &str) -> bool {
    let retryable_errors = [
        "ThrottlingException",
        "ProvisionedThroughputExceededException",
        "ServiceUnavailable",
        "InternalServerError",
        "RequestLimitExceeded",
    ];

    retryable_errors
        .iter()
        .any(|&err| error_message.contains(err))
}

/// 標準化されたエラーレスポンス
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    /// ユーザー向けメッセージ
    pub message: String,
    /// 詳細情報（開発環境のみ）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub request_id: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
}

impl ErrorResponse {
    /// AppErrorからErrorResponseを作成
    pub fn from_app_error(error: &AppError, request_id: String, include_details: bool) -> Self {
        let metadata = error.metadata();

        Self {
            code: metadata.code,
            message: error.user_message(),
            details: include_details.then(|| error.to_string()),
            request_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
            context: metadata.context,
        }
    }

    /// JSONレスポンスとして返すためのシリアライズ
    pub fn to_json(&self) -> Result<String, AppError> {
        serde_json::to_string(self).map_err(|e| AppError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_error_metadata_uses_domain_code() {
        let error = AppError::from(DomainError::AlreadyInvited);
        let metadata = error.metadata();

        assert_eq!(metadata.code, "ALREADY_INVITED");
        assert_eq!(metadata.category, ErrorCategory::Client);
        assert_eq!(metadata.context.get("kind").map(String::as_str), Some("conflict"));
        assert!(!metadata.retryable);
    }

    #[test]
    fn test_concurrent_modification_retryable() {
        let metadata = AppError::ConcurrentModification.metadata();

        assert_eq!(metadata.code, "CONCURRENT_MODIFICATION");
        assert_eq!(metadata.category, ErrorCategory::Transient);
        assert!(metadata.retryable);
        assert!(metadata.retry_strategy.is_some());
    }

    #[test]
    fn test_http_status_codes() {
        assert_eq!(
            AppError::from(DomainError::TaskNotFound("t".to_string())).http_status_code(),
            404
        );
        assert_eq!(
            AppError::from(DomainError::NotTaskOwner("t".to_string())).http_status_code(),
            403
        );
        assert_eq!(AppError::from(DomainError::SelfInvite).http_status_code(), 409);
        assert_eq!(
            AppError::from(DomainError::Validation("x".to_string())).http_status_code(),
            400
        );
        assert_eq!(
            AppError::Authentication("bad password".to_string()).http_status_code(),
            401
        );
        assert_eq!(AppError::Internal("test".to_string()).http_status_code(), 500);
    }

    #[test]
    fn test_error_response_creation() {
        let error = AppError::from(DomainError::UnknownUser("ghost".to_string()));
        let response = ErrorResponse::from_app_error(&error, "req-123".to_string(), false);

        assert_eq!(response.code, "UNKNOWN_USER");
        assert_eq!(response.message, "ユーザーが見つかりません");
        assert_eq!(response.request_id, "req-123");
        assert!(response.details.is_none());
    }

    #[test]
    fn test_dynamodb_retryable_detection() {
        assert!(AppError::DynamoDb("ThrottlingException: Rate exceeded".to_string())
            .metadata()
            .retryable);
        assert!(!AppError::DynamoDb("ValidationException: Invalid input".to_string())
            .metadata()
            .retryable);
        assert!(!is_dynamodb_retryable("ConditionalCheckFailedException"));
    }
}
