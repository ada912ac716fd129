use crate::errors::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub dynamodb_table: String,
    pub environment: String,
    pub aws_region: String,
    /// DynamoDB Local などのエンドポイント上書き
    pub dynamodb_endpoint: Option<String>,
    /// 楽観的ロック競合時の最大試行回数
    pub retry_max_attempts: u32,
    pub retry_initial_delay: Duration,
    /// 二段階認証メールの送信元
    pub mail_from: String,
    pub cognito_user_pool_id: Option<String>,
    pub cognito_client_id: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// 任意の取得関数から設定を組み立てる
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        Ok(Config {
            dynamodb_table: non_empty("DYNAMODB_TABLE")
                .unwrap_or_else(|| "task-board-dev".to_string()),
            environment: non_empty("ENVIRONMENT").unwrap_or_else(|| "dev".to_string()),
            aws_region: non_empty("AWS_REGION").unwrap_or_else(|| "ap-northeast-1".to_string()),
            dynamodb_endpoint: non_empty("DYNAMODB_ENDPOINT"),
            retry_max_attempts: parse_number("RETRY_MAX_ATTEMPTS", non_empty("RETRY_MAX_ATTEMPTS"), 10)?,
            retry_initial_delay: Duration::from_millis(parse_number(
                "RETRY_INITIAL_DELAY_MS",
                non_empty("RETRY_INITIAL_DELAY_MS"),
                50,
            )?),
            mail_from: non_empty("MAIL_FROM").unwrap_or_else(|| "no-reply@example.com".to_string()),
            cognito_user_pool_id: non_empty("COGNITO_USER_POOL_ID"),
            cognito_client_id: non_empty("COGNITO_CLIENT_ID"),
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == "prod"
    }
}

fn parse_number<T: std::str::FromStr>(
    key: &str,
    value: Option<String>,
    default: T,
) -> Result<T, AppError> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Configuration(format!("{key} must be a number: {raw}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, AppError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.dynamodb_table, "task-board-dev");
        assert_eq!(config.environment, "dev");
        assert_eq!(config.retry_max_attempts, 10);
        assert_eq!(config.retry_initial_delay, Duration::from_millis(50));
        assert!(config.dynamodb_endpoint.is_none());
        assert!(!config.is_production());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("DYNAMODB_TABLE", "task-board-prod"),
            ("ENVIRONMENT", "prod"),
            ("DYNAMODB_ENDPOINT", "http://localhost:8000"),
            ("RETRY_MAX_ATTEMPTS", "4"),
            ("RETRY_INITIAL_DELAY_MS", "5"),
        ])
        .unwrap();
        assert_eq!(config.dynamodb_table, "task-board-prod");
        assert!(config.is_production());
        assert_eq!(config.dynamodb_endpoint.as_deref(), Some("http://localhost:8000"));
        assert_eq!(config.retry_max_attempts, 4);
        assert_eq!(config.retry_initial_delay, Duration::from_millis(5));
    }

    #[test]
    fn test_invalid_number_is_configuration_error() {
        let result = config_from(&[("RETRY_MAX_ATTEMPTS", "many")]);
        assert!(matches!(result, Err(AppError::Configuration(_))));
    }
}
