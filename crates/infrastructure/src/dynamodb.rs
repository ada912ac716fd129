use aws_config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::{
    AttributeDefinition, BillingMode, GlobalSecondaryIndex, KeySchemaElement, KeyType,
    Projection, ProjectionType, ScalarAttributeType,
};
use aws_sdk_dynamodb::Client;
use shared::{AppError, Config};
use std::fmt::Debug;
use tracing::{debug, info};

/// ユーザー起点の一覧用インデックス
pub const GSI1_NAME: &str = "GSI1";
/// ID・トークンからの逆引き用インデックス
pub const GSI2_NAME: &str = "GSI2";

#[derive(Clone)]
pub struct DynamoDbClient {
    client: Client,
    table_name: String,
}

impl DynamoDbClient {
    pub async fn new(config: &Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.aws_region.clone()))
            .load()
            .await;

        let mut builder = aws_sdk_dynamodb::config::Builder::from(&aws_config);
        if let Some(endpoint) = &config.dynamodb_endpoint {
            info!("DynamoDB エンドポイントを上書き: {}", endpoint);
            builder = builder.endpoint_url(endpoint);
        }

        Self {
            client: Client::from_conf(builder.build()),
            table_name: config.dynamodb_table.clone(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// SDK エラーをアプリケーションエラーに変換
    ///
    /// 条件付き書き込みの失敗はバージョン競合として扱う。
    pub fn convert_error<E, R>(&self, err: SdkError<E, R>) -> AppError
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
        R: Debug,
    {
        let timed_out = match &err {
            SdkError::TimeoutError(_) => true,
            SdkError::DispatchFailure(failure) => failure.is_timeout(),
            _ => false,
        };
        if timed_out {
            return AppError::Timeout(format!("DynamoDB: {}", DisplayErrorContext(&err)));
        }

        let code = err.code().unwrap_or("Unknown").to_string();
        classify_error(&code, &self.table_name, DisplayErrorContext(&err).to_string())
    }

    /// テーブルがなければ作成する（DynamoDB Local 用）
    pub async fn create_table_if_missing(&self) -> Result<(), AppError> {
        let existing = self
            .client
            .list_tables()
            .send()
            .await
            .map_err(|e| self.convert_error(e))?;
        if existing.table_names().iter().any(|name| name == &self.table_name) {
            debug!("テーブルは作成済み: {}", self.table_name);
            return Ok(());
        }

        info!("テーブルを作成中: {}", self.table_name);
        let attribute = |name: &str| {
            AttributeDefinition::builder()
                .attribute_name(name)
                .attribute_type(ScalarAttributeType::S)
                .build()
                .map_err(build_error)
        };
        let key = |name: &str, key_type: KeyType| {
            KeySchemaElement::builder()
                .attribute_name(name)
                .key_type(key_type)
                .build()
                .map_err(build_error)
        };
        let all = Projection::builder()
            .projection_type(ProjectionType::All)
            .build();

        let gsi1 = GlobalSecondaryIndex::builder()
            .index_name(GSI1_NAME)
            .key_schema(key("GSI1PK", KeyType::Hash)?)
            .key_schema(key("GSI1SK", KeyType::Range)?)
            .projection(all.clone())
            .build()
            .map_err(build_error)?;
        let gsi2 = GlobalSecondaryIndex::builder()
            .index_name(GSI2_NAME)
            .key_schema(key("GSI2PK", KeyType::Hash)?)
            .projection(all)
            .build()
            .map_err(build_error)?;

        self.client
            .create_table()
            .table_name(&self.table_name)
            .billing_mode(BillingMode::PayPerRequest)
            .attribute_definitions(attribute("PK")?)
            .attribute_definitions(attribute("SK")?)
            .attribute_definitions(attribute("GSI1PK")?)
            .attribute_definitions(attribute("GSI1SK")?)
            .attribute_definitions(attribute("GSI2PK")?)
            .key_schema(key("PK", KeyType::Hash)?)
            .key_schema(key("SK", KeyType::Range)?)
            .global_secondary_indexes(gsi1)
            .global_secondary_indexes(gsi2)
            .send()
            .await
            .map_err(|e| self.convert_error(e))?;

        info!("テーブル作成完了: {}", self.table_name);
        Ok(())
    }
}

fn build_error(err: aws_sdk_dynamodb::error::BuildError) -> AppError {
    AppError::Internal(format!("Failed to build DynamoDB request: {err}"))
}

/// エラーコードごとの変換
fn classify_error(code: &str, table_name: &str, detail: String) -> AppError {
    match code {
        "ConditionalCheckFailedException" | "TransactionConflictException" => {
            AppError::ConcurrentModification
        }
        "ResourceNotFoundException" => {
            AppError::Configuration(format!("DynamoDB table not found: {table_name}"))
        }
        "ServiceUnavailable" | "InternalServerError" => {
            AppError::ServiceUnavailable(format!("{code}: {detail}"))
        }
        _ => AppError::DynamoDb(format!("{code}: {detail}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_error() {
        assert!(matches!(
            classify_error("TransactionConflictException", "board", String::new()),
            AppError::ConcurrentModification
        ));
        assert!(matches!(
            classify_error("ResourceNotFoundException", "board", String::new()),
            AppError::Configuration(_)
        ));

        let unavailable = classify_error("ServiceUnavailable", "board", "503".to_string());
        assert!(matches!(unavailable, AppError::ServiceUnavailable(_)));
        assert!(unavailable.metadata().retryable);

        let throttled = classify_error("ThrottlingException", "board", "slow down".to_string());
        assert!(matches!(throttled, AppError::DynamoDb(_)));
        assert!(throttled.metadata().retryable);

        let invalid = classify_error("ValidationException", "board", "bad key".to_string());
        assert!(!invalid.metadata().retryable);
    }
}
