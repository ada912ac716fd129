use crate::errors::AppError;
use async_trait::async_trait;
use aws_sdk_cloudwatch::types::{Dimension, MetricDatum, StandardUnit};
use aws_sdk_cloudwatch::Client as CloudWatchClient;
use aws_smithy_types::DateTime as AwsDateTime;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{error, info, instrument};

/// メトリクスの送信先
///
/// 送信失敗は呼び出し元に伝えない（業務処理を止めない）。
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record(&self, metrics: Vec<CustomMetric>);
}

/// CloudWatch カスタムメトリクス送信クライアント
#[derive(Clone)]
pub struct MetricsClient {
    client: CloudWatchClient,
    namespace: String,
    default_dimensions: Vec<Dimension>,
}

impl MetricsClient {
    pub fn new(client: CloudWatchClient, namespace: String, environment: String) -> Self {
        let default_dimensions = vec![Dimension::builder()
            .name("Environment")
            .value(environment)
            .build()];

        Self {
            client,
            namespace,
            default_dimensions,
        }
    }

    /// バッチでメトリクスを送信（最大20個ずつ）
    #[instrument(skip(self, metrics), fields(count = metrics.len()))]
    pub async fn put_metrics_batch(&self, metrics: Vec<CustomMetric>) -> Result<(), AppError> {
        // CloudWatch API の上限
        const BATCH_SIZE: usize = 20;

        for chunk in metrics.chunks(BATCH_SIZE) {
            let metric_data: Vec<MetricDatum> = chunk
                .iter()
                .map(|metric| {
                    let mut dimensions = self.default_dimensions.clone();
                    for (key, value) in &metric.dimensions {
                        dimensions.push(Dimension::builder().name(key).value(value).build());
                    }

                    MetricDatum::builder()
                        .metric_name(&metric.name)
                        .value(metric.value)
                        .unit(metric.unit.clone())
                        .timestamp(AwsDateTime::from_secs(metric.timestamp.timestamp()))
                        .set_dimensions(Some(dimensions))
                        .build()
                })
                .collect();

            self.client
                .put_metric_data()
                .namespace(&self.namespace)
                .set_metric_data(Some(metric_data))
                .send()
                .await
                .map_err(|e| AppError::ExternalService(format!("CloudWatch: {e}")))?;

            info!(batch_size = chunk.len(), "Metrics batch sent successfully");
        }

        Ok(())
    }
}

#[async_trait]
impl MetricsSink for MetricsClient {
    async fn record(&self, metrics: Vec<CustomMetric>) {
        if metrics.is_empty() {
            return;
        }
        if let Err(e) = self.put_metrics_batch(metrics).await {
            error!(error = %e, "Failed to send metrics batch");
        }
    }
}

/// メトリクスを捨てる送信先（ローカル実行用）
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

#[async_trait]
impl MetricsSink for NoopMetrics {
    async fn record(&self, _metrics: Vec<CustomMetric>) {}
}

/// 記録したメトリクスを保持する送信先（テスト用）
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    recorded: Mutex<Vec<CustomMetric>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定した Operation ディメンションの件数
    pub fn count_operation(&self, operation: &str) -> usize {
        self.recorded
            .lock()
            .map(|recorded| {
                recorded
                    .iter()
                    .filter(|m| m.dimensions.get("Operation").map(String::as_str) == Some(operation))
                    .count()
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl MetricsSink for RecordingMetrics {
    async fn record(&self, metrics: Vec<CustomMetric>) {
        if let Ok(mut recorded) = self.recorded.lock() {
            recorded.extend(metrics);
        }
    }
}

/// カスタムメトリクス定義
#[derive(Debug, Clone)]
pub struct CustomMetric {
    pub name: String,
    pub value: f64,
    pub unit: StandardUnit,
    pub dimensions: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl CustomMetric {
    pub fn new(
        name: &str,
        value: f64,
        unit: StandardUnit,
        dimensions: HashMap<String, String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            value,
            unit,
            dimensions,
            timestamp: Utc::now(),
        }
    }

    /// カウンターメトリクスを作成
    pub fn count(name: &str, value: f64, dimensions: HashMap<String, String>) -> Self {
        Self::new(name, value, StandardUnit::Count, dimensions)
    }

    /// 時間メトリクス（ミリ秒）を作成
    pub fn duration_ms(name: &str, duration_ms: f64, dimensions: HashMap<String, String>) -> Self {
        Self::new(name, duration_ms, StandardUnit::Milliseconds, dimensions)
    }
}

fn operation_dimensions(operation: &str) -> HashMap<String, String> {
    HashMap::from([("Operation".to_string(), operation.to_string())])
}

/// ビジネスメトリクス
pub struct BusinessMetrics;

impl BusinessMetrics {
    pub fn task_created(recurrence: &str) -> CustomMetric {
        let mut dimensions = operation_dimensions("CreateTask");
        dimensions.insert("Recurrence".to_string(), recurrence.to_string());
        CustomMetric::count("TaskOperations", 1.0, dimensions)
    }

    pub fn task_completed(member_count: usize) -> CustomMetric {
        let mut dimensions = operation_dimensions("CompleteTask");
        dimensions.insert(
            "Collaborative".to_string(),
            (member_count > 1).to_string(),
        );
        CustomMetric::count("TaskOperations", 1.0, dimensions)
    }

    /// 繰り返しタスクの後続生成
    pub fn recurrence_spawned(recurrence: &str) -> CustomMetric {
        let mut dimensions = operation_dimensions("SpawnRecurrence");
        dimensions.insert("Recurrence".to_string(), recurrence.to_string());
        CustomMetric::count("TaskOperations", 1.0, dimensions)
    }

    pub fn invitation_sent() -> CustomMetric {
        CustomMetric::count("InvitationOperations", 1.0, operation_dimensions("SendInvitation"))
    }

    pub fn invitation_responded(accepted: bool) -> CustomMetric {
        let mut dimensions = operation_dimensions("RespondInvitation");
        dimensions.insert("Accepted".to_string(), accepted.to_string());
        CustomMetric::count("InvitationOperations", 1.0, dimensions)
    }

    /// 楽観的ロック競合
    pub fn optimistic_lock_conflict(operation: &str) -> CustomMetric {
        CustomMetric::count("OptimisticLockConflicts", 1.0, operation_dimensions(operation))
    }

    /// API レスポンス時間
    pub fn api_response_time(operation: &str, status_code: u16, duration_ms: f64) -> CustomMetric {
        let mut dimensions = operation_dimensions(operation);
        dimensions.insert("StatusCode".to_string(), status_code.to_string());
        CustomMetric::duration_ms("ApiResponseTime", duration_ms, dimensions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_business_metric_dimensions() {
        let metric = BusinessMetrics::invitation_responded(true);
        assert_eq!(metric.name, "InvitationOperations");
        assert_eq!(metric.unit, StandardUnit::Count);
        assert_eq!(
            metric.dimensions.get("Operation").map(String::as_str),
            Some("RespondInvitation")
        );
        assert_eq!(metric.dimensions.get("Accepted").map(String::as_str), Some("true"));
    }

    #[tokio::test]
    async fn test_recording_metrics_counts_operations() {
        let sink = RecordingMetrics::new();
        sink.record(vec![
            BusinessMetrics::task_created("daily"),
            BusinessMetrics::recurrence_spawned("daily"),
            BusinessMetrics::task_created("none"),
        ])
        .await;

        assert_eq!(sink.count_operation("CreateTask"), 2);
        assert_eq!(sink.count_operation("SpawnRecurrence"), 1);
        assert_eq!(sink.count_operation("SendInvitation"), 0);
    }
}
