use crate::errors::AppError;
use lambda_runtime::Context;
use tracing::{debug, error, info, warn};

/// Lambda 関数のトレーシング情報
#[derive(Debug)]
pub struct LambdaTraceContext {
    pub function_name: String,
    pub function_version: String,
    pub request_id: String,
    pub trace_id: Option<String>,
}

impl LambdaTraceContext {
    /// Lambda Context からトレーシング情報を抽出
    pub fn from_lambda_context(context: &Context) -> Self {
        Self {
            function_name: context.env_config.function_name.clone(),
            function_version: context.env_config.version.clone(),
            request_id: context.request_id.clone(),
            trace_id: std::env::var("_X_AMZN_TRACE_ID").ok(),
        }
    }
}

/// Lambda 関数実行をトレースするマクロ
#[macro_export]
macro_rules! trace_lambda_handler {
    ($handler_name:expr, $event:expr, $context:expr, $handler_fn:expr) => {{
        use $crate::telemetry::{create_lambda_span, LambdaTraceContext};
        use tracing::Instrument;

        let trace_context = LambdaTraceContext::from_lambda_context(&$context);
        let span = create_lambda_span($handler_name, &trace_context);

        async move {
            tracing::info!(
                function_name = %trace_context.function_name,
                request_id = %trace_context.request_id,
                "Lambda function started"
            );

            let result = $handler_fn($event, $context).await;

            match &result {
                Ok(_) => tracing::info!("Lambda function completed successfully"),
                Err(e) => tracing::error!(error = %e, "Lambda function failed"),
            }

            result
        }
        .instrument(span)
        .await
    }};
}

/// Lambda 関数用のスパンを作成
pub fn create_lambda_span(handler_name: &str, trace_context: &LambdaTraceContext) -> tracing::Span {
    tracing::info_span!(
        "lambda_handler",
        handler = handler_name,
        function_name = %trace_context.function_name,
        function_version = %trace_context.function_version,
        request_id = %trace_context.request_id,
        trace_id = %trace_context.trace_id.as_deref().unwrap_or("none")
    )
}

/// ストア操作の所要時間と結果を記録
pub async fn trace_store_operation<T, Fut>(
    table_name: &str,
    operation_name: &str,
    operation: Fut,
) -> Result<T, AppError>
where
    Fut: std::future::Future<Output = Result<T, AppError>>,
{
    let start_time = std::time::Instant::now();
    let result = operation.await;
    let duration_ms = start_time.elapsed().as_millis() as u64;

    match &result {
        Ok(_) => debug!(
            table = table_name,
            operation = operation_name,
            duration_ms,
            "Store operation completed"
        ),
        Err(AppError::ConcurrentModification) => warn!(
            table = table_name,
            operation = operation_name,
            duration_ms,
            "Store operation hit a version conflict"
        ),
        Err(e) => error!(
            table = table_name,
            operation = operation_name,
            duration_ms,
            error = %e,
            "Store operation failed"
        ),
    }

    result
}

/// HTTP レスポンスを記録
pub fn trace_http_response(method: &str, path: &str, status_code: u16, user_id: Option<&str>) {
    if status_code >= 400 {
        warn!(
            method,
            path,
            status_code,
            user_id = user_id.unwrap_or("anonymous"),
            "HTTP request failed"
        );
    } else {
        info!(
            method,
            path,
            status_code,
            user_id = user_id.unwrap_or("anonymous"),
            "HTTP request completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trace_store_operation_passes_result_through() {
        let ok = trace_store_operation("table", "get_task", async { Ok::<_, AppError>(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err = trace_store_operation("table", "commit", async {
            Err::<(), AppError>(AppError::ConcurrentModification)
        })
        .await;
        assert!(matches!(err, Err(AppError::ConcurrentModification)));
    }
}
