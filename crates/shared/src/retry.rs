use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::errors::{AppError, RetryStrategy};

/// リトライ実行結果
#[derive(Debug)]
pub enum RetryResult<T> {
    Success(T),
    /// 最大試行回数に達して失敗
    MaxAttemptsReached(AppError),
    /// リトライ不可能なエラーで失敗
    NonRetryable(AppError),
}

impl<T> RetryResult<T> {
    /// 通常の `Result` に戻す
    pub fn into_result(self) -> Result<T, AppError> {
        match self {
            RetryResult::Success(value) => Ok(value),
            RetryResult::MaxAttemptsReached(err) | RetryResult::NonRetryable(err) => Err(err),
        }
    }
}

/// リトライ実行器
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    strategy: RetryStrategy,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryStrategy::default())
    }
}

impl RetryExecutor {
    pub fn new(strategy: RetryStrategy) -> Self {
        Self { strategy }
    }

    /// 操作をリトライ付きで実行
    ///
    /// 失敗時はエラーメタデータの `retryable` で続行を判定する。
    pub async fn execute<F, Fut, T>(&self, operation: F) -> RetryResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut attempt = 1;

        loop {
            debug!(attempt, max_attempts = self.strategy.max_attempts, "Executing operation");

            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return RetryResult::Success(result);
                }
                Err(error) => {
                    if !error.metadata().retryable {
                        return RetryResult::NonRetryable(error);
                    }

                    if attempt >= self.strategy.max_attempts {
                        error!(
                            max_attempts = self.strategy.max_attempts,
                            error = %error,
                            "Max attempts reached, giving up"
                        );
                        return RetryResult::MaxAttemptsReached(error);
                    }

                    let delay = self.calculate_delay(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.strategy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Operation failed, retrying"
                    );

                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// 遅延時間を計算
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay = if self.strategy.backoff_multiplier == 1.0 {
            self.strategy.initial_delay
        } else {
            let multiplier = self.strategy.backoff_multiplier.powi((attempt - 1) as i32);
            Duration::from_millis(
                (self.strategy.initial_delay.as_millis() as f64 * multiplier) as u64,
            )
        };

        let delay = std::cmp::min(base_delay, self.strategy.max_delay);

        if self.strategy.add_jitter {
            // ±25%のランダム変動
            let jitter_factor = rand::thread_rng().gen_range(0.75..=1.25);
            Duration::from_millis((delay.as_millis() as f64 * jitter_factor) as u64)
        } else {
            delay
        }
    }
}

/// 楽観的ロック専用のリトライ実行器
///
/// バージョン競合 (`ConcurrentModification`) が出たら読み直しからやり直す。
#[derive(Debug, Clone)]
pub struct OptimisticLockRetryExecutor {
    inner: RetryExecutor,
}

impl Default for OptimisticLockRetryExecutor {
    fn default() -> Self {
        Self::new(10, Duration::from_millis(50))
    }
}

impl OptimisticLockRetryExecutor {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            inner: RetryExecutor::new(RetryStrategy {
                max_attempts: max_attempts.max(1),
                initial_delay,
                max_delay: Duration::from_secs(5),
                backoff_multiplier: 1.5,
                add_jitter: true,
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.retry_max_attempts, config.retry_initial_delay)
    }

    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, AppError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        self.inner.execute(operation).await.into_result()
    }
}
