use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::error::AppResult;

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 是否启用重试
    pub enabled: bool,
    /// 最大尝试次数（含首次）
    pub max_attempts: u32,
    /// 初始退避时间（秒）
    pub initial_backoff_secs: u64,
    /// 最大退避时间（秒）
    pub max_backoff_secs: u64,
    /// 退避倍率
    pub backoff_multiplier: f64,
    /// 添加随机抖动
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_backoff_secs: 2,
            max_backoff_secs: 30,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// 上报平台（Tetration OpenAPI）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
    /// OpenAPI路径前缀
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    /// 单次请求超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_api_prefix() -> String {
    "/openapi/v1".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            url: "https://tetration.local".to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            api_prefix: default_api_prefix(),
            timeout_secs: default_timeout_secs(),
            retry: RetryConfig::default(),
        }
    }
}

impl IngestConfig {
    pub fn validate(&self) -> Result<(), String> {
        super::validate_url("ingest url", &self.url)?;

        if !self.api_prefix.starts_with('/') {
            return Err("api_prefix 必须以 / 开头".to_string());
        }

        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts 必须大于0".to_string());
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// 上传重试执行器
///
/// 只对 [`crate::error::AppError::is_retryable`] 为真的错误退避重试，其余错误直接返回
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub async fn execute_with_retry<F, Fut, T>(&self, operation: F, label: &str) -> AppResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let max_attempts = if self.config.enabled {
            self.config.max_attempts.max(1)
        } else {
            1
        };

        let mut attempt = 1;
        loop {
            let error = match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        info!(label, attempt, "重试后成功");
                    }
                    return Ok(result);
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                error!(label, attempt, error = %error, "不可重试的错误");
                return Err(error);
            }
            if attempt >= max_attempts {
                error!(label, attempts = max_attempts, error = %error, "重试次数耗尽");
                return Err(error);
            }

            let delay = self.backoff(attempt);
            warn!(
                label,
                attempt,
                delay_secs = delay.as_secs(),
                error = %error,
                "操作失败，稍后重试"
            );
            sleep(delay).await;
            attempt += 1;
        }
    }

    /// 第 `attempt` 次失败后的等待时间：指数增长，封顶后再加抖动
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = self.config.initial_backoff_secs as f64
            * self.config.backoff_multiplier.powi(exponent);
        let capped = base.min(self.config.max_backoff_secs as f64).max(0.0);
        let jitter = if self.config.jitter {
            // 最多 10%
            rand::random::<f64>() * (capped * 0.1).max(1.0)
        } else {
            0.0
        };
        Duration::from_secs_f64(capped + jitter)
    }
}
