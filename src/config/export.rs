use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 队列容量上限
const MAX_QUEUE_CAPACITY: usize = 10_000;

/// 导出配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// 网段标签（VRF列），目前固定为单一值
    pub segment: String,
    /// 增量批次刷新间隔（秒）
    pub flush_interval_secs: u64,
    /// 事件消费者与批量导出器之间的队列容量
    pub queue_capacity: usize,
    /// 订阅断开后是否重新订阅
    pub resubscribe: bool,
    /// 重新订阅前的等待时间（秒）
    pub resubscribe_backoff_secs: u64,
    /// 因连接失败暂缓的实例查询的重试间隔（秒）
    pub lookup_retry_secs: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            segment: "Default".to_string(),
            flush_interval_secs: 60,
            queue_capacity: 256,
            resubscribe: false,
            resubscribe_backoff_secs: 5,
            lookup_retry_secs: 5,
        }
    }
}

impl ExportConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.flush_interval_secs == 0 {
            return Err("刷新间隔必须大于0".to_string());
        }
        if self.queue_capacity == 0 || self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(format!("队列容量应在1-{}之间", MAX_QUEUE_CAPACITY));
        }
        if self.resubscribe && self.resubscribe_backoff_secs == 0 {
            return Err("启用重新订阅时等待时间必须大于0".to_string());
        }
        if self.lookup_retry_secs == 0 {
            return Err("实例查询重试间隔必须大于0".to_string());
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn resubscribe_backoff(&self) -> Duration {
        Duration::from_secs(self.resubscribe_backoff_secs)
    }

    pub fn lookup_retry(&self) -> Duration {
        Duration::from_secs(self.lookup_retry_secs)
    }
}
