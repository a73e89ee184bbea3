//! 单元测试共用的内存实现

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Notify, Semaphore, mpsc};

use crate::{
    error::{AppError, AppResult},
    models::{
        ChangeNotification, FieldDefinition, InstanceRecord, InstanceRef, RawTag, TagMap,
    },
    services::{
        directory_client::{InventoryDirectory, Subscription, TagResolver},
        ingest_client::{IngestClient, UploadMode},
    },
};

pub fn tag_map() -> TagMap {
    TagMap::from_definitions(vec![
        FieldDefinition {
            id: 1,
            name: "env".to_string(),
        },
        FieldDefinition {
            id: 2,
            name: "tier".to_string(),
        },
    ])
}

pub fn instance(reference: &str, name: &str, address: &str, tags: &[(i32, &str)]) -> InstanceRecord {
    InstanceRecord::new(
        InstanceRef::new(reference),
        name,
        address,
        tags.iter().map(|(k, v)| RawTag::new(*k, *v)).collect(),
    )
}

type BatchSender = mpsc::Sender<AppResult<Vec<ChangeNotification>>>;

/// 内存目录服务
#[derive(Default)]
pub struct MockDirectory {
    order: Mutex<Vec<InstanceRef>>,
    instances: Mutex<HashMap<InstanceRef, InstanceRecord>>,
    failing: Mutex<HashSet<String>>,
    unreachable: Mutex<HashMap<String, usize>>,
    lookup_delay: Mutex<Option<Duration>>,
    senders: Mutex<Vec<BatchSender>>,
    subscribed: Notify,
}

impl MockDirectory {
    pub fn new(records: Vec<InstanceRecord>) -> Self {
        let directory = Self::default();
        for record in records {
            directory.set_instance(record);
        }
        directory
    }

    pub fn set_instance(&self, record: InstanceRecord) {
        let mut order = self.order.lock().unwrap();
        if !order.contains(&record.reference) {
            order.push(record.reference.clone());
        }
        self.instances
            .lock()
            .unwrap()
            .insert(record.reference.clone(), record);
    }

    pub fn fail_instance(&self, reference: &str) {
        self.failing.lock().unwrap().insert(reference.to_string());
    }

    /// 接下来 `times` 次查询该实例时返回连接错误
    pub fn fail_connectivity(&self, reference: &str, times: usize) {
        self.unreachable
            .lock()
            .unwrap()
            .insert(reference.to_string(), times);
    }

    /// 每次查询实例前等待 `delay`
    pub fn slow_lookups(&self, delay: Duration) {
        *self.lookup_delay.lock().unwrap() = Some(delay);
    }

    pub fn subscribe_count(&self) -> usize {
        self.senders.lock().unwrap().len()
    }

    /// 等待至少 `count` 次订阅
    pub async fn wait_subscribed(&self, count: usize) {
        loop {
            let notified = self.subscribed.notified();
            if self.subscribe_count() >= count {
                return;
            }
            notified.await;
        }
    }

    fn current_sender(&self) -> BatchSender {
        self.senders
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("尚未订阅")
    }

    /// 向最近一次订阅投递一批事件
    pub async fn emit(&self, batch: Vec<ChangeNotification>) {
        let tx = self.current_sender();
        tx.send(Ok(batch)).await.expect("订阅已关闭");
    }

    /// 让最近一次订阅以错误结束
    pub async fn fail_subscription(&self, message: &str) {
        let tx = self.current_sender();
        let _ = tx.send(Err(AppError::subscription(message))).await;
    }
}

#[async_trait::async_trait]
impl InventoryDirectory for MockDirectory {
    async fn list_instances(&self, _scope: &str) -> AppResult<Vec<InstanceRef>> {
        Ok(self.order.lock().unwrap().clone())
    }

    async fn get_instance(&self, reference: &InstanceRef) -> AppResult<InstanceRecord> {
        let delay = *self.lookup_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(remaining) = self.unreachable.lock().unwrap().get_mut(reference.as_str()) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AppError::connectivity("connection refused"));
            }
        }
        if self.failing.lock().unwrap().contains(reference.as_str()) {
            return Err(AppError::directory(format!("实例数据异常: {}", reference)));
        }
        self.instances
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| AppError::directory(format!("实例不存在: {}", reference)))
    }

    async fn subscribe(&self, _scope: &str) -> AppResult<Subscription> {
        let (tx, subscription) = Subscription::channel(8);
        self.senders.lock().unwrap().push(tx);
        self.subscribed.notify_waiters();
        Ok(subscription)
    }
}

#[async_trait::async_trait]
impl TagResolver for MockDirectory {
    async fn list_field_definitions(&self) -> AppResult<Vec<FieldDefinition>> {
        Ok(vec![FieldDefinition {
            id: 1,
            name: "env".to_string(),
        }])
    }
}

/// 一次上传尝试
#[derive(Debug, Clone)]
pub struct UploadAttempt {
    pub payload: String,
    pub mode: UploadMode,
    pub succeeded: bool,
}

/// 记录所有上传尝试的内存上报客户端
#[derive(Default)]
pub struct MockIngest {
    attempts: Mutex<Vec<UploadAttempt>>,
    fail_remaining: AtomicUsize,
    gate: Mutex<Option<Arc<Semaphore>>>,
    started: Notify,
}

impl MockIngest {
    pub fn new() -> Self {
        Self::default()
    }

    /// 接下来的 `n` 次上传返回失败
    pub fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// 上传在记录请求体后阻塞，直到信号量放行
    pub fn hold_uploads(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// 等待至少 `count` 次上传尝试开始
    pub async fn wait_attempts(&self, count: usize) {
        loop {
            let notified = self.started.notified();
            if self.attempts() >= count {
                return;
            }
            notified.await;
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn all_attempts(&self) -> Vec<UploadAttempt> {
        self.attempts.lock().unwrap().clone()
    }

    /// 成功的上传：(请求体, 语义)
    pub fn uploads(&self) -> Vec<(String, UploadMode)> {
        self.all_attempts()
            .into_iter()
            .filter(|a| a.succeeded)
            .map(|a| (a.payload, a.mode))
            .collect()
    }
}

#[async_trait::async_trait]
impl IngestClient for MockIngest {
    async fn upload(&self, payload: Bytes, mode: UploadMode) -> AppResult<String> {
        let fail = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        self.attempts.lock().unwrap().push(UploadAttempt {
            payload: String::from_utf8_lossy(&payload).into_owned(),
            mode,
            succeeded: !fail,
        });
        self.started.notify_waiters();

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate closed").forget();
        }

        if fail {
            Err(AppError::upload_status(
                503,
                "HTTP 503, body_preview=unavailable",
            ))
        } else {
            Ok("OK".to_string())
        }
    }
}
