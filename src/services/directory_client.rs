use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    config::DirectoryConfig,
    error::{AppError, AppResult},
    models::{ChangeNotification, FieldDefinition, InstanceRecord, InstanceRef, RawTag},
};

/// 订阅通道缓冲的事件批次数
const SUBSCRIPTION_BUFFER: usize = 16;

/// 两次空结果长轮询之间的最短间隔
const MIN_EMPTY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// 长轮询请求在服务端等待时间之外额外留出的超时余量
const POLL_TIMEOUT_MARGIN: Duration = Duration::from_secs(30);

/// 目录服务抽象接口
#[async_trait::async_trait]
pub trait InventoryDirectory: Send + Sync {
    /// 列出范围内的所有实例
    async fn list_instances(&self, scope: &str) -> AppResult<Vec<InstanceRef>>;

    /// 获取单个实例的名称、地址与标签
    async fn get_instance(&self, reference: &InstanceRef) -> AppResult<InstanceRecord>;

    /// 批量获取实例，任一失败则整体失败
    async fn get_instances(&self, references: &[InstanceRef]) -> AppResult<Vec<InstanceRecord>> {
        let mut records = Vec::with_capacity(references.len());
        for reference in references {
            records.push(self.get_instance(reference).await?);
        }
        Ok(records)
    }

    /// 订阅范围内的变更事件
    async fn subscribe(&self, scope: &str) -> AppResult<Subscription>;
}

/// 自定义字段元数据接口
#[async_trait::async_trait]
pub trait TagResolver: Send + Sync {
    async fn list_field_definitions(&self) -> AppResult<Vec<FieldDefinition>>;
}

/// 事件订阅：按投递顺序产出事件批次
///
/// 返回 `None` 表示订阅流已关闭
pub struct Subscription {
    rx: mpsc::Receiver<AppResult<Vec<ChangeNotification>>>,
}

impl Subscription {
    pub fn channel(capacity: usize) -> (mpsc::Sender<AppResult<Vec<ChangeNotification>>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }

    pub async fn next_batch(&mut self) -> Option<AppResult<Vec<ChangeNotification>>> {
        self.rx.recv().await
    }
}

#[derive(Debug, Deserialize)]
struct InstanceSummary {
    #[serde(rename = "ref")]
    reference: InstanceRef,
}

#[derive(Debug, Deserialize)]
struct InstanceBody {
    name: String,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    tags: Vec<RawTag>,
}

#[derive(Debug, Deserialize)]
struct EventPage {
    cursor: u64,
    #[serde(default)]
    events: Vec<ChangeNotification>,
}

/// 基于HTTP JSON网关的目录服务客户端
#[derive(Debug, Clone)]
pub struct HttpDirectory {
    http: Client,
    config: DirectoryConfig,
    /// 事件续传游标，重新订阅时从这里继续
    cursor: Arc<AtomicU64>,
}

impl HttpDirectory {
    pub fn new(config: DirectoryConfig, insecure: bool) -> AppResult<Self> {
        let http = Client::builder()
            .danger_accept_invalid_certs(insecure)
            .build()
            .map_err(|e| AppError::config(format!("创建HTTP客户端失败: {}", e)))?;
        Ok(Self {
            http,
            config,
            cursor: Arc::new(AtomicU64::new(0)),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> AppResult<Url> {
        let mut url = Url::parse(&self.config.url)
            .map_err(|e| AppError::config(format!("目录服务URL无效: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| AppError::config("目录服务URL不能作为基础URL"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// GET 并解析JSON；非2xx与解析失败用 `on_error` 归类
    async fn get_json<T, F>(
        &self,
        url: Url,
        query: &[(&str, String)],
        timeout: Option<Duration>,
        on_error: F,
    ) -> AppResult<T>
    where
        T: DeserializeOwned,
        F: Fn(String) -> AppError,
    {
        let mut request = self
            .http
            .get(url.clone())
            .basic_auth(&self.config.username, Some(&self.config.password))
            .query(query);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| AppError::connectivity(format!("请求 {} 失败: {}", url.path(), e)))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| AppError::connectivity(format!("读取响应失败: {}", e)))?;
        debug!(path = %url.path(), %status, len = text.len(), "目录服务响应");

        if status == StatusCode::NOT_FOUND {
            return Err(on_error(format!("资源不存在: {}", url.path())));
        }
        if !status.is_success() {
            return Err(on_error(format!(
                "status={}, body_preview={}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        serde_json::from_str(&text)
            .map_err(|e| on_error(format!("解析 {} 响应失败: {}", url.path(), e)))
    }

    async fn fetch_events(&self, scope: &str) -> AppResult<Vec<ChangeNotification>> {
        let url = self.endpoint(&["api", "scopes", scope, "events"])?;
        let after = self.cursor.load(Ordering::SeqCst);
        let query = [
            ("after", after.to_string()),
            ("limit", self.config.event_page_size.to_string()),
            ("wait", self.config.poll_wait_secs.to_string()),
        ];
        let timeout = Duration::from_secs(self.config.poll_wait_secs) + POLL_TIMEOUT_MARGIN;

        let page: EventPage = self
            .get_json(url, &query, Some(timeout), AppError::subscription)
            .await
            .map_err(|e| match e {
                AppError::Connectivity(msg) => AppError::subscription(msg),
                other => other,
            })?;

        self.cursor.store(page.cursor, Ordering::SeqCst);
        Ok(page.events)
    }

    /// 长轮询循环，接收端关闭或出错时结束
    async fn poll_events(self, scope: String, tx: mpsc::Sender<AppResult<Vec<ChangeNotification>>>) {
        loop {
            let started = Instant::now();
            let result = tokio::select! {
                _ = tx.closed() => {
                    debug!(%scope, "订阅接收端已关闭，停止长轮询");
                    return;
                }
                result = self.fetch_events(&scope) => result,
            };

            match result {
                Ok(events) if events.is_empty() => {
                    let delay = empty_poll_delay(started.elapsed());
                    if !delay.is_zero() {
                        debug!(%scope, delay_ms = delay.as_millis() as u64, "空轮询过快返回，延迟下一次请求");
                        tokio::select! {
                            _ = tx.closed() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
                Ok(events) => {
                    if tx.send(Ok(events)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(%scope, error = %e, "事件长轮询失败");
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    }
}

/// 空结果的长轮询至少间隔 [`MIN_EMPTY_POLL_INTERVAL`]，网关忽略 `wait` 时避免忙轮询
fn empty_poll_delay(elapsed: Duration) -> Duration {
    MIN_EMPTY_POLL_INTERVAL.saturating_sub(elapsed)
}

#[async_trait::async_trait]
impl InventoryDirectory for HttpDirectory {
    async fn list_instances(&self, scope: &str) -> AppResult<Vec<InstanceRef>> {
        let url = self.endpoint(&["api", "scopes", scope, "instances"])?;
        let summaries: Vec<InstanceSummary> =
            self.get_json(url, &[], None, AppError::directory).await?;
        Ok(summaries.into_iter().map(|s| s.reference).collect())
    }

    async fn get_instance(&self, reference: &InstanceRef) -> AppResult<InstanceRecord> {
        let url = self.endpoint(&["api", "instances", reference.as_str()])?;
        let body: InstanceBody = self.get_json(url, &[], None, AppError::directory).await?;
        Ok(InstanceRecord::new(
            reference.clone(),
            body.name,
            body.address.unwrap_or_default(),
            body.tags,
        ))
    }

    async fn subscribe(&self, scope: &str) -> AppResult<Subscription> {
        let (tx, subscription) = Subscription::channel(SUBSCRIPTION_BUFFER);
        debug!(
            %scope,
            cursor = self.cursor.load(Ordering::SeqCst),
            "开始订阅变更事件"
        );
        tokio::spawn(self.clone().poll_events(scope.to_string(), tx));
        Ok(subscription)
    }
}

#[async_trait::async_trait]
impl TagResolver for HttpDirectory {
    async fn list_field_definitions(&self) -> AppResult<Vec<FieldDefinition>> {
        let url = self.endpoint(&["api", "custom-fields"])?;
        self.get_json(url, &[], None, AppError::directory).await
    }
}
