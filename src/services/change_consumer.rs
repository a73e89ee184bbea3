use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{AppError, AppResult},
    models::{ChangeNotification, InstanceRef, TagMap},
    services::{
        batch_exporter::RowSink,
        directory_client::{InventoryDirectory, Subscription},
        tag_formatter::build_row,
    },
};

/// 连接失败后暂缓查询的默认重试间隔
const DEFAULT_LOOKUP_RETRY: Duration = Duration::from_secs(5);

/// 事件消费统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub batches: u64,
    pub rows_published: u64,
    /// 无地址或实例数据异常而跳过的事件
    pub skipped: u64,
    /// 与导出无关的事件
    pub ignored: u64,
    /// 目录服务连接失败、留待重试的查询次数
    pub deferred: u64,
    pub resubscribes: u64,
}

/// 变更事件消费者：订阅重命名与标签变更事件，取实例当前状态生成导出行
pub struct ChangeEventConsumer {
    directory: Arc<dyn InventoryDirectory>,
    tag_map: Arc<TagMap>,
    segment: String,
    resubscribe_backoff: Option<Duration>,
    lookup_retry: Duration,
}

impl ChangeEventConsumer {
    pub fn new(directory: Arc<dyn InventoryDirectory>, tag_map: Arc<TagMap>, segment: String) -> Self {
        Self {
            directory,
            tag_map,
            segment,
            resubscribe_backoff: None,
            lookup_retry: DEFAULT_LOOKUP_RETRY,
        }
    }

    /// 订阅断开后等待 `backoff` 再重新订阅；未设置时断开即退出
    pub fn with_resubscribe(mut self, backoff: Duration) -> Self {
        self.resubscribe_backoff = Some(backoff);
        self
    }

    /// 连接失败而暂缓的实例查询每隔 `interval` 重试一次
    pub fn with_lookup_retry(mut self, interval: Duration) -> Self {
        self.lookup_retry = interval;
        self
    }

    /// 持续消费直到取消；订阅失败时返回错误
    pub async fn start(
        &self,
        scope: &str,
        sink: RowSink,
        cancel: CancellationToken,
    ) -> AppResult<ConsumerStats> {
        let mut stats = ConsumerStats::default();
        // 跨重新订阅保留
        let mut deferred: Vec<InstanceRef> = Vec::new();

        loop {
            let mut subscription = self.directory.subscribe(scope).await?;
            info!(scope, "已订阅实例变更事件（重命名、标签编辑）");

            let err = match self
                .consume(&mut subscription, &sink, &cancel, &mut deferred, &mut stats)
                .await
            {
                Ok(()) => {
                    if !deferred.is_empty() {
                        warn!(pending = deferred.len(), "停止时仍有待重试的实例查询，已放弃");
                    }
                    info!(
                        batches = stats.batches,
                        rows = stats.rows_published,
                        "事件消费者已停止"
                    );
                    return Ok(stats);
                }
                Err(e) => e,
            };

            let Some(backoff) = self.resubscribe_backoff else {
                return Err(err);
            };
            if sink.is_closed() {
                return Err(err);
            }

            warn!(
                error = %err,
                backoff_secs = backoff.as_secs(),
                "事件订阅中断，稍后重新订阅"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Ok(stats),
                _ = tokio::time::sleep(backoff) => {}
            }
            stats.resubscribes += 1;
        }
    }

    /// 处理订阅投递的事件批次；取消只在批次之间生效
    async fn consume(
        &self,
        subscription: &mut Subscription,
        sink: &RowSink,
        cancel: &CancellationToken,
        deferred: &mut Vec<InstanceRef>,
        stats: &mut ConsumerStats,
    ) -> AppResult<()> {
        let mut retry_tick = interval_at(Instant::now() + self.lookup_retry, self.lookup_retry);
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = retry_tick.tick(), if !deferred.is_empty() => {
                    self.retry_deferred(deferred, sink, stats).await?;
                    continue;
                }
                next = subscription.next_batch() => next,
            };

            let batch = match next {
                Some(Ok(batch)) => batch,
                Some(Err(e)) => return Err(e),
                None => return Err(AppError::subscription("事件订阅流已关闭")),
            };

            stats.batches += 1;
            self.retry_deferred(deferred, sink, stats).await?;
            for notification in batch {
                self.handle_notification(notification, sink, deferred, stats)
                    .await?;
            }
        }
    }

    async fn handle_notification(
        &self,
        notification: ChangeNotification,
        sink: &RowSink,
        deferred: &mut Vec<InstanceRef>,
        stats: &mut ConsumerStats,
    ) -> AppResult<()> {
        if !notification.kind.is_relevant() {
            stats.ignored += 1;
            return Ok(());
        }

        if !self.publish_current(&notification.instance, sink, stats).await? {
            defer(deferred, notification.instance, stats);
        }
        Ok(())
    }

    /// 重试此前因连接失败暂缓的查询
    async fn retry_deferred(
        &self,
        deferred: &mut Vec<InstanceRef>,
        sink: &RowSink,
        stats: &mut ConsumerStats,
    ) -> AppResult<()> {
        if deferred.is_empty() {
            return Ok(());
        }
        debug!(pending = deferred.len(), "重试暂缓的实例查询");
        for reference in std::mem::take(deferred) {
            if !self.publish_current(&reference, sink, stats).await? {
                defer(deferred, reference, stats);
            }
        }
        Ok(())
    }

    /// 取实例当前状态并投递导出行
    ///
    /// 目录服务连接失败时返回 `Ok(false)`，由调用方暂缓重试；
    /// 实例数据异常只跳过这一行。
    async fn publish_current(
        &self,
        reference: &InstanceRef,
        sink: &RowSink,
        stats: &mut ConsumerStats,
    ) -> AppResult<bool> {
        let instance = match self.directory.get_instance(reference).await {
            Ok(instance) => instance,
            Err(e @ AppError::Connectivity(_)) => {
                warn!(instance = %reference, error = %e, "获取实例状态时连接失败，稍后重试");
                return Ok(false);
            }
            Err(e) => {
                warn!(instance = %reference, error = %e, "获取实例状态失败，跳过该事件");
                stats.skipped += 1;
                return Ok(true);
            }
        };

        let Some(row) = build_row(&instance, &self.tag_map, &self.segment) else {
            debug!(instance = %reference, name = %instance.name, "实例没有IP地址，跳过");
            stats.skipped += 1;
            return Ok(true);
        };

        info!(
            name = %row.name,
            address = %row.address,
            tags = %row.tags,
            "发现符合条件的实例事件"
        );
        sink.send(row).await?;
        stats.rows_published += 1;
        Ok(true)
    }
}

/// 同一实例只保留一条待重试记录，重试时读取的是最新状态
fn defer(deferred: &mut Vec<InstanceRef>, reference: InstanceRef, stats: &mut ConsumerStats) {
    stats.deferred += 1;
    if !deferred.contains(&reference) {
        deferred.push(reference);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventKind;
    use crate::services::batch_exporter::{BatchExporter, row_channel};
    use crate::services::test_support::{MockDirectory, MockIngest, instance, tag_map};

    fn notify(kind: EventKind, reference: &str) -> ChangeNotification {
        ChangeNotification::new(kind, InstanceRef::new(reference))
    }

    fn consumer(directory: Arc<MockDirectory>) -> ChangeEventConsumer {
        ChangeEventConsumer::new(directory, Arc::new(tag_map()), "Default".to_string())
    }

    fn spawn_consumer(
        consumer: ChangeEventConsumer,
        sink: RowSink,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<AppResult<ConsumerStats>> {
        tokio::spawn(async move { consumer.start("DC", sink, cancel).await })
    }

    #[tokio::test]
    async fn test_tag_changed_publishes_current_state() {
        let directory = Arc::new(MockDirectory::new(vec![instance(
            "vm-1",
            "A",
            "10.0.0.1",
            &[(2, "web"), (1, "prod")],
        )]));
        let (sink, mut rx) = row_channel(16);
        let cancel = CancellationToken::new();
        let handle = spawn_consumer(consumer(directory.clone()), sink, cancel.clone());

        directory.wait_subscribed(1).await;
        directory
            .emit(vec![notify(EventKind::TagChanged, "vm-1")])
            .await;

        let row = rx.recv().await.unwrap();
        assert_eq!(row.address, "10.0.0.1");
        assert_eq!(row.segment, "Default");
        assert_eq!(row.name, "A");
        assert_eq!(row.tags, "env=prod;tier=web;");

        cancel.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.rows_published, 1);
    }

    #[tokio::test]
    async fn test_filters_irrelevant_and_addressless() {
        let directory = Arc::new(MockDirectory::new(vec![
            instance("vm-1", "A", "10.0.0.1", &[]),
            instance("vm-2", "B", "", &[(1, "prod")]),
        ]));
        let (sink, mut rx) = row_channel(16);
        let cancel = CancellationToken::new();
        let handle = spawn_consumer(consumer(directory.clone()), sink, cancel.clone());

        directory.wait_subscribed(1).await;
        directory
            .emit(vec![
                notify(EventKind::Other, "vm-1"),
                notify(EventKind::Renamed, "vm-2"),
                notify(EventKind::Renamed, "vm-1"),
            ])
            .await;

        let row = rx.recv().await.unwrap();
        assert_eq!(row.name, "A");

        cancel.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.ignored, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.rows_published, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_directory_error_skips_only_that_row() {
        let directory = Arc::new(MockDirectory::new(vec![
            instance("vm-1", "A", "10.0.0.1", &[]),
            instance("vm-9", "broken", "10.0.0.9", &[]),
        ]));
        directory.fail_instance("vm-9");
        let (sink, mut rx) = row_channel(16);
        let cancel = CancellationToken::new();
        let handle = spawn_consumer(consumer(directory.clone()), sink, cancel.clone());

        directory.wait_subscribed(1).await;
        directory
            .emit(vec![
                notify(EventKind::TagChanged, "vm-9"),
                notify(EventKind::TagChanged, "vm-1"),
            ])
            .await;

        assert_eq!(rx.recv().await.unwrap().name, "A");

        cancel.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.skipped, 1);
    }

    #[tokio::test]
    async fn test_subscription_failure_is_fatal_by_default() {
        let directory = Arc::new(MockDirectory::default());
        let (sink, _rx) = row_channel(16);
        let handle = spawn_consumer(
            consumer(directory.clone()),
            sink,
            CancellationToken::new(),
        );

        directory.wait_subscribed(1).await;
        directory.fail_subscription("connection reset").await;

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(AppError::Subscription(_))));
        assert_eq!(directory.subscribe_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_when_enabled() {
        let directory = Arc::new(MockDirectory::new(vec![instance(
            "vm-1", "A", "10.0.0.1", &[],
        )]));
        let (sink, mut rx) = row_channel(16);
        let cancel = CancellationToken::new();
        let consumer = consumer(directory.clone()).with_resubscribe(Duration::from_secs(5));
        let handle = spawn_consumer(consumer, sink, cancel.clone());

        directory.wait_subscribed(1).await;
        directory.fail_subscription("connection reset").await;
        directory.wait_subscribed(2).await;
        directory
            .emit(vec![notify(EventKind::Renamed, "vm-1")])
            .await;

        assert_eq!(rx.recv().await.unwrap().name, "A");

        cancel.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.resubscribes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tag_change_reaches_next_flush() {
        let directory = Arc::new(MockDirectory::new(vec![instance(
            "vm-1",
            "A",
            "10.0.0.1",
            &[(1, "prod"), (2, "web")],
        )]));
        let ingest = Arc::new(MockIngest::new());
        let (sink, rx) = row_channel(16);
        let cancel = CancellationToken::new();

        let exporter = BatchExporter::new(ingest.clone(), Duration::from_secs(60));
        let exporter_handle = tokio::spawn(exporter.run(rx, cancel.clone()));
        let consumer_handle = spawn_consumer(consumer(directory.clone()), sink, cancel.clone());

        directory.wait_subscribed(1).await;
        directory
            .emit(vec![notify(EventKind::TagChanged, "vm-1")])
            .await;
        ingest.wait_attempts(1).await;

        let uploads = ingest.uploads();
        assert_eq!(uploads.len(), 1);
        assert!(
            uploads[0]
                .0
                .contains("10.0.0.1,Default,A,env=prod;tier=web;\n")
        );

        // 下一周期没有新行，不再上传
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(ingest.attempts(), 1);

        cancel.cancel();
        consumer_handle.await.unwrap().unwrap();
        let stats = exporter_handle.await.unwrap();
        assert_eq!(stats.flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connectivity_failure_retries_lookup() {
        let directory = Arc::new(MockDirectory::new(vec![instance(
            "vm-1",
            "A",
            "10.0.0.1",
            &[(1, "prod")],
        )]));
        directory.fail_connectivity("vm-1", 2);
        let (sink, mut rx) = row_channel(16);
        let cancel = CancellationToken::new();
        let consumer = consumer(directory.clone()).with_lookup_retry(Duration::from_secs(5));
        let handle = spawn_consumer(consumer, sink, cancel.clone());

        directory.wait_subscribed(1).await;
        directory
            .emit(vec![notify(EventKind::TagChanged, "vm-1")])
            .await;

        let row = rx.recv().await.unwrap();
        assert_eq!(row.name, "A");
        assert_eq!(row.tags, "env=prod;");

        cancel.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.deferred, 2);
        assert_eq!(stats.skipped, 0);
        assert_eq!(stats.rows_published, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_lookup_retried_before_next_batch() {
        let directory = Arc::new(MockDirectory::new(vec![
            instance("vm-1", "A", "10.0.0.1", &[]),
            instance("vm-2", "B", "10.0.0.2", &[]),
        ]));
        directory.fail_connectivity("vm-1", 1);
        let (sink, mut rx) = row_channel(16);
        let cancel = CancellationToken::new();
        let consumer = consumer(directory.clone()).with_lookup_retry(Duration::from_secs(3600));
        let handle = spawn_consumer(consumer, sink, cancel.clone());

        directory.wait_subscribed(1).await;
        directory
            .emit(vec![notify(EventKind::Renamed, "vm-1")])
            .await;
        directory
            .emit(vec![notify(EventKind::Renamed, "vm-2")])
            .await;

        assert_eq!(rx.recv().await.unwrap().name, "A");
        assert_eq!(rx.recv().await.unwrap().name, "B");

        cancel.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.deferred, 1);
        assert_eq!(stats.rows_published, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rows_in_flight_at_shutdown_are_exported() {
        let directory = Arc::new(MockDirectory::new(vec![
            instance("vm-1", "first", "10.0.0.9", &[]),
            instance("vm-2", "second", "10.0.0.10", &[]),
        ]));
        directory.slow_lookups(Duration::from_secs(1));
        let ingest = Arc::new(MockIngest::new());
        let (sink, rx) = row_channel(16);
        let consumer_cancel = CancellationToken::new();
        let exporter_cancel = CancellationToken::new();

        let exporter = BatchExporter::new(ingest.clone(), Duration::from_secs(60));
        let exporter_handle = tokio::spawn(exporter.run(rx, exporter_cancel.clone()));
        let consumer_handle =
            spawn_consumer(consumer(directory.clone()), sink, consumer_cancel.clone());

        directory.wait_subscribed(1).await;
        directory
            .emit(vec![
                notify(EventKind::Renamed, "vm-1"),
                notify(EventKind::Renamed, "vm-2"),
            ])
            .await;

        // 第二个实例仍在查询中时收到停止信号
        tokio::time::sleep(Duration::from_millis(1500)).await;
        consumer_cancel.cancel();
        let consumed = consumer_handle.await.unwrap().unwrap();
        assert_eq!(consumed.rows_published, 2);

        exporter_cancel.cancel();
        let exported = exporter_handle.await.unwrap();
        assert_eq!(exported.rows_uploaded, 2);

        let payloads: String = ingest.uploads().into_iter().map(|(p, _)| p).collect();
        assert!(payloads.contains("10.0.0.9,Default,first,\n"));
        assert!(payloads.contains("10.0.0.10,Default,second,\n"));
    }
}
