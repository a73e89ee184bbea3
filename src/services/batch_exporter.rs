use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{AppError, AppResult},
    models::{Batch, RowRecord},
    services::ingest_client::{IngestClient, UploadMode},
};

/// 生产者一侧的投递句柄
///
/// 队列满时 `send` 会等待，行不会被丢弃
#[derive(Debug, Clone)]
pub struct RowSink {
    tx: mpsc::Sender<RowRecord>,
}

impl RowSink {
    pub async fn send(&self, row: RowRecord) -> AppResult<()> {
        self.tx
            .send(row)
            .await
            .map_err(|_| AppError::subscription("批量导出器已停止，无法继续投递"))
    }

    /// 导出器是否已退出
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// 创建事件消费者与批量导出器之间的有界队列
pub fn row_channel(capacity: usize) -> (RowSink, mpsc::Receiver<RowRecord>) {
    let (tx, rx) = mpsc::channel(capacity);
    (RowSink { tx }, rx)
}

/// 导出器退出时的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExporterStats {
    pub flushes: u64,
    pub rows_uploaded: u64,
    pub failed_attempts: u64,
}

/// 增量批量导出器
///
/// 单任务独占批次缓冲：队列中的行在每次定时器触发前被取出，
/// 脏批次以追加语义上传。上传期间不读取队列，新行自然落入下一批。
/// 上传失败时保留整批，下一周期连同新行一起重试。
/// 停止时先关闭队列，已投递的行全部进入最后一批。
pub struct BatchExporter {
    ingest: Arc<dyn IngestClient>,
    flush_interval: Duration,
    batch: Batch,
    consecutive_failures: u32,
    stats: ExporterStats,
}

impl BatchExporter {
    pub fn new(ingest: Arc<dyn IngestClient>, flush_interval: Duration) -> Self {
        Self {
            ingest,
            flush_interval,
            batch: Batch::new(),
            consecutive_failures: 0,
            stats: ExporterStats::default(),
        }
    }

    /// 运行直到取消或所有生产者退出，退出前尽力刷新一次
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<RowRecord>,
        cancel: CancellationToken,
    ) -> ExporterStats {
        info!(
            interval_secs = self.flush_interval.as_secs(),
            "增量批量导出器已启动"
        );

        let mut ticker = interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("批量导出器收到取消信号");
                    break;
                }
                _ = ticker.tick() => {
                    self.drain_pending(&mut rx);
                    if self.batch.is_dirty() {
                        self.flush().await;
                    }
                }
                row = rx.recv() => match row {
                    Some(row) => self.batch.push(row),
                    None => {
                        debug!("所有生产者已退出");
                        break;
                    }
                },
            }
        }

        // 关闭队列后取尽已投递的行；之后的 send 会返回错误而不是静默丢失
        rx.close();
        while let Some(row) = rx.recv().await {
            self.batch.push(row);
        }
        if self.batch.is_dirty() {
            info!(rows = self.batch.len(), "退出前刷新剩余批次");
            self.flush().await;
        }

        info!(
            flushes = self.stats.flushes,
            rows = self.stats.rows_uploaded,
            failed = self.stats.failed_attempts,
            "增量批量导出器已停止"
        );
        self.stats
    }

    /// 非阻塞取出队列中已有的行
    fn drain_pending(&mut self, rx: &mut mpsc::Receiver<RowRecord>) {
        while let Ok(row) = rx.try_recv() {
            self.batch.push(row);
        }
    }

    async fn flush(&mut self) {
        let rows = self.batch.len();
        let payload = self.batch.render();
        info!(rows, "正在导出增量批次");

        match self.ingest.upload(payload, UploadMode::Append).await {
            Ok(status) => {
                info!(rows, status = %status, "增量批次上传完成");
                self.batch.reset();
                self.consecutive_failures = 0;
                self.stats.flushes += 1;
                self.stats.rows_uploaded += rows as u64;
            }
            Err(e) => {
                self.consecutive_failures += 1;
                self.stats.failed_attempts += 1;
                warn!(
                    rows,
                    failures = self.consecutive_failures,
                    error = %e,
                    "增量批次上传失败，保留至下一周期重试"
                );
            }
        }
    }
}
