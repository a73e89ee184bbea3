/*
 * Inventory Sync - Virtualization Inventory Export
 * Copyright (c) 2024 SampleFarm Project
 *
 * This work is licensed under CC BY-NC-SA 4.0
 * https://creativecommons.org/licenses/by-nc-sa/4.0/
 */

use clap::Parser;
use inventory_sync::{
    config::Config,
    error::{AppError, AppResult},
    services::{
        BatchExporter, ChangeEventConsumer, HttpDirectory, SnapshotExporter, TetrationClient,
        load_tag_map, row_channel,
    },
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// 将虚拟化平台的实例清单同步到上报平台
#[derive(Debug, Parser)]
#[command(name = "inventory-sync", version)]
struct Cli {
    /// 配置文件路径
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// 订阅虚拟机事件（重命名与标签编辑），持续增量同步
    #[arg(long, env = "INVENTORY_SYNC_SUBSCRIBE")]
    subscribe: bool,
}

/// 加载配置；文件不存在时写出默认配置
fn load_config(path: &Path) -> AppResult<Config> {
    if !path.exists() {
        tracing::warn!("未找到配置文件 {}，使用默认配置", path.display());
        let default_config = Config::default();
        if let Err(e) = default_config.save_to_file(path) {
            tracing::warn!("保存默认配置失败: {}", e);
        }
        return Ok(default_config);
    }

    let config = Config::from_file(path)?;
    tracing::info!("已加载配置文件: {}", path.display());
    Ok(config)
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let cli = Cli::parse();

    // 初始化日志
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inventory_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&cli.config)?;
    config.log_summary();

    let scope = config.directory.scope.clone();
    let segment = config.export.segment.clone();

    let directory = Arc::new(HttpDirectory::new(
        config.directory.clone(),
        config.insecure,
    )?);
    let ingest = Arc::new(TetrationClient::new(&config.ingest, config.insecure)?);

    // 字段映射在两条导出路径启动前构建，之后只读
    let tag_map = Arc::new(load_tag_map(directory.as_ref()).await?);

    let snapshot = SnapshotExporter::new(
        directory.clone(),
        ingest.clone(),
        tag_map.clone(),
        segment.clone(),
    );
    let report = snapshot.run(&scope).await?;
    tracing::info!(
        instances = report.instances_found,
        rows = report.rows_exported,
        status = %report.upload_status,
        "全量导出完成"
    );

    if !cli.subscribe {
        return Ok(());
    }

    tracing::info!("开始订阅虚拟机事件");

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("收到中断信号，正在停止");
        }
        ctrl_c_cancel.cancel();
    });

    // 导出器使用独立的停止信号，等消费者退出后再停止，避免丢失在途的行
    let exporter_cancel = CancellationToken::new();
    let (sink, rx) = row_channel(config.export.queue_capacity);
    let exporter = BatchExporter::new(ingest.clone(), config.export.flush_interval());
    let exporter_handle = tokio::spawn(exporter.run(rx, exporter_cancel.clone()));

    let mut consumer = ChangeEventConsumer::new(directory.clone(), tag_map.clone(), segment)
        .with_lookup_retry(config.export.lookup_retry());
    if config.export.resubscribe {
        consumer = consumer.with_resubscribe(config.export.resubscribe_backoff());
    }
    let consumed = consumer.start(&scope, sink, cancel.clone()).await;

    exporter_cancel.cancel();
    let exported = exporter_handle
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

    match consumed {
        Ok(stats) => {
            tracing::info!(
                rows = stats.rows_published,
                flushes = exported.flushes,
                "增量同步已停止"
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "事件订阅失败，增量同步终止");
            Err(e)
        }
    }
}
