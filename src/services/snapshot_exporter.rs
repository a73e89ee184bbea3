use std::sync::Arc;

use tracing::info;

use crate::{
    error::AppResult,
    models::{RowRecord, TagMap, render_csv},
    services::{
        directory_client::InventoryDirectory,
        ingest_client::{IngestClient, UploadMode},
        tag_formatter::build_row,
    },
};

/// 全量导出结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotReport {
    pub instances_found: usize,
    pub rows_exported: usize,
    pub upload_status: String,
}

/// 一次性全量导出：拉取范围内全部实例，整体替换上报平台的清单
pub struct SnapshotExporter {
    directory: Arc<dyn InventoryDirectory>,
    ingest: Arc<dyn IngestClient>,
    tag_map: Arc<TagMap>,
    segment: String,
}

impl SnapshotExporter {
    pub fn new(
        directory: Arc<dyn InventoryDirectory>,
        ingest: Arc<dyn IngestClient>,
        tag_map: Arc<TagMap>,
        segment: String,
    ) -> Self {
        Self {
            directory,
            ingest,
            tag_map,
            segment,
        }
    }

    /// 任何拉取失败都会中止导出，不上传部分清单；上传失败直接返回给调用方
    pub async fn run(&self, scope: &str) -> AppResult<SnapshotReport> {
        let references = self.directory.list_instances(scope).await?;
        let mut instances = self.directory.get_instances(&references).await?;
        info!(scope, count = instances.len(), "已找到虚拟机");

        // 稳定排序，同名实例保持拉取顺序
        instances.sort_by(|a, b| a.name.cmp(&b.name));

        let rows: Vec<RowRecord> = instances
            .iter()
            .filter_map(|instance| build_row(instance, &self.tag_map, &self.segment))
            .collect();

        for row in &rows {
            info!(address = %row.address, name = %row.name, tags = %row.tags, "导出实例");
        }

        info!(rows = rows.len(), "正在上传当前清单");
        let upload_status = self
            .ingest
            .upload(render_csv(&rows), UploadMode::Replace)
            .await?;
        info!(status = %upload_status, "全量清单上传完成");

        Ok(SnapshotReport {
            instances_found: instances.len(),
            rows_exported: rows.len(),
            upload_status,
        })
    }
}
