// 服务层模块
pub mod batch_exporter;
pub mod change_consumer;
pub mod directory_client;
pub mod ingest_client;
pub mod snapshot_exporter;
pub mod tag_formatter;

#[cfg(test)]
pub(crate) mod test_support;

pub use batch_exporter::{BatchExporter, ExporterStats, RowSink, row_channel};
pub use change_consumer::{ChangeEventConsumer, ConsumerStats};
pub use directory_client::{HttpDirectory, InventoryDirectory, Subscription, TagResolver};
pub use ingest_client::{IngestClient, TetrationClient, UploadMode};
pub use snapshot_exporter::{SnapshotExporter, SnapshotReport};
pub use tag_formatter::{build_row, format_tags, load_tag_map};
