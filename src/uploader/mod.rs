// 分片上传模块（客户端）
//
// - chunk: 切分规则、分片表、数据来源
// - retry: 单分片指数退避重试
// - scheduler: 单文件固定大小 worker 池
// - progress: 多文件阶段进度聚合
// - orchestrator: 一次提交的完整流程
// - kit: 音色包文件夹扫描

pub mod catalog;
pub mod chunk;
pub mod events;
pub mod kit;
pub mod orchestrator;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod task;

pub use catalog::{CatalogEntry, CatalogService, MemoryCatalog};
pub use chunk::{
    split_into_chunks, ChunkDescriptor, ChunkStatus, ChunkTable, UploadSource,
    DEFAULT_UPLOAD_CHUNK_SIZE,
};
pub use events::{ChunkEvent, FileStatusLabel, JobOutcome, UploadEvent};
pub use kit::{content_type_for, is_preview_asset, KitFile, KitScanOptions, KitScanner};
pub use orchestrator::{FileReport, JobReport, UploadOrchestrator};
pub use progress::ProgressAggregator;
pub use retry::{calculate_backoff_delay, with_retry, RetryPolicy, RetryingChunkUploader};
pub use scheduler::{ChunkScheduler, ScheduleReport};
pub use task::{FileRole, UploadTask, UploadTaskStatus};
