//! 上传事件
//!
//! - ChunkEvent: 分片上传器发给编排器的内部事件
//! - UploadEvent: 对外发布的进度流（百分比 + 文件状态标签）

use crate::session::ObjectRef;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 文件状态标签（前端展示）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileStatusLabel {
    Queued,
    Uploading,
    /// 瞬时失败，正在退避重试
    Retrying,
    Done,
    Failed,
}

/// 分片事件（上传器 -> 编排器）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkEvent {
    /// 服务端已确认
    Completed { file_id: String, index: usize },
    /// 本次尝试失败，等待退避后重试
    Retrying {
        file_id: String,
        index: usize,
        /// 下一次尝试序号（从 1 开始）
        next_attempt: u32,
        delay: Duration,
        error: String,
    },
}

/// 任务结果
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// 全部成功
    Completed,
    /// 部分成功
    PartialFailure,
    /// 全部失败
    Failed,
    /// 已取消
    Cancelled,
}

/// 上传进度事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 任务开始
    JobStarted {
        job_id: String,
        total_files: usize,
        total_previews: usize,
    },
    /// 文件状态变更
    StatusChanged {
        job_id: String,
        file_id: String,
        label: FileStatusLabel,
    },
    /// 进度更新
    Progress {
        job_id: String,
        percentage: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_id: Option<String>,
        acked_chunks: usize,
        total_chunks: usize,
    },
    /// 分片重试
    ChunkRetrying {
        job_id: String,
        file_id: String,
        index: usize,
        next_attempt: u32,
        delay_ms: u64,
        error: String,
    },
    /// 文件完成
    FileCompleted {
        job_id: String,
        file_id: String,
        object: ObjectRef,
        #[serde(skip_serializing_if = "Option::is_none")]
        record_id: Option<String>,
    },
    /// 文件失败
    FileFailed {
        job_id: String,
        file_id: String,
        error: String,
    },
    /// 任务结束
    JobFinished {
        job_id: String,
        outcome: JobOutcome,
        succeeded: usize,
        failed: usize,
    },
}

impl UploadEvent {
    /// 获取任务 ID
    pub fn job_id(&self) -> &str {
        match self {
            UploadEvent::JobStarted { job_id, .. } => job_id,
            UploadEvent::StatusChanged { job_id, .. } => job_id,
            UploadEvent::Progress { job_id, .. } => job_id,
            UploadEvent::ChunkRetrying { job_id, .. } => job_id,
            UploadEvent::FileCompleted { job_id, .. } => job_id,
            UploadEvent::FileFailed { job_id, .. } => job_id,
            UploadEvent::JobFinished { job_id, .. } => job_id,
        }
    }

    /// 获取事件类型名称
    pub fn event_type_name(&self) -> &'static str {
        match self {
            UploadEvent::JobStarted { .. } => "job_started",
            UploadEvent::StatusChanged { .. } => "status_changed",
            UploadEvent::Progress { .. } => "progress",
            UploadEvent::ChunkRetrying { .. } => "chunk_retrying",
            UploadEvent::FileCompleted { .. } => "file_completed",
            UploadEvent::FileFailed { .. } => "file_failed",
            UploadEvent::JobFinished { .. } => "job_finished",
        }
    }
}
