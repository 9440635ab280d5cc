// 上传任务定义

use crate::session::{ObjectRef, SessionId};
use crate::uploader::{ChunkDescriptor, ChunkStatus, UploadSource};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// 上传任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadTaskStatus {
    /// 等待中
    Pending,
    /// 切分中
    Chunking,
    /// 上传中
    Uploading,
    /// 等待服务端提交
    Finalizing,
    /// 已完成
    Completed,
    /// 失败
    Failed,
}

impl UploadTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadTaskStatus::Completed | UploadTaskStatus::Failed)
    }
}

/// 文件角色
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileRole {
    /// 主文件（上传阶段）
    Primary,
    /// 预览文件（收尾阶段）
    Preview,
}

/// 上传任务
#[derive(Debug, Clone, Serialize)]
pub struct UploadTask {
    /// 任务ID
    pub id: String,
    /// 目标对象名
    pub name: String,
    /// 内容类型
    pub content_type: String,
    /// 文件大小
    pub total_size: u64,
    /// 文件角色
    pub role: FileRole,
    /// 数据来源
    #[serde(skip)]
    pub source: UploadSource,
    /// 分片列表（切分后填充）
    pub chunks: Vec<ChunkDescriptor>,
    /// 任务状态
    pub status: UploadTaskStatus,
    /// 服务端会话 ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// 已提交对象
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectRef>,
    /// 目录记录 ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    /// 错误信息
    pub error: Option<String>,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
}

impl UploadTask {
    /// 创建新的上传任务
    pub fn new(
        name: impl Into<String>,
        content_type: impl Into<String>,
        total_size: u64,
        source: UploadSource,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            content_type: content_type.into(),
            total_size,
            role: FileRole::Primary,
            source,
            chunks: Vec::new(),
            status: UploadTaskStatus::Pending,
            session_id: None,
            object: None,
            record_id: None,
            error: None,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
        }
    }

    /// 从内存数据创建
    pub fn from_bytes(
        name: impl Into<String>,
        content_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        let size = data.len() as u64;
        Self::new(name, content_type, size, UploadSource::Memory(Arc::new(data)))
    }

    /// 从本地文件创建
    pub fn from_file(
        name: impl Into<String>,
        content_type: impl Into<String>,
        path: PathBuf,
        size: u64,
    ) -> Self {
        Self::new(name, content_type, size, UploadSource::File(path))
    }

    /// 标记为预览文件
    pub fn as_preview(mut self) -> Self {
        self.role = FileRole::Preview;
        self
    }

    /// 已确认分片数
    pub fn acked_chunks(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Acked)
            .count()
    }

    /// 分片完成比例 (0.0 - 1.0)
    pub fn fraction(&self) -> f64 {
        if self.chunks.is_empty() {
            return 0.0;
        }
        self.acked_chunks() as f64 / self.chunks.len() as f64
    }

    pub fn mark_chunking(&mut self) {
        self.status = UploadTaskStatus::Chunking;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    pub fn mark_uploading(&mut self) {
        self.status = UploadTaskStatus::Uploading;
    }

    pub fn mark_finalizing(&mut self) {
        self.status = UploadTaskStatus::Finalizing;
    }

    pub fn mark_completed(&mut self, object: ObjectRef) {
        self.status = UploadTaskStatus::Completed;
        self.object = Some(object);
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = UploadTaskStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }
}
