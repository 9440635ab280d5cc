// 上传会话协议
//
// 客户端只依赖 SessionApi，服务端 SessionStore 实现它；
// 测试中可以替换成注入故障的实现

use crate::error::UploadError;
use crate::uploader::ChunkDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 会话 ID（不透明令牌）
pub type SessionId = String;

/// 会话状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Receiving,
    Finalizing,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

/// 创建会话请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInit {
    /// 目标对象名
    pub destination: String,
    /// 内容类型
    pub content_type: String,
    /// 分片总数
    pub total_chunks: usize,
    /// 文件总大小（可选，用于校验分片越界）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_size: Option<u64>,
}

/// 分片确认
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkAck {
    pub index: usize,
    /// 该索引此前已确认（重试导致的重复提交）
    pub duplicate: bool,
    /// 当前已确认分片数
    pub acked_chunks: usize,
    pub total_chunks: usize,
}

/// 已提交对象引用
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectRef {
    /// 持久引用 ID
    pub id: String,
    /// 对象名
    pub name: String,
    /// 对象大小
    pub size: u64,
    /// 内容 SHA-256
    pub etag: String,
}

/// finalize 结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum FinalizeOutcome {
    /// 对象已持久化
    Completed { object: ObjectRef },
    /// 后端仍在提交，调用方稍后重试
    Processing,
}

/// 会话快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub destination: String,
    pub status: SessionStatus,
    pub total_chunks: usize,
    pub acked_chunks: usize,
    pub received_bytes: u64,
    /// 距上次活动的毫秒数
    pub idle_ms: u64,
    pub object: Option<ObjectRef>,
}

/// 会话协议
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// 创建会话
    async fn init(&self, init: SessionInit) -> Result<SessionId, UploadError>;

    /// 追加分片（幂等：同索引同长度重复提交返回成功）
    async fn append_chunk(
        &self,
        session_id: &str,
        chunk: &ChunkDescriptor,
        bytes: Vec<u8>,
    ) -> Result<ChunkAck, UploadError>;

    /// 所有分片是否已确认
    async fn is_complete(&self, session_id: &str) -> Result<bool, UploadError>;

    /// 提交对象
    async fn finalize(&self, session_id: &str) -> Result<FinalizeOutcome, UploadError>;

    /// 放弃会话并丢弃暂存数据
    async fn abort(&self, session_id: &str) -> Result<(), UploadError>;
}
