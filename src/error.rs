// 上传链路错误类型
//
// 分层：
// - 配置错误：立即失败，不重试
// - 分片错误：本地重试，重试耗尽后升级为文件级失败
// - 会话拒绝（未完成 / 过期）：文件级失败
// - 任务级：部分失败与全部失败分开报告

use thiserror::Error;

/// 上传错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    /// 配置错误（分片大小为 0 等）
    #[error("配置错误: {0}")]
    Configuration(String),

    /// 空文件无法分片
    #[error("文件为空，无法分片上传")]
    EmptyFile,

    /// 分片重试耗尽
    #[error("分片 #{index} 上传失败: {source}")]
    ChunkUploadFailed {
        index: usize,
        #[source]
        source: Box<UploadError>,
    },

    /// 分片未全部确认就调用 finalize
    #[error("上传未完成: 已确认 {acked}/{total} 个分片")]
    IncompleteUpload { acked: usize, total: usize },

    /// 会话已过期或已失败
    #[error("会话已过期: {0}")]
    SessionExpired(String),

    /// 会话不存在
    #[error("会话不存在: {0}")]
    SessionNotFound(String),

    /// 分片索引或字节范围越界
    #[error("分片 #{index} 越界: {reason}")]
    ChunkOutOfRange { index: usize, reason: String },

    /// 同一索引重复提交但长度不同
    #[error("分片 #{index} 长度不一致: 已确认 {expected} bytes, 本次 {actual} bytes")]
    ChunkLengthMismatch {
        index: usize,
        expected: u64,
        actual: u64,
    },

    /// 会话状态不允许该操作
    #[error("会话状态不允许该操作: {0}")]
    InvalidState(String),

    /// 网络传输错误
    #[error("网络错误: {0}")]
    Transport(String),

    /// 单次请求超时
    #[error("请求超时: {0}")]
    Timeout(String),

    /// 对象存储错误
    #[error("存储错误: {0}")]
    Storage(String),

    /// 本地读取错误
    #[error("IO 错误: {0}")]
    Io(String),

    /// finalize 轮询次数耗尽仍在处理中
    #[error("等待对象提交超时: 已轮询 {polls} 次")]
    FinalizeTimeout { polls: u32 },

    /// 任务被取消
    #[error("上传已取消")]
    Cancelled,

    /// 部分文件失败
    #[error("部分文件上传失败: 成功 {succeeded} 个, 失败 {failed} 个")]
    PartialJobFailure { succeeded: usize, failed: usize },

    /// 所有文件均失败
    #[error("所有文件上传失败 ({failed} 个)")]
    JobFailed { failed: usize },
}

impl UploadError {
    /// 是否可重试
    ///
    /// 只有传输层的瞬时错误可以重试，会话层的拒绝重发也不会成功
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            UploadError::Transport(_) | UploadError::Timeout(_) | UploadError::Storage(_)
        )
    }

    /// 包装为分片级终止错误
    pub fn into_chunk_failure(self, index: usize) -> Self {
        UploadError::ChunkUploadFailed {
            index,
            source: Box::new(self),
        }
    }
}

impl From<std::io::Error> for UploadError {
    fn from(e: std::io::Error) -> Self {
        UploadError::Io(e.to_string())
    }
}
