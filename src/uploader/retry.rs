// 分片上传重试
//
// - 每次尝试重发完整分片（不做分片内续传）
// - 可重试错误按指数退避等待：base, 2*base, 4*base ... 上限 max_delay
// - 会话层拒绝（过期、越界、长度不一致）立即失败，不消耗重试次数
// - 重试耗尽后返回 ChunkUploadFailed(index, 最后一次错误)

use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::session::{ChunkAck, SessionApi};
use crate::uploader::{ChunkDescriptor, ChunkEvent};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最大尝试次数（含首次）
    pub max_attempts: u32,
    /// 初始退避延迟
    pub base_delay: Duration,
    /// 最大退避延迟
    pub max_delay: Duration,
    /// 单次尝试超时
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&UploadConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            attempt_timeout: config.attempt_timeout(),
        }
    }
}

/// 计算指数退避延迟
///
/// # 延迟序列（base = 1s）
/// - 第 1 次失败后: 1s
/// - 第 2 次失败后: 2s
/// - 第 3 次失败后: 4s
/// - 最大: max_delay
pub fn calculate_backoff_delay(failed_attempt: u32, policy: &RetryPolicy) -> Duration {
    let exponent = failed_attempt.saturating_sub(1).min(31);
    let delay = policy.base_delay.saturating_mul(1u32 << exponent);
    delay.min(policy.max_delay)
}

/// 带退避重试地执行一个请求
///
/// # 参数
/// * `op` - 发起一次请求，参数为尝试序号（从 1 开始）
/// * `on_retry` - 每次决定重试时回调（下一次尝试序号、等待时长、本次错误）
///
/// # 返回
/// 成功结果，或最后一次错误（不可重试错误立即返回）
pub async fn with_retry<T, Op, Fut, OnRetry>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: Op,
    mut on_retry: OnRetry,
) -> Result<T, UploadError>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, UploadError>>,
    OnRetry: FnMut(u32, Duration, &UploadError),
{
    let mut last_error = None;

    for attempt in 1..=policy.max_attempts.max(1) {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let result = match tokio::time::timeout(policy.attempt_timeout, op(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(UploadError::Timeout(format!(
                "第 {} 次尝试超过 {:?}",
                attempt, policy.attempt_timeout
            ))),
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retriable() => return Err(e),
            Err(e) => e,
        };

        if attempt < policy.max_attempts {
            let delay = calculate_backoff_delay(attempt, policy);
            on_retry(attempt + 1, delay, &err);
            tokio::select! {
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        last_error = Some(err);
    }

    Err(last_error.unwrap_or_else(|| UploadError::Transport("上传失败".to_string())))
}

/// 分片上传器
///
/// 成功后发送 ChunkEvent::Completed，重试前发送 ChunkEvent::Retrying
#[derive(Clone)]
pub struct RetryingChunkUploader {
    api: Arc<dyn SessionApi>,
    policy: RetryPolicy,
    events: mpsc::UnboundedSender<ChunkEvent>,
}

impl RetryingChunkUploader {
    pub fn new(
        api: Arc<dyn SessionApi>,
        policy: RetryPolicy,
        events: mpsc::UnboundedSender<ChunkEvent>,
    ) -> Self {
        Self {
            api,
            policy,
            events,
        }
    }

    /// 上传单个分片
    ///
    /// # 参数
    /// * `session_id` - 服务端会话
    /// * `file_id` - 所属文件（用于事件）
    /// * `chunk` - 分片描述
    /// * `bytes` - 分片数据，每次重试完整重发
    /// * `cancel` - 取消令牌
    pub async fn upload(
        &self,
        session_id: &str,
        file_id: &str,
        chunk: &ChunkDescriptor,
        bytes: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<ChunkAck, UploadError> {
        debug!(
            "[分片#{}] 开始上传 (范围: {}-{}, 大小: {} bytes)",
            chunk.index,
            chunk.offset,
            chunk.end().saturating_sub(1),
            chunk.length
        );

        let result = with_retry(
            &self.policy,
            cancel,
            |_| self.api.append_chunk(session_id, chunk, bytes.clone()),
            |next_attempt, delay, err| {
                warn!(
                    "[分片#{}] 上传失败，等待 {}ms 后重试 ({}/{}): {}",
                    chunk.index,
                    delay.as_millis(),
                    next_attempt,
                    self.policy.max_attempts,
                    err
                );
                let _ = self.events.send(ChunkEvent::Retrying {
                    file_id: file_id.to_string(),
                    index: chunk.index,
                    next_attempt,
                    delay,
                    error: err.to_string(),
                });
            },
        )
        .await;

        match result {
            Ok(ack) => {
                debug!(
                    "[分片#{}] ✓ 上传成功 ({}/{} 完成{})",
                    chunk.index,
                    ack.acked_chunks,
                    ack.total_chunks,
                    if ack.duplicate { ", 重复提交" } else { "" }
                );
                let _ = self.events.send(ChunkEvent::Completed {
                    file_id: file_id.to_string(),
                    index: chunk.index,
                });
                Ok(ack)
            }
            Err(UploadError::Cancelled) => Err(UploadError::Cancelled),
            Err(e) => {
                error!(
                    "[分片#{}] 上传失败，已放弃 (最大尝试次数 {}): {}",
                    chunk.index, self.policy.max_attempts, e
                );
                Err(e.into_chunk_failure(chunk.index))
            }
        }
    }
}
