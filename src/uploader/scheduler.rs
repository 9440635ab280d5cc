// 分片并发调度器
//
// 每个文件一个固定大小的 worker 池：
// - 最多 K 个 worker，每个 worker 从共享分片表中领取下一个待上传分片
// - 领取在锁内完成，同一分片不会被两个 worker 取走
// - 任一分片重试耗尽后设置失败标记，不再领取新分片，已在上传中的分片允许完成
// - 取消后同样停止领取，在途请求自行完成或超时

use crate::error::UploadError;
use crate::uploader::{ChunkDescriptor, ChunkTable, RetryingChunkUploader, UploadSource};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 调度结果
#[derive(Debug, Clone)]
pub struct ScheduleReport {
    /// 分片最终状态
    pub chunks: Vec<ChunkDescriptor>,
    /// 第一个导致文件失败的错误
    pub error: Option<UploadError>,
}

impl ScheduleReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<Vec<ChunkDescriptor>, UploadError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.chunks),
        }
    }
}

/// 单个文件的 worker 共享状态
struct WorkerShared {
    table: Mutex<ChunkTable>,
    /// 失败标记（fail-fast）
    failed: AtomicBool,
    first_error: Mutex<Option<UploadError>>,
}

impl WorkerShared {
    fn record_failure(&self, index: usize, err: UploadError) {
        self.table.lock().mark_failed(index);
        self.failed.store(true, Ordering::SeqCst);
        let mut first = self.first_error.lock();
        if first.is_none() {
            *first = Some(err);
        }
    }
}

/// 分片调度器
#[derive(Clone)]
pub struct ChunkScheduler {
    uploader: RetryingChunkUploader,
    max_concurrent_chunks: usize,
}

impl ChunkScheduler {
    pub fn new(uploader: RetryingChunkUploader, max_concurrent_chunks: usize) -> Self {
        Self {
            uploader,
            max_concurrent_chunks: max_concurrent_chunks.max(1),
        }
    }

    /// 上传一个文件的全部分片
    ///
    /// 只有所有分片都被确认时才返回成功
    pub async fn run(
        &self,
        session_id: &str,
        file_id: &str,
        source: &UploadSource,
        chunks: Vec<ChunkDescriptor>,
        cancel: &CancellationToken,
    ) -> ScheduleReport {
        let total = chunks.len();
        let workers = self.max_concurrent_chunks.min(total.max(1));
        let shared = Arc::new(WorkerShared {
            table: Mutex::new(ChunkTable::new(chunks)),
            failed: AtomicBool::new(false),
            first_error: Mutex::new(None),
        });

        info!(
            "文件 {} 开始上传分片: 共 {} 个, 并发 worker={}",
            file_id, total, workers
        );

        let mut join_set = JoinSet::new();
        for worker_id in 1..=workers {
            let shared = shared.clone();
            let uploader = self.uploader.clone();
            let source = source.clone();
            let cancel = cancel.clone();
            let session_id = session_id.to_string();
            let file_id = file_id.to_string();

            join_set.spawn(async move {
                Self::worker_loop(
                    worker_id,
                    &shared,
                    &uploader,
                    &source,
                    &session_id,
                    &file_id,
                    &cancel,
                )
                .await;
            });
        }

        while let Some(result) = join_set.join_next().await {
            if let Err(e) = result {
                error!("文件 {} 分片 worker 异常退出: {}", file_id, e);
                shared.failed.store(true, Ordering::SeqCst);
                let mut first = shared.first_error.lock();
                if first.is_none() {
                    *first = Some(UploadError::InvalidState(format!(
                        "分片 worker 异常退出: {}",
                        e
                    )));
                }
            }
        }

        let mut table = shared.table.lock();
        table.release_in_flight();

        let mut error = shared.first_error.lock().take();
        if error.is_none() && !table.is_all_acked() {
            error = Some(if cancel.is_cancelled() {
                UploadError::Cancelled
            } else {
                UploadError::IncompleteUpload {
                    acked: table.acked_count(),
                    total: table.chunk_count(),
                }
            });
        }

        match &error {
            None => info!("文件 {} 全部 {} 个分片已确认", file_id, total),
            Some(UploadError::Cancelled) => info!(
                "文件 {} 分片上传已取消 ({}/{} 已确认)",
                file_id,
                table.acked_count(),
                total
            ),
            Some(e) => warn!(
                "文件 {} 分片上传失败 ({}/{} 已确认): {}",
                file_id,
                table.acked_count(),
                total,
                e
            ),
        }

        ScheduleReport {
            chunks: table.chunks().to_vec(),
            error,
        }
    }

    async fn worker_loop(
        worker_id: usize,
        shared: &WorkerShared,
        uploader: &RetryingChunkUploader,
        source: &UploadSource,
        session_id: &str,
        file_id: &str,
        cancel: &CancellationToken,
    ) {
        loop {
            if shared.failed.load(Ordering::SeqCst) || cancel.is_cancelled() {
                break;
            }

            let chunk = match shared.table.lock().next_pending() {
                Some(chunk) => chunk,
                None => break,
            };

            debug!("[worker{}] 领取分片 #{}", worker_id, chunk.index);

            let bytes = match source.read_chunk(&chunk).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("[worker{}] 读取分片 #{} 失败: {}", worker_id, chunk.index, e);
                    shared.record_failure(chunk.index, e.into_chunk_failure(chunk.index));
                    break;
                }
            };

            match uploader
                .upload(session_id, file_id, &chunk, bytes, cancel)
                .await
            {
                Ok(_) => shared.table.lock().mark_acked(chunk.index),
                Err(UploadError::Cancelled) => {
                    debug!("[worker{}] 分片 #{} 因取消而停止", worker_id, chunk.index);
                    break;
                }
                Err(e) => {
                    shared.record_failure(chunk.index, e);
                    break;
                }
            }
        }

        debug!("[worker{}] 退出", worker_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::retry::tests::{fast_policy, ScriptedApi};
    use crate::uploader::{split_into_chunks, ChunkStatus};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn scheduler(api: Arc<ScriptedApi>, k: usize) -> ChunkScheduler {
        let (tx, _rx) = mpsc::unbounded_channel();
        ChunkScheduler::new(RetryingChunkUploader::new(api, fast_policy(), tx), k)
    }

    fn source(size: usize) -> UploadSource {
        UploadSource::Memory(Arc::new(vec![7u8; size]))
    }

    #[tokio::test]
    async fn test_all_chunks_acked() {
        let api = Arc::new(ScriptedApi::default());
        let chunks = split_into_chunks(10, 4).unwrap();
        let report = scheduler(api.clone(), 3)
            .run("s", "f", &source(10), chunks, &CancellationToken::new())
            .await;

        assert!(report.is_success());
        assert!(report.chunks.iter().all(|c| c.status == ChunkStatus::Acked));
        for i in 0..3 {
            assert_eq!(api.calls(i), 1);
        }
    }

    #[tokio::test]
    async fn test_middle_chunk_exhausts_retries() {
        let api = Arc::new(ScriptedApi::default());
        api.fail(1, 10, UploadError::Transport("reset".into()));

        let chunks = split_into_chunks(12, 4).unwrap();
        let report = scheduler(api.clone(), 3)
            .run("s", "f", &source(12), chunks, &CancellationToken::new())
            .await;

        assert!(matches!(
            report.error,
            Some(UploadError::ChunkUploadFailed { index: 1, .. })
        ));
        assert_eq!(report.chunks[0].status, ChunkStatus::Acked);
        assert_eq!(report.chunks[1].status, ChunkStatus::Failed);
        assert_eq!(report.chunks[2].status, ChunkStatus::Acked);

        // 已确认的分片不会重传
        assert_eq!(api.calls(0), 1);
        assert_eq!(api.calls(1), 3);
        assert_eq!(api.calls(2), 1);
    }

    #[tokio::test]
    async fn test_fail_fast_stops_new_chunks() {
        let api = Arc::new(ScriptedApi::default());
        api.fail(1, 1, UploadError::SessionExpired("s".into()));

        let chunks = split_into_chunks(16, 4).unwrap();
        let report = scheduler(api.clone(), 1)
            .run("s", "f", &source(16), chunks, &CancellationToken::new())
            .await;

        assert!(!report.is_success());
        assert_eq!(api.calls(2), 0);
        assert_eq!(api.calls(3), 0);
        assert_eq!(report.chunks[2].status, ChunkStatus::Pending);
        assert_eq!(report.chunks[3].status, ChunkStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let api = Arc::new(ScriptedApi::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let chunks = split_into_chunks(8, 4).unwrap();
        let report = scheduler(api.clone(), 2)
            .run("s", "f", &source(8), chunks, &cancel)
            .await;

        assert_eq!(report.error, Some(UploadError::Cancelled));
        assert_eq!(api.calls(0), 0);
        assert!(report.chunks.iter().all(|c| c.status == ChunkStatus::Pending));
    }

    #[tokio::test]
    async fn test_unreadable_source_fails_file() {
        let api = Arc::new(ScriptedApi::default());
        let chunks = split_into_chunks(8, 4).unwrap();
        // 数据只有 5 字节，第二个分片越界
        let report = scheduler(api.clone(), 1)
            .run("s", "f", &source(5), chunks, &CancellationToken::new())
            .await;

        assert!(matches!(
            report.into_result(),
            Err(UploadError::ChunkUploadFailed { index: 1, .. })
        ));
    }
}
