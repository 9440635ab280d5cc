// 上传编排器
//
// 一次提交（submission）包含多个文件：
// 1. 准备阶段：创建目录提交记录
// 2. 上传阶段：主文件逐个（或有限并发）上传
//    每个文件：切分 -> 创建会话 -> 分片调度 -> finalize 轮询 -> 写入目录
// 3. 收尾阶段：预览文件按同样流程上传
//
// 单文件失败只记录并继续其余文件；全部失败才是任务级硬失败。
// 进度聚合只在本控制流中修改，分片事件通过 channel 汇入。

use crate::config::{ProgressConfig, UploadConfig};
use crate::error::UploadError;
use crate::session::{FinalizeOutcome, ObjectRef, SessionApi, SessionInit};
use crate::uploader::{
    split_into_chunks, with_retry, CatalogEntry, CatalogService, ChunkEvent, ChunkScheduler,
    FileRole, FileStatusLabel, JobOutcome, ProgressAggregator, RetryPolicy,
    RetryingChunkUploader, UploadEvent, UploadTask, UploadTaskStatus,
};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 事件广播容量
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// 单文件结果
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub file_id: String,
    pub name: String,
    pub role: FileRole,
    pub status: UploadTaskStatus,
    pub acked_chunks: usize,
    pub total_chunks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&UploadTask> for FileReport {
    fn from(task: &UploadTask) -> Self {
        Self {
            file_id: task.id.clone(),
            name: task.name.clone(),
            role: task.role,
            status: task.status,
            acked_chunks: task.acked_chunks(),
            total_chunks: task.chunks.len(),
            object: task.object.clone(),
            record_id: task.record_id.clone(),
            error: task.error.clone(),
        }
    }
}

/// 任务结果
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<String>,
    pub outcome: JobOutcome,
    pub files: Vec<FileReport>,
    pub final_percentage: f64,
}

impl JobReport {
    pub fn succeeded(&self) -> usize {
        self.files
            .iter()
            .filter(|f| f.status == UploadTaskStatus::Completed)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.files.len() - self.succeeded()
    }

    pub fn file(&self, name: &str) -> Option<&FileReport> {
        self.files.iter().find(|f| f.name == name)
    }

    /// 转换为 Result：部分失败、全部失败、取消都作为错误返回
    pub fn into_result(self) -> Result<JobReport, UploadError> {
        match self.outcome {
            JobOutcome::Completed => Ok(self),
            JobOutcome::PartialFailure => Err(UploadError::PartialJobFailure {
                succeeded: self.succeeded(),
                failed: self.failed(),
            }),
            JobOutcome::Failed => Err(UploadError::JobFailed {
                failed: self.failed(),
            }),
            JobOutcome::Cancelled => Err(UploadError::Cancelled),
        }
    }
}

/// 单次任务的上下文（文件级流程共享）
struct JobContext {
    job_id: String,
    submission_id: String,
    scheduler: ChunkScheduler,
    cancel: CancellationToken,
}

/// 上传编排器
pub struct UploadOrchestrator {
    api: Arc<dyn SessionApi>,
    catalog: Arc<dyn CatalogService>,
    config: UploadConfig,
    progress_config: ProgressConfig,
    policy: RetryPolicy,
    chunk_size: u64,
    event_tx: broadcast::Sender<UploadEvent>,
}

impl UploadOrchestrator {
    /// 创建编排器
    ///
    /// # 参数
    /// * `config` - 上传配置（分片大小、并发、重试、finalize 轮询）
    /// * `progress_config` - 进度阶段预算
    /// * `api` - 会话协议
    /// * `catalog` - 目录服务
    pub fn new(
        config: &UploadConfig,
        progress_config: ProgressConfig,
        api: Arc<dyn SessionApi>,
        catalog: Arc<dyn CatalogService>,
    ) -> Result<Self, UploadError> {
        config.validate()?;
        progress_config.validate()?;

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(
            "创建上传编排器: 分片大小={}MB, 文件内并发={}, 文件并发={}, 最大尝试次数={}",
            config.chunk_size_mb,
            config.max_concurrent_chunks,
            config.max_concurrent_files,
            config.max_attempts
        );

        Ok(Self {
            api,
            catalog,
            policy: RetryPolicy::from_config(config),
            chunk_size: config.chunk_size_bytes(),
            config: config.clone(),
            progress_config,
            event_tx,
        })
    }

    /// 覆盖分片大小（字节）
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// 覆盖重试策略
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// 订阅进度事件
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.event_tx.subscribe()
    }

    fn publish_event(&self, event: UploadEvent) {
        debug!("发布上传事件: {}", event.event_type_name());
        // 没有订阅者时发送失败，忽略
        let _ = self.event_tx.send(event);
    }

    fn publish_status(&self, job_id: &str, file_id: &str, label: FileStatusLabel) {
        self.publish_event(UploadEvent::StatusChanged {
            job_id: job_id.to_string(),
            file_id: file_id.to_string(),
            label,
        });
    }

    fn publish_progress(
        &self,
        job_id: &str,
        progress: &ProgressAggregator,
        file_id: Option<&str>,
    ) {
        let (acked_chunks, total_chunks) =
            file_id.map(|id| progress.file_counts(id)).unwrap_or((0, 0));
        self.publish_event(UploadEvent::Progress {
            job_id: job_id.to_string(),
            percentage: progress.percentage(),
            file_id: file_id.map(str::to_string),
            acked_chunks,
            total_chunks,
        });
    }

    /// 提交一组文件
    ///
    /// 返回 Err 仅限于任务无法开始（没有主文件、目录提交创建失败）；
    /// 文件级失败体现在 JobReport 中
    pub async fn submit(
        &self,
        title: &str,
        tasks: Vec<UploadTask>,
        cancel: CancellationToken,
    ) -> Result<JobReport, UploadError> {
        let (primaries, previews): (Vec<_>, Vec<_>) =
            tasks.into_iter().partition(|t| t.role == FileRole::Primary);
        if primaries.is_empty() {
            return Err(UploadError::Configuration(
                "提交中没有可上传的主文件".to_string(),
            ));
        }

        let job_id = Uuid::new_v4().to_string();
        info!(
            "开始上传任务 {}: title={}, 主文件 {} 个, 预览文件 {} 个",
            job_id,
            title,
            primaries.len(),
            previews.len()
        );

        let mut progress = ProgressAggregator::new(self.progress_config);
        for task in primaries.iter().chain(previews.iter()) {
            progress.add_file(task.id.clone(), task.role);
        }

        self.publish_event(UploadEvent::JobStarted {
            job_id: job_id.clone(),
            total_files: primaries.len(),
            total_previews: previews.len(),
        });
        for task in primaries.iter().chain(previews.iter()) {
            self.publish_status(&job_id, &task.id, FileStatusLabel::Queued);
        }

        // 准备阶段：创建目录提交
        let submission = with_retry(
            &self.policy,
            &cancel,
            |_| self.catalog.create_submission(title),
            |next_attempt, delay, err| {
                warn!(
                    "创建目录提交失败，等待 {}ms 后重试 (第 {} 次): {}",
                    delay.as_millis(),
                    next_attempt,
                    err
                );
            },
        )
        .await;

        let submission_id = match submission {
            Ok(id) => id,
            Err(UploadError::Cancelled) => {
                info!("上传任务 {} 在准备阶段被取消", job_id);
                let files = primaries
                    .into_iter()
                    .chain(previews)
                    .map(|mut task| {
                        task.mark_failed(UploadError::Cancelled.to_string());
                        task
                    })
                    .collect();
                return Ok(self.finish_job(job_id, None, files, &mut progress, &cancel));
            }
            Err(e) => {
                error!("上传任务 {} 创建目录提交失败: {}", job_id, e);
                return Err(e);
            }
        };

        progress.complete_pre_phase();
        self.publish_progress(&job_id, &progress, None);

        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
        let uploader = RetryingChunkUploader::new(self.api.clone(), self.policy, chunk_tx);
        let ctx = JobContext {
            job_id: job_id.clone(),
            submission_id: submission_id.clone(),
            scheduler: ChunkScheduler::new(uploader, self.config.max_concurrent_chunks),
            cancel: cancel.clone(),
        };

        let mut finished = self
            .run_phase(&ctx, primaries, &mut progress, &mut chunk_rx)
            .await;
        info!("上传任务 {} 主文件阶段结束", job_id);

        if !previews.is_empty() {
            let preview_results = self
                .run_phase(&ctx, previews, &mut progress, &mut chunk_rx)
                .await;
            finished.extend(preview_results);
            info!("上传任务 {} 预览文件阶段结束", job_id);
        }

        Ok(self.finish_job(job_id, Some(submission_id), finished, &mut progress, &cancel))
    }

    /// 执行一个阶段的文件上传
    ///
    /// 文件级流程在 buffer_unordered 中并发推进，同时消费分片事件更新进度
    async fn run_phase(
        &self,
        ctx: &JobContext,
        tasks: Vec<UploadTask>,
        progress: &mut ProgressAggregator,
        chunk_rx: &mut mpsc::UnboundedReceiver<ChunkEvent>,
    ) -> Vec<UploadTask> {
        let mut finished = Vec::with_capacity(tasks.len());
        let mut runnable = Vec::with_capacity(tasks.len());

        // 切分是纯计算，在控制流中同步完成，配置类错误直接判定文件失败
        for mut task in tasks {
            task.mark_chunking();
            match split_into_chunks(task.total_size, self.chunk_size) {
                Ok(chunks) => {
                    progress.set_chunk_count(&task.id, chunks.len());
                    task.chunks = chunks;
                    runnable.push(task);
                }
                Err(e) => {
                    error!("文件 {} 切分失败: {}", task.name, e);
                    self.fail_file(ctx, &mut task, &e);
                    finished.push(task);
                }
            }
        }

        let mut retrying: HashSet<(String, usize)> = HashSet::new();
        let files = stream::iter(runnable)
            .map(|task| self.run_file(ctx, task))
            .buffer_unordered(self.config.max_concurrent_files.max(1));
        tokio::pin!(files);

        loop {
            tokio::select! {
                Some(event) = chunk_rx.recv() => {
                    self.on_chunk_event(&ctx.job_id, progress, &mut retrying, event);
                }
                next = files.next() => {
                    // 先处理该文件已发出的分片事件，再登记文件结果
                    while let Ok(event) = chunk_rx.try_recv() {
                        self.on_chunk_event(&ctx.job_id, progress, &mut retrying, event);
                    }
                    match next {
                        Some(task) => {
                            retrying.retain(|(file_id, _)| file_id != &task.id);
                            if task.status == UploadTaskStatus::Completed {
                                progress.complete_file(&task.id);
                                self.publish_progress(&ctx.job_id, progress, Some(&task.id));
                            }
                            finished.push(task);
                        }
                        None => break,
                    }
                }
            }
        }

        finished
    }

    fn on_chunk_event(
        &self,
        job_id: &str,
        progress: &mut ProgressAggregator,
        retrying: &mut HashSet<(String, usize)>,
        event: ChunkEvent,
    ) {
        let file_retrying = |retrying: &HashSet<(String, usize)>, file_id: &str| {
            retrying.iter().any(|(id, _)| id == file_id)
        };
        match event {
            ChunkEvent::Completed { file_id, index } => {
                progress.record_chunk(&file_id, index);
                // 同一文件还有分片在退避时保持 retrying
                if retrying.remove(&(file_id.clone(), index))
                    && !file_retrying(retrying, &file_id)
                {
                    self.publish_status(job_id, &file_id, FileStatusLabel::Uploading);
                }
                self.publish_progress(job_id, progress, Some(&file_id));
            }
            ChunkEvent::Retrying {
                file_id,
                index,
                next_attempt,
                delay,
                error,
            } => {
                let already_retrying = file_retrying(retrying, &file_id);
                retrying.insert((file_id.clone(), index));
                if !already_retrying {
                    self.publish_status(job_id, &file_id, FileStatusLabel::Retrying);
                }
                self.publish_event(UploadEvent::ChunkRetrying {
                    job_id: job_id.to_string(),
                    file_id,
                    index,
                    next_attempt,
                    delay_ms: delay.as_millis() as u64,
                    error,
                });
            }
        }
    }

    /// 单文件流程：创建会话 -> 分片调度 -> finalize -> 写目录
    async fn run_file(&self, ctx: &JobContext, mut task: UploadTask) -> UploadTask {
        match self.upload_file(ctx, &mut task).await {
            Ok(object) => {
                task.mark_completed(object.clone());
                self.record_in_catalog(ctx, &mut task, &object).await;
                info!(
                    "文件上传完成: {} -> {} ({} bytes)",
                    task.name, object.id, object.size
                );
                self.publish_event(UploadEvent::FileCompleted {
                    job_id: ctx.job_id.clone(),
                    file_id: task.id.clone(),
                    object,
                    record_id: task.record_id.clone(),
                });
                self.publish_status(&ctx.job_id, &task.id, FileStatusLabel::Done);
            }
            Err(e) => {
                if let Some(session_id) = task.session_id.clone() {
                    // 尽力放弃会话，释放服务端暂存数据
                    if let Err(abort_err) = self.api.abort(&session_id).await {
                        warn!("放弃会话 {} 失败: {}", session_id, abort_err);
                    }
                }
                self.fail_file(ctx, &mut task, &e);
            }
        }
        task
    }

    async fn upload_file(
        &self,
        ctx: &JobContext,
        task: &mut UploadTask,
    ) -> Result<ObjectRef, UploadError> {
        if ctx.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        self.publish_status(&ctx.job_id, &task.id, FileStatusLabel::Uploading);

        let init = SessionInit {
            destination: task.name.clone(),
            content_type: task.content_type.clone(),
            total_chunks: task.chunks.len(),
            expected_size: Some(task.total_size),
        };
        let session_id = with_retry(
            &self.policy,
            &ctx.cancel,
            |_| self.api.init(init.clone()),
            |next_attempt, delay, err| {
                warn!(
                    "文件 {} 创建会话失败，等待 {}ms 后重试 (第 {} 次): {}",
                    task.name,
                    delay.as_millis(),
                    next_attempt,
                    err
                );
            },
        )
        .await?;

        task.session_id = Some(session_id.clone());
        task.mark_uploading();
        info!(
            "文件 {} 会话已创建: {} ({} 个分片)",
            task.name,
            session_id,
            task.chunks.len()
        );

        let report = ctx
            .scheduler
            .run(
                &session_id,
                &task.id,
                &task.source,
                task.chunks.clone(),
                &ctx.cancel,
            )
            .await;
        task.chunks = report.chunks.clone();
        report.into_result()?;

        task.mark_finalizing();
        self.finalize_with_polling(ctx, &session_id, &task.name).await
    }

    /// 轮询 finalize 直到拿到持久引用
    async fn finalize_with_polling(
        &self,
        ctx: &JobContext,
        session_id: &str,
        name: &str,
    ) -> Result<ObjectRef, UploadError> {
        let max_polls = self.config.max_finalize_polls.max(1);
        let interval = self.config.finalize_poll_interval();

        for poll in 1..=max_polls {
            let outcome = with_retry(
                &self.policy,
                &ctx.cancel,
                |_| self.api.finalize(session_id),
                |next_attempt, delay, err| {
                    warn!(
                        "文件 {} finalize 失败，等待 {}ms 后重试 (第 {} 次): {}",
                        name,
                        delay.as_millis(),
                        next_attempt,
                        err
                    );
                },
            )
            .await?;

            match outcome {
                FinalizeOutcome::Completed { object } => return Ok(object),
                FinalizeOutcome::Processing => {
                    debug!(
                        "文件 {} 对象提交处理中 ({}/{}), {}ms 后重新查询",
                        name,
                        poll,
                        max_polls,
                        interval.as_millis()
                    );
                    if poll < max_polls {
                        wait_or_cancel(interval, &ctx.cancel).await?;
                    }
                }
            }
        }

        warn!("文件 {} 等待对象提交超时 ({} 次)", name, max_polls);
        Err(UploadError::FinalizeTimeout { polls: max_polls })
    }

    /// 写入目录，失败不回滚已提交的对象
    async fn record_in_catalog(&self, ctx: &JobContext, task: &mut UploadTask, object: &ObjectRef) {
        let entry = CatalogEntry {
            name: task.name.clone(),
            size: task.total_size,
            content_type: task.content_type.clone(),
            object: object.clone(),
        };
        match self.catalog.record_object(&ctx.submission_id, entry).await {
            Ok(record_id) => task.record_id = Some(record_id),
            Err(e) => {
                warn!("文件 {} 目录记录失败（对象已保留）: {}", task.name, e);
                task.error = Some(format!("目录记录失败: {}", e));
            }
        }
    }

    fn fail_file(&self, ctx: &JobContext, task: &mut UploadTask, err: &UploadError) {
        if matches!(err, UploadError::Cancelled) {
            info!("文件 {} 已取消", task.name);
        } else {
            error!("文件 {} 上传失败: {}", task.name, err);
        }
        task.mark_failed(err.to_string());
        self.publish_event(UploadEvent::FileFailed {
            job_id: ctx.job_id.clone(),
            file_id: task.id.clone(),
            error: err.to_string(),
        });
        self.publish_status(&ctx.job_id, &task.id, FileStatusLabel::Failed);
    }

    fn finish_job(
        &self,
        job_id: String,
        submission_id: Option<String>,
        tasks: Vec<UploadTask>,
        progress: &mut ProgressAggregator,
        cancel: &CancellationToken,
    ) -> JobReport {
        let files: Vec<FileReport> = tasks.iter().map(FileReport::from).collect();
        let succeeded = files
            .iter()
            .filter(|f| f.status == UploadTaskStatus::Completed)
            .count();
        let failed = files.len() - succeeded;

        let outcome = if failed == 0 {
            JobOutcome::Completed
        } else if cancel.is_cancelled() {
            JobOutcome::Cancelled
        } else if succeeded == 0 {
            JobOutcome::Failed
        } else {
            JobOutcome::PartialFailure
        };

        if matches!(outcome, JobOutcome::Completed | JobOutcome::PartialFailure) {
            progress.finish();
            self.publish_progress(&job_id, progress, None);
        }

        match outcome {
            JobOutcome::Completed => info!("上传任务 {} 完成: {} 个文件", job_id, succeeded),
            JobOutcome::PartialFailure => warn!(
                "上传任务 {} 部分失败: 成功 {} 个, 失败 {} 个",
                job_id, succeeded, failed
            ),
            JobOutcome::Failed => error!("上传任务 {} 全部失败 ({} 个)", job_id, failed),
            JobOutcome::Cancelled => info!(
                "上传任务 {} 已取消: 成功 {} 个, 未完成 {} 个",
                job_id, succeeded, failed
            ),
        }

        self.publish_event(UploadEvent::JobFinished {
            job_id: job_id.clone(),
            outcome,
            succeeded,
            failed,
        });

        JobReport {
            job_id,
            submission_id,
            outcome,
            files,
            final_percentage: progress.percentage(),
        }
    }
}

async fn wait_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<(), UploadError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(UploadError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
