// 上传会话存储（服务端）
//
// 状态机：Created -> Receiving -> Finalizing -> Completed，任意非终态可进入 Failed
//
// 并发模型：
// - DashMap 保存所有会话，单会话状态由 parking_lot::Mutex 保护
// - 对象存储 I/O 在锁外执行，确认集合的“检查并加入”在锁内一步完成
// - finalize 通过会话级 tokio Mutex 串行化，保证只提交一次
// - 空闲超时在每次访问时惰性检查，reap() 负责回收无人访问的会话

use crate::error::UploadError;
use crate::session::{
    ChunkAck, CommitStatus, FinalizeOutcome, ObjectRef, ObjectStore, SessionApi, SessionId,
    SessionInit, SessionSnapshot, SessionStatus, StagingHandle,
};
use crate::uploader::ChunkDescriptor;
use async_trait::async_trait;
use bit_set::BitSet;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 会话可变状态
#[derive(Debug)]
struct SessionState {
    status: SessionStatus,
    /// 已确认分片索引
    acked: BitSet,
    /// 已确认分片长度（用于幂等判断）
    acked_lengths: HashMap<usize, u64>,
    /// 已确认字节范围：起始偏移 -> (结束偏移, 分片索引)，互不重叠
    acked_ranges: BTreeMap<u64, (u64, usize)>,
    received_bytes: u64,
    last_activity: Instant,
    object: Option<ObjectRef>,
}

/// 单个上传会话
impl SessionState {
    /// 与 [start, end) 重叠的已确认分片索引
    fn overlapping_index(&self, start: u64, end: u64) -> Option<usize> {
        // 已确认范围互不重叠，只需检查起点在 end 之前的最后一段
        self.acked_ranges
            .range(..end)
            .next_back()
            .filter(|(_, (range_end, _))| *range_end > start)
            .map(|(_, (_, index))| *index)
    }
}

#[derive(Debug)]
struct UploadSession {
    id: SessionId,
    destination: String,
    total_chunks: usize,
    expected_size: Option<u64>,
    staging: StagingHandle,
    state: Mutex<SessionState>,
    /// finalize 串行化
    finalize_lock: tokio::sync::Mutex<()>,
}

impl UploadSession {
    /// 空闲超时检查，超时则转为 Failed
    ///
    /// 返回 true 表示本次调用触发了过期
    fn expire_if_idle(&self, state: &mut SessionState, idle_timeout: Duration) -> bool {
        if state.status.is_terminal() || state.last_activity.elapsed() <= idle_timeout {
            return false;
        }
        warn!(
            "会话空闲超时: {} ({}), 已确认 {}/{} 个分片",
            self.id,
            self.destination,
            state.acked.len(),
            self.total_chunks
        );
        state.status = SessionStatus::Failed;
        true
    }

    fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        SessionSnapshot {
            session_id: self.id.clone(),
            destination: self.destination.clone(),
            status: state.status,
            total_chunks: self.total_chunks,
            acked_chunks: state.acked.len(),
            received_bytes: state.received_bytes,
            idle_ms: state.last_activity.elapsed().as_millis() as u64,
            object: state.object.clone(),
        }
    }
}

/// 会话存储
pub struct SessionStore {
    sessions: DashMap<SessionId, Arc<UploadSession>>,
    backend: Arc<dyn ObjectStore>,
    idle_timeout: Duration,
}

impl SessionStore {
    /// 创建会话存储
    ///
    /// # 参数
    /// * `backend` - 对象存储
    /// * `idle_timeout` - 空闲超时，超时的会话转为 Failed 并丢弃暂存数据
    pub fn new(backend: Arc<dyn ObjectStore>, idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            backend,
            idle_timeout,
        }
    }

    fn get(&self, session_id: &str) -> Result<Arc<UploadSession>, UploadError> {
        self.sessions
            .get(session_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))
    }

    /// 过期后丢弃暂存数据（失败只记录日志）
    async fn discard_staging(&self, session: &UploadSession) {
        if let Err(e) = self.backend.discard(&session.staging).await {
            warn!("丢弃会话暂存数据失败: {}: {}", session.id, e);
        }
    }

    /// 只有 Receiving 状态可以追加分片
    fn check_receiving(
        &self,
        session: &UploadSession,
        state: &SessionState,
    ) -> Result<(), UploadError> {
        match state.status {
            SessionStatus::Receiving => Ok(()),
            SessionStatus::Failed => Err(UploadError::SessionExpired(session.id.clone())),
            other => Err(UploadError::InvalidState(format!(
                "会话 {} 当前状态 {:?}，不能追加分片",
                session.id, other
            ))),
        }
    }

    /// 会话快照
    pub fn snapshot(&self, session_id: &str) -> Result<SessionSnapshot, UploadError> {
        Ok(self.get(session_id)?.snapshot())
    }

    /// 当前会话数
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// 回收会话
    ///
    /// 1. 空闲超时的非终态会话转为 Failed 并丢弃暂存数据
    /// 2. 终态且空闲超过超时时间的会话从存储中移除
    ///
    /// 返回本轮过期的会话数
    pub async fn reap(&self) -> usize {
        let mut expired = Vec::new();
        let mut removable = Vec::new();

        for entry in self.sessions.iter() {
            let session = entry.value();
            let mut state = session.state.lock();
            if session.expire_if_idle(&mut state, self.idle_timeout) {
                expired.push(session.clone());
            } else if state.status.is_terminal()
                && state.last_activity.elapsed() > self.idle_timeout
            {
                removable.push(session.id.clone());
            }
        }

        for session in &expired {
            self.discard_staging(session).await;
        }
        for id in &removable {
            self.sessions.remove(id);
        }

        if !expired.is_empty() || !removable.is_empty() {
            info!(
                "会话回收: 过期 {} 个, 移除 {} 个, 剩余 {} 个",
                expired.len(),
                removable.len(),
                self.sessions.len()
            );
        }
        expired.len()
    }

    /// 启动后台回收任务
    pub fn spawn_reaper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("会话回收任务退出");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.reap().await;
                    }
                }
            }
        })
    }
}

fn overlap_error(chunk: &ChunkDescriptor, other: usize) -> UploadError {
    UploadError::ChunkOutOfRange {
        index: chunk.index,
        reason: format!(
            "字节范围 {}..{} 与已确认分片 #{} 重叠",
            chunk.offset,
            chunk.end(),
            other
        ),
    }
}

#[async_trait]
impl SessionApi for SessionStore {
    async fn init(&self, init: SessionInit) -> Result<SessionId, UploadError> {
        if init.total_chunks == 0 {
            return Err(UploadError::Configuration(
                "total_chunks 必须大于 0".to_string(),
            ));
        }

        let staging = self
            .backend
            .begin_upload(&init.destination, &init.content_type)
            .await?;

        let session = Arc::new(UploadSession {
            id: Uuid::new_v4().to_string(),
            destination: init.destination,
            total_chunks: init.total_chunks,
            expected_size: init.expected_size,
            staging,
            state: Mutex::new(SessionState {
                status: SessionStatus::Created,
                acked: BitSet::with_capacity(init.total_chunks),
                acked_lengths: HashMap::new(),
                acked_ranges: BTreeMap::new(),
                received_bytes: 0,
                last_activity: Instant::now(),
                object: None,
            }),
            finalize_lock: tokio::sync::Mutex::new(()),
        });

        // 暂存区已就绪，进入接收状态
        session.state.lock().status = SessionStatus::Receiving;

        info!(
            "创建上传会话: {} -> {}, 分片数={}",
            session.id, session.destination, session.total_chunks
        );

        let id = session.id.clone();
        self.sessions.insert(id.clone(), session);
        Ok(id)
    }

    async fn append_chunk(
        &self,
        session_id: &str,
        chunk: &ChunkDescriptor,
        bytes: Vec<u8>,
    ) -> Result<ChunkAck, UploadError> {
        let session = self.get(session_id)?;
        let length = bytes.len() as u64;

        if chunk.index >= session.total_chunks {
            return Err(UploadError::ChunkOutOfRange {
                index: chunk.index,
                reason: format!("分片总数为 {}", session.total_chunks),
            });
        }
        if length != chunk.length {
            return Err(UploadError::ChunkLengthMismatch {
                index: chunk.index,
                expected: chunk.length,
                actual: length,
            });
        }
        if let Some(expected_size) = session.expected_size {
            if chunk.offset + length > expected_size {
                return Err(UploadError::ChunkOutOfRange {
                    index: chunk.index,
                    reason: format!(
                        "字节范围 {}..{} 超出文件大小 {}",
                        chunk.offset,
                        chunk.offset + length,
                        expected_size
                    ),
                });
            }
        }

        // 第一阶段：状态检查 + 幂等判断
        let expired = {
            let mut state = session.state.lock();
            let expired = session.expire_if_idle(&mut state, self.idle_timeout);
            if !expired {
                self.check_receiving(&session, &state)?;

                if let Some(&acked_len) = state.acked_lengths.get(&chunk.index) {
                    if acked_len != length {
                        return Err(UploadError::ChunkLengthMismatch {
                            index: chunk.index,
                            expected: acked_len,
                            actual: length,
                        });
                    }
                    state.last_activity = Instant::now();
                    debug!(
                        "[会话 {}] 分片 #{} 重复提交，忽略",
                        session.id, chunk.index
                    );
                    return Ok(ChunkAck {
                        index: chunk.index,
                        duplicate: true,
                        acked_chunks: state.acked.len(),
                        total_chunks: session.total_chunks,
                    });
                }
                if let Some(other) = state.overlapping_index(chunk.offset, chunk.end()) {
                    return Err(overlap_error(chunk, other));
                }
                state.last_activity = Instant::now();
            }
            expired
        };
        if expired {
            self.discard_staging(&session).await;
            return Err(UploadError::SessionExpired(session.id.clone()));
        }

        // 第二阶段：锁外写入对象存储（按偏移定位，重复写入同一偏移是幂等的）
        self.backend
            .append_range(&session.staging, chunk.offset, &bytes)
            .await?;

        // 第三阶段：原子地检查并加入确认集合
        let mut state = session.state.lock();
        self.check_receiving(&session, &state)?;
        if !state.acked.contains(chunk.index) {
            // 并发写入的不同分片可能在第一阶段之后才出现重叠
            if let Some(other) = state.overlapping_index(chunk.offset, chunk.end()) {
                return Err(overlap_error(chunk, other));
            }
        }
        let inserted = state.acked.insert(chunk.index);
        if inserted {
            state.acked_lengths.insert(chunk.index, length);
            state
                .acked_ranges
                .insert(chunk.offset, (chunk.end(), chunk.index));
            state.received_bytes += length;
        }
        state.last_activity = Instant::now();

        debug!(
            "[会话 {}] 分片 #{} 已确认 ({}/{})",
            session.id,
            chunk.index,
            state.acked.len(),
            session.total_chunks
        );

        Ok(ChunkAck {
            index: chunk.index,
            duplicate: !inserted,
            acked_chunks: state.acked.len(),
            total_chunks: session.total_chunks,
        })
    }

    async fn is_complete(&self, session_id: &str) -> Result<bool, UploadError> {
        let session = self.get(session_id)?;
        let state = session.state.lock();
        Ok(state.acked.len() == session.total_chunks)
    }

    async fn finalize(&self, session_id: &str) -> Result<FinalizeOutcome, UploadError> {
        let session = self.get(session_id)?;
        let _guard = session.finalize_lock.lock().await;

        let (expired, short) = {
            let mut state = session.state.lock();
            let expired = session.expire_if_idle(&mut state, self.idle_timeout);
            let mut short = None;
            if !expired {
                match state.status {
                    SessionStatus::Completed => {
                        // 已提交：返回同一引用，不再重复提交
                        if let Some(object) = state.object.clone() {
                            return Ok(FinalizeOutcome::Completed { object });
                        }
                    }
                    SessionStatus::Failed => {
                        return Err(UploadError::SessionExpired(session.id.clone()));
                    }
                    SessionStatus::Receiving => {
                        let acked = state.acked.len();
                        if acked != session.total_chunks {
                            return Err(UploadError::IncompleteUpload {
                                acked,
                                total: session.total_chunks,
                            });
                        }
                        match session.expected_size {
                            Some(expected) if state.received_bytes != expected => {
                                state.status = SessionStatus::Failed;
                                short = Some((state.received_bytes, expected));
                            }
                            _ => {
                                state.status = SessionStatus::Finalizing;
                                info!("[会话 {}] 分片已齐，开始提交对象", session.id);
                            }
                        }
                    }
                    SessionStatus::Finalizing => {}
                    SessionStatus::Created => {
                        return Err(UploadError::InvalidState(format!(
                            "会话 {} 尚未就绪",
                            session.id
                        )));
                    }
                }
                state.last_activity = Instant::now();
            }
            (expired, short)
        };
        if expired {
            self.discard_staging(&session).await;
            return Err(UploadError::SessionExpired(session.id.clone()));
        }
        if let Some((received, expected)) = short {
            warn!(
                "[会话 {}] 已确认字节数 {} 与声明大小 {} 不符，会话失败",
                session.id, received, expected
            );
            self.discard_staging(&session).await;
            return Err(UploadError::InvalidState(format!(
                "会话 {} 已确认 {} 字节，声明大小为 {}",
                session.id, received, expected
            )));
        }

        let commit = match self.backend.commit(&session.staging).await {
            Ok(commit) => commit,
            Err(e) => {
                // 提交失败保持 Finalizing，调用方可以重试
                warn!("[会话 {}] 对象提交失败: {}", session.id, e);
                return Err(e);
            }
        };

        if let CommitStatus::Durable(object) = &commit {
            if let Some(expected) = session.expected_size {
                if object.size != expected {
                    session.state.lock().status = SessionStatus::Failed;
                    warn!(
                        "[会话 {}] 提交对象大小 {} 与声明大小 {} 不符，已丢弃",
                        session.id, object.size, expected
                    );
                    if let Err(e) = self.backend.remove_object(object).await {
                        warn!("[会话 {}] 删除对象失败: {}", session.id, e);
                    }
                    return Err(UploadError::Storage(format!(
                        "对象大小 {} 与声明大小 {} 不符",
                        object.size, expected
                    )));
                }
            }
        }

        let mut state = session.state.lock();
        state.last_activity = Instant::now();
        if state.status != SessionStatus::Finalizing {
            // 提交期间被 abort
            return Err(UploadError::SessionExpired(session.id.clone()));
        }
        match commit {
            CommitStatus::Durable(object) => {
                state.status = SessionStatus::Completed;
                state.object = Some(object.clone());
                info!(
                    "[会话 {}] 上传完成: {} -> {}",
                    session.id, session.destination, object.id
                );
                Ok(FinalizeOutcome::Completed { object })
            }
            CommitStatus::Pending => {
                debug!("[会话 {}] 对象提交处理中", session.id);
                Ok(FinalizeOutcome::Processing)
            }
        }
    }

    async fn abort(&self, session_id: &str) -> Result<(), UploadError> {
        let session = self.get(session_id)?;
        {
            let mut state = session.state.lock();
            if state.status == SessionStatus::Completed {
                return Err(UploadError::InvalidState(format!(
                    "会话 {} 已完成，不能放弃",
                    session.id
                )));
            }
            if state.status == SessionStatus::Failed {
                return Ok(());
            }
            state.status = SessionStatus::Failed;
            state.last_activity = Instant::now();
        }
        info!("[会话 {}] 已放弃: {}", session.id, session.destination);
        self.discard_staging(&session).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemoryObjectStore;
    use crate::uploader::split_into_chunks;

    const MB: u64 = 1024 * 1024;

    fn store_with(backend: Arc<MemoryObjectStore>, idle: Duration) -> SessionStore {
        SessionStore::new(backend, idle)
    }

    fn init_req(total_chunks: usize, size: u64) -> SessionInit {
        SessionInit {
            destination: "kits/808/kick.wav".to_string(),
            content_type: "audio/wav".to_string(),
            total_chunks,
            expected_size: Some(size),
        }
    }

    fn payload(chunk: &ChunkDescriptor) -> Vec<u8> {
        vec![chunk.index as u8; chunk.length as usize]
    }

    #[tokio::test]
    async fn test_init_rejects_zero_chunks() {
        let store = store_with(Arc::new(MemoryObjectStore::new()), Duration::from_secs(60));
        let result = store.init(init_req(0, 10)).await;
        assert!(matches!(result, Err(UploadError::Configuration(_))));
        assert_eq!(store.session_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_acks_then_single_finalize() {
        let backend = Arc::new(MemoryObjectStore::new());
        let store = store_with(backend.clone(), Duration::from_secs(60));
        let chunks = split_into_chunks(10 * MB, 4 * MB).unwrap();
        let id = store.init(init_req(chunks.len(), 10 * MB)).await.unwrap();
        assert_eq!(store.snapshot(&id).unwrap().status, SessionStatus::Receiving);

        for index in [2, 0, 1] {
            assert!(!store.is_complete(&id).await.unwrap());
            store
                .append_chunk(&id, &chunks[index], payload(&chunks[index]))
                .await
                .unwrap();
        }
        assert!(store.is_complete(&id).await.unwrap());

        let FinalizeOutcome::Completed { object } = store.finalize(&id).await.unwrap() else {
            panic!("memory backend commits synchronously");
        };
        assert_eq!(object.size, 10 * MB);

        let data = backend.object(&object.id).unwrap();
        assert_eq!(data[0], 0);
        assert_eq!(data[(4 * MB) as usize], 1);
        assert_eq!(data[(8 * MB) as usize], 2);
        assert_eq!(backend.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_append_is_idempotent() {
        let store = store_with(Arc::new(MemoryObjectStore::new()), Duration::from_secs(60));
        let chunks = split_into_chunks(12, 4).unwrap();
        let id = store.init(init_req(3, 12)).await.unwrap();

        let first = store
            .append_chunk(&id, &chunks[1], payload(&chunks[1]))
            .await
            .unwrap();
        let second = store
            .append_chunk(&id, &chunks[1], payload(&chunks[1]))
            .await
            .unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.acked_chunks, 1);
        assert_eq!(second.acked_chunks, 1);
        assert_eq!(store.snapshot(&id).unwrap().received_bytes, 4);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_appends_count_once() {
        let store = Arc::new(store_with(
            Arc::new(MemoryObjectStore::new()),
            Duration::from_secs(60),
        ));
        let chunks = split_into_chunks(8, 4).unwrap();
        let id = store.init(init_req(2, 8)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let id = id.clone();
            let chunk = chunks[0].clone();
            handles.push(tokio::spawn(async move {
                store.append_chunk(&id, &chunk, payload(&chunk)).await
            }));
        }
        let mut fresh = 0;
        for handle in handles {
            if !handle.await.unwrap().unwrap().duplicate {
                fresh += 1;
            }
        }

        assert_eq!(fresh, 1);
        let snapshot = store.snapshot(&id).unwrap();
        assert_eq!(snapshot.acked_chunks, 1);
        assert_eq!(snapshot.received_bytes, 4);
    }

    #[tokio::test]
    async fn test_append_validation() {
        let store = store_with(Arc::new(MemoryObjectStore::new()), Duration::from_secs(60));
        let chunks = split_into_chunks(12, 4).unwrap();
        let id = store.init(init_req(3, 12)).await.unwrap();

        let outside = ChunkDescriptor::new(3, 12, 4);
        assert!(matches!(
            store.append_chunk(&id, &outside, vec![0; 4]).await,
            Err(UploadError::ChunkOutOfRange { index: 3, .. })
        ));

        assert!(matches!(
            store.append_chunk(&id, &chunks[0], vec![0; 3]).await,
            Err(UploadError::ChunkLengthMismatch { index: 0, .. })
        ));

        // 已确认的索引以不同长度重提交
        store
            .append_chunk(&id, &chunks[0], payload(&chunks[0]))
            .await
            .unwrap();
        let mut shorter = chunks[0].clone();
        shorter.length = 2;
        assert!(matches!(
            store.append_chunk(&id, &shorter, vec![0; 2]).await,
            Err(UploadError::ChunkLengthMismatch { expected: 4, actual: 2, .. })
        ));

        assert!(matches!(
            store.append_chunk("missing", &chunks[0], vec![0; 4]).await,
            Err(UploadError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_overlapping_ranges_rejected() {
        let backend = Arc::new(MemoryObjectStore::new());
        let store = store_with(backend.clone(), Duration::from_secs(60));
        let id = store.init(init_req(2, 8)).await.unwrap();

        store
            .append_chunk(&id, &ChunkDescriptor::new(0, 0, 4), vec![1; 4])
            .await
            .unwrap();

        // 不同索引占用同一偏移
        assert!(matches!(
            store
                .append_chunk(&id, &ChunkDescriptor::new(1, 0, 4), vec![2; 4])
                .await,
            Err(UploadError::ChunkOutOfRange { index: 1, .. })
        ));
        // 部分重叠
        assert!(matches!(
            store
                .append_chunk(&id, &ChunkDescriptor::new(1, 2, 4), vec![2; 4])
                .await,
            Err(UploadError::ChunkOutOfRange { index: 1, .. })
        ));

        let snapshot = store.snapshot(&id).unwrap();
        assert_eq!(snapshot.acked_chunks, 1);
        assert_eq!(snapshot.received_bytes, 4);
        assert!(matches!(
            store.finalize(&id).await,
            Err(UploadError::IncompleteUpload { acked: 1, total: 2 })
        ));

        store
            .append_chunk(&id, &ChunkDescriptor::new(1, 4, 4), vec![2; 4])
            .await
            .unwrap();
        let FinalizeOutcome::Completed { object } = store.finalize(&id).await.unwrap() else {
            panic!("expected completed");
        };
        assert_eq!(object.size, 8);
        assert_eq!(
            backend.object(&object.id).unwrap(),
            vec![1, 1, 1, 1, 2, 2, 2, 2]
        );
    }

    #[tokio::test]
    async fn test_finalize_rejects_bytes_short_of_declared_size() {
        let backend = Arc::new(MemoryObjectStore::new());
        let store = store_with(backend.clone(), Duration::from_secs(60));
        let id = store.init(init_req(2, 8)).await.unwrap();

        // 所有索引都已确认，但只覆盖了 4 字节
        store
            .append_chunk(&id, &ChunkDescriptor::new(0, 0, 2), vec![1; 2])
            .await
            .unwrap();
        store
            .append_chunk(&id, &ChunkDescriptor::new(1, 4, 2), vec![2; 2])
            .await
            .unwrap();
        assert!(store.is_complete(&id).await.unwrap());

        assert!(matches!(
            store.finalize(&id).await,
            Err(UploadError::InvalidState(_))
        ));
        assert_eq!(store.snapshot(&id).unwrap().status, SessionStatus::Failed);
        assert_eq!(backend.staging_count(), 0);
        assert_eq!(backend.commit_count(), 0);
    }

    /// 提交后上报错误大小的对象存储
    struct MisreportingStore {
        inner: Arc<MemoryObjectStore>,
    }

    #[async_trait]
    impl ObjectStore for MisreportingStore {
        async fn begin_upload(
            &self,
            name: &str,
            content_type: &str,
        ) -> Result<StagingHandle, UploadError> {
            self.inner.begin_upload(name, content_type).await
        }

        async fn append_range(
            &self,
            handle: &StagingHandle,
            offset: u64,
            bytes: &[u8],
        ) -> Result<(), UploadError> {
            self.inner.append_range(handle, offset, bytes).await
        }

        async fn commit(&self, handle: &StagingHandle) -> Result<CommitStatus, UploadError> {
            match self.inner.commit(handle).await? {
                CommitStatus::Durable(mut object) => {
                    object.size -= 1;
                    Ok(CommitStatus::Durable(object))
                }
                pending => Ok(pending),
            }
        }

        async fn discard(&self, handle: &StagingHandle) -> Result<(), UploadError> {
            self.inner.discard(handle).await
        }

        async fn remove_object(&self, object: &ObjectRef) -> Result<(), UploadError> {
            self.inner.remove_object(object).await
        }
    }

    #[tokio::test]
    async fn test_committed_size_mismatch_discards_object() {
        let inner = Arc::new(MemoryObjectStore::new());
        let store = SessionStore::new(
            Arc::new(MisreportingStore {
                inner: inner.clone(),
            }),
            Duration::from_secs(60),
        );
        let chunks = split_into_chunks(8, 4).unwrap();
        let id = store.init(init_req(2, 8)).await.unwrap();
        for chunk in &chunks {
            store.append_chunk(&id, chunk, payload(chunk)).await.unwrap();
        }

        assert!(matches!(
            store.finalize(&id).await,
            Err(UploadError::Storage(_))
        ));
        assert_eq!(store.snapshot(&id).unwrap().status, SessionStatus::Failed);
        assert_eq!(inner.commit_count(), 1);
        let snapshot = store.snapshot(&id).unwrap();
        assert!(snapshot.object.is_none());
    }

    #[tokio::test]
    async fn test_finalize_before_complete_fails() {
        let store = store_with(Arc::new(MemoryObjectStore::new()), Duration::from_secs(60));
        let chunks = split_into_chunks(12, 4).unwrap();
        let id = store.init(init_req(3, 12)).await.unwrap();
        store
            .append_chunk(&id, &chunks[0], payload(&chunks[0]))
            .await
            .unwrap();

        assert_eq!(
            store.finalize(&id).await,
            Err(UploadError::IncompleteUpload { acked: 1, total: 3 })
        );
        // 失败的 finalize 不影响继续接收
        assert_eq!(store.snapshot(&id).unwrap().status, SessionStatus::Receiving);
    }

    #[tokio::test]
    async fn test_second_finalize_returns_same_reference() {
        let backend = Arc::new(MemoryObjectStore::new());
        let store = store_with(backend.clone(), Duration::from_secs(60));
        let chunks = split_into_chunks(4, 4).unwrap();
        let id = store.init(init_req(1, 4)).await.unwrap();
        store
            .append_chunk(&id, &chunks[0], payload(&chunks[0]))
            .await
            .unwrap();

        let first = store.finalize(&id).await.unwrap();
        let second = store.finalize(&id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.commit_count(), 1);

        // 完成后不能再追加
        assert!(matches!(
            store.append_chunk(&id, &chunks[0], payload(&chunks[0])).await,
            Err(UploadError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_finalize_processing_then_completed() {
        let backend = Arc::new(MemoryObjectStore::with_pending_commits(2));
        let store = store_with(backend.clone(), Duration::from_secs(60));
        let chunks = split_into_chunks(4, 4).unwrap();
        let id = store.init(init_req(1, 4)).await.unwrap();
        store
            .append_chunk(&id, &chunks[0], payload(&chunks[0]))
            .await
            .unwrap();

        assert_eq!(store.finalize(&id).await.unwrap(), FinalizeOutcome::Processing);
        assert_eq!(store.snapshot(&id).unwrap().status, SessionStatus::Finalizing);
        assert_eq!(store.finalize(&id).await.unwrap(), FinalizeOutcome::Processing);
        assert!(matches!(
            store.finalize(&id).await.unwrap(),
            FinalizeOutcome::Completed { .. }
        ));
        assert_eq!(store.snapshot(&id).unwrap().status, SessionStatus::Completed);
        assert_eq!(backend.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_idle_session_rejects_late_append() {
        let backend = Arc::new(MemoryObjectStore::new());
        let store = store_with(backend.clone(), Duration::from_millis(30));
        let chunks = split_into_chunks(8, 4).unwrap();
        let id = store.init(init_req(2, 8)).await.unwrap();
        store
            .append_chunk(&id, &chunks[0], payload(&chunks[0]))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(
            store
                .append_chunk(&id, &chunks[1], payload(&chunks[1]))
                .await,
            Err(UploadError::SessionExpired(id.clone()))
        );
        assert_eq!(store.snapshot(&id).unwrap().status, SessionStatus::Failed);
        assert_eq!(backend.staging_count(), 0);
        assert!(matches!(
            store.finalize(&id).await,
            Err(UploadError::SessionExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_reap_expires_then_removes() {
        let backend = Arc::new(MemoryObjectStore::new());
        let store = store_with(backend.clone(), Duration::from_millis(30));
        let id = store.init(init_req(2, 8)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.reap().await, 1);
        assert_eq!(store.snapshot(&id).unwrap().status, SessionStatus::Failed);
        assert_eq!(backend.staging_count(), 0);

        // 终态会话再空闲一个周期后被移除
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.reap().await, 0);
        assert_eq!(store.session_count(), 0);
    }

    #[tokio::test]
    async fn test_abort_marks_failed() {
        let backend = Arc::new(MemoryObjectStore::new());
        let store = store_with(backend.clone(), Duration::from_secs(60));
        let chunks = split_into_chunks(8, 4).unwrap();
        let id = store.init(init_req(2, 8)).await.unwrap();

        store.abort(&id).await.unwrap();
        assert_eq!(store.snapshot(&id).unwrap().status, SessionStatus::Failed);
        assert_eq!(backend.staging_count(), 0);
        assert!(matches!(
            store.append_chunk(&id, &chunks[0], payload(&chunks[0])).await,
            Err(UploadError::SessionExpired(_))
        ));
        // 重复放弃无副作用
        store.abort(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_reaper_task_stops_on_cancel() {
        let store = Arc::new(store_with(
            Arc::new(MemoryObjectStore::new()),
            Duration::from_millis(20),
        ));
        store.init(init_req(1, 4)).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = store
            .clone()
            .spawn_reaper(Duration::from_millis(10), cancel.clone());

        tokio::time::sleep(Duration::from_millis(120)).await;
        cancel.cancel();
        handle.await.unwrap();

        // 过期后又被移除
        assert_eq!(store.session_count(), 0);
    }
}
