// 对象存储适配层
//
// 会话只依赖 begin / append / commit / discard 四个操作：
// - MemoryObjectStore: 内存暂存，可模拟异步提交（前 N 次 commit 返回 Pending）
// - LocalObjectStore: 本地文件暂存，按偏移定位写入，提交时重命名到对象目录

use crate::error::UploadError;
use crate::session::ObjectRef;
use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 暂存句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingHandle {
    pub id: String,
    pub name: String,
    pub content_type: String,
}

/// 提交结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitStatus {
    /// 已持久化
    Durable(ObjectRef),
    /// 后端异步处理中
    Pending,
}

/// 远程对象存储协议
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn begin_upload(
        &self,
        name: &str,
        content_type: &str,
    ) -> Result<StagingHandle, UploadError>;

    /// 按偏移写入一段数据，同一偏移重复写入覆盖原数据
    async fn append_range(
        &self,
        handle: &StagingHandle,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), UploadError>;

    async fn commit(&self, handle: &StagingHandle) -> Result<CommitStatus, UploadError>;

    /// 丢弃暂存数据（句柄不存在时视为成功）
    async fn discard(&self, handle: &StagingHandle) -> Result<(), UploadError>;

    /// 删除已提交对象（不存在时视为成功）
    async fn remove_object(&self, object: &ObjectRef) -> Result<(), UploadError>;
}

// =====================================================
// 内存对象存储
// =====================================================

#[derive(Debug)]
struct MemoryStaging {
    handle: StagingHandle,
    ranges: BTreeMap<u64, Vec<u8>>,
    commit_attempts: u32,
}

/// 内存对象存储
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    staging: DashMap<String, MemoryStaging>,
    objects: DashMap<String, Vec<u8>>,
    /// 每个句柄前 N 次 commit 返回 Pending
    pending_commits: u32,
    /// 实际组装对象的次数
    commits: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟异步提交：每个句柄前 `polls` 次 commit 返回 Pending
    pub fn with_pending_commits(polls: u32) -> Self {
        Self {
            pending_commits: polls,
            ..Self::default()
        }
    }

    /// 读取已提交对象
    pub fn object(&self, id: &str) -> Option<Vec<u8>> {
        self.objects.get(id).map(|o| o.value().clone())
    }

    pub fn staging_count(&self) -> usize {
        self.staging.len()
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn begin_upload(
        &self,
        name: &str,
        content_type: &str,
    ) -> Result<StagingHandle, UploadError> {
        let handle = StagingHandle {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            content_type: content_type.to_string(),
        };
        self.staging.insert(
            handle.id.clone(),
            MemoryStaging {
                handle: handle.clone(),
                ranges: BTreeMap::new(),
                commit_attempts: 0,
            },
        );
        Ok(handle)
    }

    async fn append_range(
        &self,
        handle: &StagingHandle,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), UploadError> {
        let mut staging = self
            .staging
            .get_mut(&handle.id)
            .ok_or_else(|| UploadError::Storage(format!("暂存句柄不存在: {}", handle.id)))?;
        staging.ranges.insert(offset, bytes.to_vec());
        Ok(())
    }

    async fn commit(&self, handle: &StagingHandle) -> Result<CommitStatus, UploadError> {
        let data = {
            let mut staging = self
                .staging
                .get_mut(&handle.id)
                .ok_or_else(|| UploadError::Storage(format!("暂存句柄不存在: {}", handle.id)))?;
            if staging.commit_attempts < self.pending_commits {
                staging.commit_attempts += 1;
                debug!(
                    "对象提交处理中: {} ({}/{})",
                    handle.name, staging.commit_attempts, self.pending_commits
                );
                return Ok(CommitStatus::Pending);
            }

            // 校验各段连续，失败时保留暂存数据
            let mut data = Vec::new();
            for (offset, bytes) in staging.ranges.iter() {
                if *offset != data.len() as u64 {
                    return Err(UploadError::Storage(format!(
                        "暂存数据不连续: 期望偏移 {}, 实际 {}",
                        data.len(),
                        offset
                    )));
                }
                data.extend_from_slice(bytes);
            }
            data
        };

        let (_, staging) = self
            .staging
            .remove(&handle.id)
            .ok_or_else(|| UploadError::Storage(format!("暂存句柄不存在: {}", handle.id)))?;

        let object = ObjectRef {
            id: Uuid::new_v4().to_string(),
            name: staging.handle.name,
            size: data.len() as u64,
            etag: hex::encode(Sha256::digest(&data)),
        };
        self.objects.insert(object.id.clone(), data);
        self.commits.fetch_add(1, Ordering::SeqCst);

        info!("对象已提交: {} -> {} ({} bytes)", object.name, object.id, object.size);
        Ok(CommitStatus::Durable(object))
    }

    async fn discard(&self, handle: &StagingHandle) -> Result<(), UploadError> {
        if self.staging.remove(&handle.id).is_some() {
            debug!("已丢弃暂存数据: {}", handle.name);
        }
        Ok(())
    }

    async fn remove_object(&self, object: &ObjectRef) -> Result<(), UploadError> {
        if self.objects.remove(&object.id).is_some() {
            debug!("已删除对象: {} ({})", object.name, object.id);
        }
        Ok(())
    }
}

// =====================================================
// 本地文件对象存储
// =====================================================

/// 本地文件对象存储
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    staging_dir: PathBuf,
    object_dir: PathBuf,
}

impl LocalObjectStore {
    /// 创建并确保目录存在
    pub async fn new(
        staging_dir: impl Into<PathBuf>,
        object_dir: impl Into<PathBuf>,
    ) -> Result<Self, UploadError> {
        let store = Self {
            staging_dir: staging_dir.into(),
            object_dir: object_dir.into(),
        };
        fs::create_dir_all(&store.staging_dir).await?;
        fs::create_dir_all(&store.object_dir).await?;
        Ok(store)
    }

    fn staging_path(&self, handle: &StagingHandle) -> PathBuf {
        self.staging_dir.join(format!("{}.part", handle.id))
    }

    /// 已提交对象路径
    pub fn object_path(&self, object_id: &str) -> PathBuf {
        self.object_dir.join(object_id)
    }
}

fn storage_err(context: &str, e: std::io::Error) -> UploadError {
    UploadError::Storage(format!("{}: {}", context, e))
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn begin_upload(
        &self,
        name: &str,
        content_type: &str,
    ) -> Result<StagingHandle, UploadError> {
        let handle = StagingHandle {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            content_type: content_type.to_string(),
        };
        fs::File::create(self.staging_path(&handle))
            .await
            .map_err(|e| storage_err("创建暂存文件失败", e))?;
        debug!("创建暂存文件: {} -> {:?}", name, self.staging_path(&handle));
        Ok(handle)
    }

    async fn append_range(
        &self,
        handle: &StagingHandle,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), UploadError> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(self.staging_path(handle))
            .await
            .map_err(|e| storage_err("打开暂存文件失败", e))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| storage_err("暂存文件定位失败", e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| storage_err("写入暂存文件失败", e))?;
        file.flush()
            .await
            .map_err(|e| storage_err("刷新暂存文件失败", e))?;
        Ok(())
    }

    async fn commit(&self, handle: &StagingHandle) -> Result<CommitStatus, UploadError> {
        let staging_path = self.staging_path(handle);
        let mut file = fs::File::open(&staging_path)
            .await
            .map_err(|e| storage_err("打开暂存文件失败", e))?;

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let n = file
                .read(&mut buffer)
                .await
                .map_err(|e| storage_err("读取暂存文件失败", e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            size += n as u64;
        }
        drop(file);

        let object = ObjectRef {
            id: Uuid::new_v4().to_string(),
            name: handle.name.clone(),
            size,
            etag: hex::encode(hasher.finalize()),
        };
        fs::rename(&staging_path, self.object_path(&object.id))
            .await
            .map_err(|e| storage_err("移动对象文件失败", e))?;

        info!("对象已提交: {} -> {} ({} bytes)", object.name, object.id, object.size);
        Ok(CommitStatus::Durable(object))
    }

    async fn discard(&self, handle: &StagingHandle) -> Result<(), UploadError> {
        match fs::remove_file(self.staging_path(handle)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("删除暂存文件失败: {}: {}", handle.name, e);
                Err(storage_err("删除暂存文件失败", e))
            }
        }
    }

    async fn remove_object(&self, object: &ObjectRef) -> Result<(), UploadError> {
        match fs::remove_file(self.object_path(&object.id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err("删除对象文件失败", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_store_assembles_out_of_order_ranges() {
        let store = MemoryObjectStore::new();
        let handle = store.begin_upload("kit/kick.wav", "audio/wav").await.unwrap();

        store.append_range(&handle, 8, b"ij").await.unwrap();
        store.append_range(&handle, 0, b"abcd").await.unwrap();
        store.append_range(&handle, 4, b"efgh").await.unwrap();

        let CommitStatus::Durable(object) = store.commit(&handle).await.unwrap() else {
            panic!("expected durable commit");
        };
        assert_eq!(object.size, 10);
        assert_eq!(object.name, "kit/kick.wav");
        assert_eq!(store.object(&object.id).unwrap(), b"abcdefghij".to_vec());
        assert_eq!(object.etag, hex::encode(Sha256::digest(b"abcdefghij")));
        assert_eq!(store.staging_count(), 0);
    }

    #[tokio::test]
    async fn test_memory_store_detects_gap() {
        let store = MemoryObjectStore::new();
        let handle = store.begin_upload("gap.bin", "application/octet-stream").await.unwrap();
        store.append_range(&handle, 0, b"ab").await.unwrap();
        store.append_range(&handle, 4, b"ef").await.unwrap();

        assert!(matches!(
            store.commit(&handle).await,
            Err(UploadError::Storage(_))
        ));
        assert_eq!(store.staging_count(), 1);

        // 补齐空洞后可以重新提交
        store.append_range(&handle, 2, b"cd").await.unwrap();
        let CommitStatus::Durable(object) = store.commit(&handle).await.unwrap() else {
            panic!("expected durable commit");
        };
        assert_eq!(store.object(&object.id).unwrap(), b"abcdef".to_vec());
        assert_eq!(store.staging_count(), 0);

        store.remove_object(&object).await.unwrap();
        assert!(store.object(&object.id).is_none());
    }

    #[tokio::test]
    async fn test_memory_store_pending_commits() {
        let store = MemoryObjectStore::with_pending_commits(2);
        let handle = store.begin_upload("slow.wav", "audio/wav").await.unwrap();
        store.append_range(&handle, 0, b"x").await.unwrap();

        assert_eq!(store.commit(&handle).await.unwrap(), CommitStatus::Pending);
        assert_eq!(store.commit(&handle).await.unwrap(), CommitStatus::Pending);
        assert!(matches!(
            store.commit(&handle).await.unwrap(),
            CommitStatus::Durable(_)
        ));
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_local_store_positional_writes() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path().join("staging"), dir.path().join("objects"))
            .await
            .unwrap();
        let handle = store.begin_upload("loop.wav", "audio/wav").await.unwrap();

        store.append_range(&handle, 6, b"world").await.unwrap();
        store.append_range(&handle, 0, b"hello ").await.unwrap();

        let CommitStatus::Durable(object) = store.commit(&handle).await.unwrap() else {
            panic!("local commits are synchronous");
        };
        assert_eq!(object.size, 11);
        let content = std::fs::read(store.object_path(&object.id)).unwrap();
        assert_eq!(content, b"hello world".to_vec());
        assert_eq!(object.etag, hex::encode(Sha256::digest(b"hello world")));
    }

    #[tokio::test]
    async fn test_local_store_discard() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path().join("staging"), dir.path().join("objects"))
            .await
            .unwrap();
        let handle = store.begin_upload("drop.wav", "audio/wav").await.unwrap();
        store.append_range(&handle, 0, b"data").await.unwrap();

        store.discard(&handle).await.unwrap();
        assert!(!store.staging_path(&handle).exists());
        // 重复丢弃视为成功
        store.discard(&handle).await.unwrap();
    }
}
