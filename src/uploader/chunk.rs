// 上传分片管理
//
// 分片规则：
// - 按固定分片大小切分，偏移连续覆盖 [0, 文件大小)
// - 最后一个分片可以小于分片大小
// - 空文件和分片大小为 0 直接报错，不做任何 I/O

use crate::error::UploadError;
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// 默认分片大小: 4MB
pub const DEFAULT_UPLOAD_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// 分片状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkStatus {
    /// 等待上传
    Pending,
    /// 上传中
    InFlight,
    /// 服务端已确认
    Acked,
    /// 重试耗尽
    Failed,
}

/// 分片描述
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// 分片索引（从 0 开始）
    pub index: usize,
    /// 字节偏移
    pub offset: u64,
    /// 字节长度
    pub length: u64,
    /// 分片状态
    pub status: ChunkStatus,
}

impl ChunkDescriptor {
    pub fn new(index: usize, offset: u64, length: u64) -> Self {
        Self {
            index,
            offset,
            length,
            status: ChunkStatus::Pending,
        }
    }

    /// 结束偏移（不含）
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// 切分文件
///
/// 生成 ceil(S/C) 个分片，除最后一个外大小均为 C
///
/// # 参数
/// * `file_size` - 文件大小 S
/// * `chunk_size` - 分片大小 C
pub fn split_into_chunks(
    file_size: u64,
    chunk_size: u64,
) -> Result<Vec<ChunkDescriptor>, UploadError> {
    if chunk_size == 0 {
        return Err(UploadError::Configuration(
            "分片大小必须大于 0".to_string(),
        ));
    }
    if file_size == 0 {
        return Err(UploadError::EmptyFile);
    }

    let count = file_size.div_ceil(chunk_size) as usize;
    let chunks: Vec<ChunkDescriptor> = (0..count)
        .map(|index| {
            let offset = index as u64 * chunk_size;
            let length = chunk_size.min(file_size - offset);
            ChunkDescriptor::new(index, offset, length)
        })
        .collect();

    debug!(
        "切分文件: 大小={} bytes, 分片大小={} bytes, 分片数量={}",
        file_size,
        chunk_size,
        chunks.len()
    );

    Ok(chunks)
}

/// 分片表
///
/// 调度器在锁内使用，保证同一分片不会被两个 worker 取走
#[derive(Debug, Clone)]
pub struct ChunkTable {
    chunks: Vec<ChunkDescriptor>,
}

impl ChunkTable {
    pub fn new(chunks: Vec<ChunkDescriptor>) -> Self {
        Self { chunks }
    }

    /// 取出下一个待上传分片并标记为上传中
    pub fn next_pending(&mut self) -> Option<ChunkDescriptor> {
        let chunk = self
            .chunks
            .iter_mut()
            .find(|c| c.status == ChunkStatus::Pending)?;
        chunk.status = ChunkStatus::InFlight;
        Some(chunk.clone())
    }

    pub fn mark_acked(&mut self, index: usize) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.status = ChunkStatus::Acked;
        }
    }

    pub fn mark_failed(&mut self, index: usize) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.status = ChunkStatus::Failed;
        }
    }

    /// 取消时把还没开始的分片留在 Pending，上传中的回退为 Pending
    pub fn release_in_flight(&mut self) {
        for chunk in &mut self.chunks {
            if chunk.status == ChunkStatus::InFlight {
                chunk.status = ChunkStatus::Pending;
            }
        }
    }

    pub fn chunks(&self) -> &[ChunkDescriptor] {
        &self.chunks
    }

    pub fn into_chunks(self) -> Vec<ChunkDescriptor> {
        self.chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn acked_count(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Acked)
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Pending)
            .count()
    }

    pub fn is_all_acked(&self) -> bool {
        self.chunks.iter().all(|c| c.status == ChunkStatus::Acked)
    }
}

/// 上传数据来源
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// 本地文件
    File(PathBuf),
    /// 内存数据
    Memory(Arc<Vec<u8>>),
}

impl UploadSource {
    /// 读取分片数据
    ///
    /// 文件读取在阻塞线程池中执行，只读取分片本身，不会加载整个文件
    pub async fn read_chunk(&self, chunk: &ChunkDescriptor) -> Result<Vec<u8>, UploadError> {
        match self {
            UploadSource::Memory(data) => {
                let start = chunk.offset as usize;
                let end = chunk.end() as usize;
                data.get(start..end).map(<[u8]>::to_vec).ok_or_else(|| {
                    UploadError::Io(format!(
                        "分片 #{} 超出数据范围: {}-{}, 数据长度={}",
                        chunk.index,
                        start,
                        end,
                        data.len()
                    ))
                })
            }
            UploadSource::File(path) => {
                let path = path.clone();
                let start = chunk.offset;
                let size = chunk.length as usize;
                let index = chunk.index;

                tokio::task::spawn_blocking(move || {
                    let mut file = std::fs::File::open(&path)
                        .map_err(|e| UploadError::Io(format!("无法打开文件 {:?}: {}", path, e)))?;
                    file.seek(SeekFrom::Start(start))?;

                    let mut buffer = vec![0u8; size];
                    file.read_exact(&mut buffer)?;

                    debug!(
                        "读取分片 #{}: bytes={}-{}, 大小={} bytes",
                        index,
                        start,
                        start + size as u64 - 1,
                        size
                    );
                    Ok::<_, UploadError>(buffer)
                })
                .await
                .map_err(|e| UploadError::Io(format!("读取任务异常: {}", e)))?
            }
        }
    }

    /// 数据总大小
    pub async fn size(&self) -> Result<u64, UploadError> {
        match self {
            UploadSource::Memory(data) => Ok(data.len() as u64),
            UploadSource::File(path) => {
                let meta = tokio::fs::metadata(path).await?;
                info!("读取文件大小: {:?} = {} bytes", path, meta.len());
                Ok(meta.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_ten_mb_with_four_mb_chunks() {
        let chunks = split_into_chunks(10 * MB, 4 * MB).unwrap();
        let sizes: Vec<u64> = chunks.iter().map(|c| c.length).collect();
        assert_eq!(sizes, vec![4 * MB, 4 * MB, 2 * MB]);
        assert_eq!(chunks[2].offset, 8 * MB);
        assert!(chunks.iter().all(|c| c.status == ChunkStatus::Pending));
    }

    #[test]
    fn test_exact_multiple_and_small_file() {
        let chunks = split_into_chunks(16 * MB, 4 * MB).unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[3].length, 4 * MB);

        let chunks = split_into_chunks(1000, 4 * MB).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].length, 1000);
    }

    #[test]
    fn test_split_errors() {
        assert_eq!(split_into_chunks(0, 4 * MB), Err(UploadError::EmptyFile));
        assert!(matches!(
            split_into_chunks(100, 0),
            Err(UploadError::Configuration(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_chunks_cover_file_contiguously(size in 1u64..1_000_000, chunk in 256u64..2_000_000) {
            let chunks = split_into_chunks(size, chunk).unwrap();

            prop_assert_eq!(chunks.len() as u64, size.div_ceil(chunk));
            prop_assert_eq!(chunks.iter().map(|c| c.length).sum::<u64>(), size);

            let mut expected_offset = 0;
            for (i, c) in chunks.iter().enumerate() {
                prop_assert_eq!(c.index, i);
                prop_assert_eq!(c.offset, expected_offset);
                prop_assert!(c.length > 0 && c.length <= chunk);
                if i + 1 < chunks.len() {
                    prop_assert_eq!(c.length, chunk);
                }
                expected_offset = c.end();
            }
        }
    }

    #[test]
    fn test_table_next_pending_marks_in_flight() {
        let mut table = ChunkTable::new(split_into_chunks(10, 4).unwrap());

        let first = table.next_pending().unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(table.chunks()[0].status, ChunkStatus::InFlight);

        let second = table.next_pending().unwrap();
        assert_eq!(second.index, 1);

        table.mark_acked(0);
        table.mark_failed(1);
        assert_eq!(table.acked_count(), 1);
        assert_eq!(table.pending_count(), 1);
        assert!(!table.is_all_acked());
    }

    #[test]
    fn test_table_skips_acked_chunks() {
        let mut chunks = split_into_chunks(12, 4).unwrap();
        chunks[0].status = ChunkStatus::Acked;
        chunks[2].status = ChunkStatus::Acked;
        let mut table = ChunkTable::new(chunks);

        assert_eq!(table.next_pending().map(|c| c.index), Some(1));
        assert!(table.next_pending().is_none());

        table.release_in_flight();
        assert_eq!(table.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_read_chunk_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..10u8).collect();
        file.write_all(&data).unwrap();

        let source = UploadSource::File(file.path().to_path_buf());
        let chunks = split_into_chunks(10, 4).unwrap();

        assert_eq!(source.size().await.unwrap(), 10);
        assert_eq!(source.read_chunk(&chunks[1]).await.unwrap(), vec![4, 5, 6, 7]);
        assert_eq!(source.read_chunk(&chunks[2]).await.unwrap(), vec![8, 9]);
    }

    #[tokio::test]
    async fn test_read_chunk_from_memory() {
        let source = UploadSource::Memory(Arc::new(b"abcdefghij".to_vec()));
        let chunks = split_into_chunks(10, 4).unwrap();
        assert_eq!(source.read_chunk(&chunks[0]).await.unwrap(), b"abcd".to_vec());

        let beyond = ChunkDescriptor::new(5, 20, 4);
        assert!(matches!(
            source.read_chunk(&beyond).await,
            Err(UploadError::Io(_))
        ));
    }
}
