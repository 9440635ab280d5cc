// 目录服务（外部协作方）
//
// 上传完成后把对象引用和元数据写入商品目录。
// 目录写入有自己的成败，失败不会回滚已提交的对象。

use crate::error::UploadError;
use crate::session::ObjectRef;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::info;
use uuid::Uuid;

/// 目录条目
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogEntry {
    /// 展示名称
    pub name: String,
    /// 文件大小
    pub size: u64,
    /// 内容类型
    pub content_type: String,
    /// 已提交对象（只有拿到持久引用后才会写入）
    pub object: ObjectRef,
}

/// 目录服务
#[async_trait]
pub trait CatalogService: Send + Sync {
    /// 创建一次提交（准备阶段）
    async fn create_submission(&self, title: &str) -> Result<String, UploadError>;

    /// 记录一个已提交对象，返回记录 ID
    async fn record_object(
        &self,
        submission_id: &str,
        entry: CatalogEntry,
    ) -> Result<String, UploadError>;
}

/// 内存目录
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    submissions: DashMap<String, String>,
    records: DashMap<String, (String, CatalogEntry)>,
    /// 接下来 N 次 record_object 调用返回错误
    fail_records: AtomicU32,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_records(&self, count: u32) {
        self.fail_records.store(count, Ordering::SeqCst);
    }

    pub fn submission_title(&self, submission_id: &str) -> Option<String> {
        self.submissions.get(submission_id).map(|t| t.value().clone())
    }

    /// 某次提交下的全部条目
    pub fn entries(&self, submission_id: &str) -> Vec<CatalogEntry> {
        let mut entries: Vec<CatalogEntry> = self
            .records
            .iter()
            .filter(|r| r.value().0 == submission_id)
            .map(|r| r.value().1.clone())
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

#[async_trait]
impl CatalogService for MemoryCatalog {
    async fn create_submission(&self, title: &str) -> Result<String, UploadError> {
        let id = Uuid::new_v4().to_string();
        self.submissions.insert(id.clone(), title.to_string());
        info!("创建目录提交: id={}, title={}", id, title);
        Ok(id)
    }

    async fn record_object(
        &self,
        submission_id: &str,
        entry: CatalogEntry,
    ) -> Result<String, UploadError> {
        let should_fail = self
            .fail_records
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(UploadError::Storage("目录写入失败".to_string()));
        }

        if !self.submissions.contains_key(submission_id) {
            return Err(UploadError::InvalidState(format!(
                "目录提交不存在: {}",
                submission_id
            )));
        }

        let id = Uuid::new_v4().to_string();
        info!(
            "目录记录: submission={}, name={}, object={}",
            submission_id, entry.name, entry.object.id
        );
        self.records
            .insert(id.clone(), (submission_id.to_string(), entry));
        Ok(id)
    }
}
