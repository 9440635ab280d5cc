// 任务进度聚合
//
// 百分比按固定阶段预算分配：
// - 准备阶段 [0, pre_phase_end)：创建目录提交记录
// - 上传阶段 [pre_phase_end, upload_phase_end)：主文件平分，每个文件按自身分片完成比例计入
// - 收尾阶段 [upload_phase_end, 100]：预览文件平分
//
// 对外发出的百分比取 max(本次计算值, 上次发出值)，保证单调不减

use crate::config::ProgressConfig;
use crate::uploader::FileRole;
use bit_set::BitSet;
use std::collections::HashMap;

/// 单个文件的进度
#[derive(Debug, Clone)]
struct FileProgress {
    role: FileRole,
    total_chunks: usize,
    acked: BitSet,
    /// 服务端已确认提交
    done: bool,
}

impl FileProgress {
    fn fraction(&self) -> f64 {
        if self.done {
            return 1.0;
        }
        if self.total_chunks == 0 {
            return 0.0;
        }
        (self.acked.len() as f64 / self.total_chunks as f64).min(1.0)
    }
}

/// 任务进度聚合器
///
/// 只在编排器的控制流中修改，不需要加锁
#[derive(Debug, Clone)]
pub struct ProgressAggregator {
    config: ProgressConfig,
    files: HashMap<String, FileProgress>,
    primary_count: usize,
    preview_count: usize,
    pre_phase_done: bool,
    finished: bool,
    last_emitted: f64,
}

impl ProgressAggregator {
    pub fn new(config: ProgressConfig) -> Self {
        Self {
            config,
            files: HashMap::new(),
            primary_count: 0,
            preview_count: 0,
            pre_phase_done: false,
            finished: false,
            last_emitted: 0.0,
        }
    }

    /// 登记文件（分片数可稍后通过 set_chunk_count 设置）
    pub fn add_file(&mut self, file_id: impl Into<String>, role: FileRole) {
        let file_id = file_id.into();
        if self.files.contains_key(&file_id) {
            return;
        }
        match role {
            FileRole::Primary => self.primary_count += 1,
            FileRole::Preview => self.preview_count += 1,
        }
        self.files.insert(
            file_id,
            FileProgress {
                role,
                total_chunks: 0,
                acked: BitSet::new(),
                done: false,
            },
        );
    }

    pub fn set_chunk_count(&mut self, file_id: &str, total_chunks: usize) {
        if let Some(file) = self.files.get_mut(file_id) {
            file.total_chunks = total_chunks;
        }
    }

    /// 准备阶段完成
    pub fn complete_pre_phase(&mut self) -> f64 {
        self.pre_phase_done = true;
        self.emit()
    }

    /// 记录一个分片确认（重复确认和乱序确认都是安全的）
    pub fn record_chunk(&mut self, file_id: &str, index: usize) -> f64 {
        if let Some(file) = self.files.get_mut(file_id) {
            if index < file.total_chunks {
                file.acked.insert(index);
            }
        }
        self.emit()
    }

    /// 文件已提交，计为完成
    pub fn complete_file(&mut self, file_id: &str) -> f64 {
        if let Some(file) = self.files.get_mut(file_id) {
            file.done = true;
        }
        self.emit()
    }

    /// 任务结束，进度置为 100
    pub fn finish(&mut self) -> f64 {
        self.finished = true;
        self.emit()
    }

    /// 文件的 (已确认分片数, 总分片数)
    pub fn file_counts(&self, file_id: &str) -> (usize, usize) {
        self.files
            .get(file_id)
            .map(|f| (f.acked.len(), f.total_chunks))
            .unwrap_or((0, 0))
    }

    /// 文件完成比例 (0.0 - 1.0)
    pub fn file_fraction(&self, file_id: &str) -> f64 {
        self.files.get(file_id).map(FileProgress::fraction).unwrap_or(0.0)
    }

    /// 最近一次发出的百分比
    pub fn percentage(&self) -> f64 {
        self.last_emitted
    }

    fn emit(&mut self) -> f64 {
        let computed = self.compute();
        if computed > self.last_emitted {
            self.last_emitted = computed;
        }
        self.last_emitted
    }

    fn compute(&self) -> f64 {
        if self.finished {
            return 100.0;
        }

        let pre = if self.pre_phase_done {
            self.config.pre_phase_end
        } else {
            0.0
        };

        let upload_budget = self.config.upload_phase_end - self.config.pre_phase_end;
        let upload = upload_budget * self.average_fraction(FileRole::Primary, self.primary_count);

        let post_budget = 100.0 - self.config.upload_phase_end;
        let post = post_budget * self.average_fraction(FileRole::Preview, self.preview_count);

        (pre + upload + post).clamp(0.0, 100.0)
    }

    fn average_fraction(&self, role: FileRole, count: usize) -> f64 {
        if count == 0 {
            return 0.0;
        }
        let sum: f64 = self
            .files
            .values()
            .filter(|f| f.role == role)
            .map(FileProgress::fraction)
            .sum();
        sum / count as f64
    }
}
