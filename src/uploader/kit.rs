//! 音色包文件夹扫描
//!
//! 负责:
//! - 递归扫描本地音色包文件夹
//! - 按扩展名识别内容类型，未知类型默认跳过
//! - 文件名以 preview / demo 结尾的识别为预览文件（收尾阶段上传）
//! - 生成上传任务，目标名保留目录结构

use crate::uploader::UploadTask;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 扫描到的文件
#[derive(Debug, Clone)]
pub struct KitFile {
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 相对于音色包根目录的路径
    pub relative_path: PathBuf,
    /// 文件大小（字节）
    pub size: u64,
    /// 内容类型
    pub content_type: String,
    /// 是否为预览文件
    pub is_preview: bool,
}

/// 扫描配置
#[derive(Debug, Clone)]
pub struct KitScanOptions {
    /// 跳过隐藏文件（以.开头的文件和文件夹）
    pub skip_hidden: bool,
    /// 最大文件大小（字节），超过的文件跳过
    pub max_file_size: Option<u64>,
    /// 最大文件数量，达到后停止扫描
    pub max_files: Option<usize>,
    /// 是否包含无法识别类型的文件（按 application/octet-stream 上传）
    pub include_unknown: bool,
}

impl Default for KitScanOptions {
    fn default() -> Self {
        Self {
            skip_hidden: true,
            max_file_size: None,
            max_files: None,
            include_unknown: false,
        }
    }
}

/// 根据扩展名推断内容类型
pub fn content_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let content_type = match ext.as_str() {
        "wav" => "audio/wav",
        "aif" | "aiff" => "audio/aiff",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "ogg" => "audio/ogg",
        "mid" | "midi" => "audio/midi",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        _ => return None,
    };
    Some(content_type)
}

/// 文件名（不含扩展名）以 preview 或 demo 结尾
pub fn is_preview_asset(path: &Path) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| {
            let stem = s.to_ascii_lowercase();
            stem.ends_with("preview") || stem.ends_with("demo")
        })
        .unwrap_or(false)
}

/// 音色包扫描器
#[derive(Debug, Clone, Default)]
pub struct KitScanner {
    options: KitScanOptions,
}

impl KitScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: KitScanOptions) -> Self {
        Self { options }
    }

    /// 递归扫描音色包
    ///
    /// 返回按相对路径排序的文件列表
    pub fn scan<P: AsRef<Path>>(&self, root_path: P) -> Result<Vec<KitFile>> {
        let root_path = root_path.as_ref();

        if !root_path.exists() {
            anyhow::bail!("音色包路径不存在: {}", root_path.display());
        }
        if !root_path.is_dir() {
            anyhow::bail!("音色包路径不是文件夹: {}", root_path.display());
        }

        info!("开始扫描音色包: {}", root_path.display());

        let mut files = Vec::new();
        self.scan_recursive(root_path, root_path, &mut files)?;
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        let previews = files.iter().filter(|f| f.is_preview).count();
        info!(
            "音色包扫描完成: {} 个文件（预览 {} 个），总大小 {}",
            files.len(),
            previews,
            format_bytes(files.iter().map(|f| f.size).sum())
        );

        Ok(files)
    }

    fn limit_reached(&self, files: &[KitFile]) -> bool {
        self.options
            .max_files
            .map(|max| files.len() >= max)
            .unwrap_or(false)
    }

    fn scan_recursive(
        &self,
        root_path: &Path,
        current_path: &Path,
        files: &mut Vec<KitFile>,
    ) -> Result<()> {
        if self.limit_reached(files) {
            warn!("已达到最大文件数量限制, 停止扫描");
            return Ok(());
        }

        let mut entries: Vec<_> = std::fs::read_dir(current_path)
            .with_context(|| format!("读取目录失败: {}", current_path.display()))?
            .collect::<std::io::Result<_>>()
            .with_context(|| format!("读取目录条目失败: {}", current_path.display()))?;
        // 保证 max_files 截断结果稳定
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();

            if self.options.skip_hidden
                && entry
                    .file_name()
                    .to_str()
                    .map(|n| n.starts_with('.'))
                    .unwrap_or(false)
            {
                debug!("跳过隐藏文件: {}", path.display());
                continue;
            }

            let metadata = std::fs::symlink_metadata(&path)
                .with_context(|| format!("读取文件元数据失败: {}", path.display()))?;

            if metadata.is_dir() {
                self.scan_recursive(root_path, &path, files)?;
            } else if metadata.is_file() {
                let size = metadata.len();
                if let Some(max_size) = self.options.max_file_size {
                    if size > max_size {
                        warn!("跳过超大文件: {} ({})", path.display(), format_bytes(size));
                        continue;
                    }
                }

                let content_type = match content_type_for(&path) {
                    Some(ct) => ct.to_string(),
                    None if self.options.include_unknown => {
                        "application/octet-stream".to_string()
                    }
                    None => {
                        debug!("跳过未知类型文件: {}", path.display());
                        continue;
                    }
                };

                let relative_path = path
                    .strip_prefix(root_path)
                    .with_context(|| {
                        format!(
                            "计算相对路径失败: {} (root: {})",
                            path.display(),
                            root_path.display()
                        )
                    })?
                    .to_path_buf();

                debug!(
                    "扫描到文件: {} ({}, {})",
                    relative_path.display(),
                    content_type,
                    format_bytes(size)
                );

                files.push(KitFile {
                    is_preview: is_preview_asset(&path),
                    local_path: path,
                    relative_path,
                    size,
                    content_type,
                });
            } else {
                debug!("跳过非常规文件: {}", path.display());
            }

            if self.limit_reached(files) {
                return Ok(());
            }
        }

        Ok(())
    }

    /// 把扫描结果转换成上传任务
    ///
    /// 目标名为 `<kit_name>/<相对路径>`，路径分隔符统一为 `/`
    pub fn into_tasks(kit_name: &str, files: Vec<KitFile>) -> Vec<UploadTask> {
        files
            .into_iter()
            .map(|file| {
                let relative = file
                    .relative_path
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                let destination = format!("{}/{}", kit_name.trim_end_matches('/'), relative);
                let task =
                    UploadTask::from_file(destination, file.content_type, file.local_path, file.size);
                if file.is_preview {
                    task.as_preview()
                } else {
                    task
                }
            })
            .collect()
    }
}

/// 格式化字节大小
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
