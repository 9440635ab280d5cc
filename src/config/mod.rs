// 配置管理模块

use crate::error::UploadError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置（客户端）
    #[serde(default)]
    pub upload: UploadConfig,
    /// 会话配置（服务端）
    #[serde(default)]
    pub session: SessionConfig,
    /// 进度阶段配置
    #[serde(default)]
    pub progress: ProgressConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 分片大小 (MB)
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,
    /// 单文件最大并发分片数
    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,
    /// 同时上传的文件数（1 表示逐个上传）
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,
    /// 单个分片最大尝试次数（含首次）
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 初始退避延迟（毫秒），每次失败翻倍
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    /// 最大退避延迟（毫秒）
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// 单次分片请求超时（秒）
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    /// finalize 返回处理中时的轮询间隔（毫秒）
    #[serde(default = "default_finalize_poll_interval_ms")]
    pub finalize_poll_interval_ms: u64,
    /// finalize 最大轮询次数
    #[serde(default = "default_max_finalize_polls")]
    pub max_finalize_polls: u32,
}

fn default_chunk_size_mb() -> u64 {
    4
}
fn default_max_concurrent_chunks() -> usize {
    3
}
fn default_max_concurrent_files() -> usize {
    1
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_attempt_timeout_secs() -> u64 {
    60
}
fn default_finalize_poll_interval_ms() -> u64 {
    1000
}
fn default_max_finalize_polls() -> u32 {
    60
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size_mb: default_chunk_size_mb(),
            max_concurrent_chunks: default_max_concurrent_chunks(),
            max_concurrent_files: default_max_concurrent_files(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            finalize_poll_interval_ms: default_finalize_poll_interval_ms(),
            max_finalize_polls: default_max_finalize_polls(),
        }
    }
}

impl UploadConfig {
    /// 分片大小（字节）
    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_mb * 1024 * 1024
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn finalize_poll_interval(&self) -> Duration {
        Duration::from_millis(self.finalize_poll_interval_ms)
    }

    /// 校验上传参数
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.chunk_size_mb == 0 {
            return Err(UploadError::Configuration(
                "chunk_size_mb 必须大于 0".to_string(),
            ));
        }
        if self.max_concurrent_chunks == 0 {
            return Err(UploadError::Configuration(
                "max_concurrent_chunks 必须大于 0".to_string(),
            ));
        }
        if self.max_concurrent_files == 0 {
            return Err(UploadError::Configuration(
                "max_concurrent_files 必须大于 0".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(UploadError::Configuration(
                "max_attempts 必须大于 0".to_string(),
            ));
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(UploadError::Configuration(format!(
                "max_backoff_ms ({}) 不能小于 base_backoff_ms ({})",
                self.max_backoff_ms, self.base_backoff_ms
            )));
        }
        Ok(())
    }
}

/// 会话配置（服务端）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// 会话空闲超时（秒），超时后会话失败并丢弃暂存数据
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// 过期会话清理间隔（秒）
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
    /// 暂存目录（本地对象存储）
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// 已提交对象目录（本地对象存储）
    #[serde(default = "default_object_dir")]
    pub object_dir: PathBuf,
}

fn default_idle_timeout_secs() -> u64 {
    15 * 60
}
fn default_reap_interval_secs() -> u64 {
    60
}
fn default_staging_dir() -> PathBuf {
    PathBuf::from("data/staging")
}
fn default_object_dir() -> PathBuf {
    PathBuf::from("data/objects")
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            staging_dir: default_staging_dir(),
            object_dir: default_object_dir(),
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn validate(&self) -> Result<(), UploadError> {
        if self.idle_timeout_secs == 0 {
            return Err(UploadError::Configuration(
                "idle_timeout_secs 必须大于 0".to_string(),
            ));
        }
        if self.reap_interval_secs == 0 {
            return Err(UploadError::Configuration(
                "reap_interval_secs 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// 进度阶段配置
///
/// 0..pre_phase_end 为目录记录创建，pre_phase_end..upload_phase_end 为文件上传，
/// upload_phase_end..100 为预览文件上传
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressConfig {
    #[serde(default = "default_pre_phase_end")]
    pub pre_phase_end: f64,
    #[serde(default = "default_upload_phase_end")]
    pub upload_phase_end: f64,
}

fn default_pre_phase_end() -> f64 {
    20.0
}
fn default_upload_phase_end() -> f64 {
    80.0
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            pre_phase_end: default_pre_phase_end(),
            upload_phase_end: default_upload_phase_end(),
        }
    }
}

impl ProgressConfig {
    pub fn validate(&self) -> Result<(), UploadError> {
        let ok = self.pre_phase_end > 0.0
            && self.pre_phase_end < self.upload_phase_end
            && self.upload_phase_end < 100.0;
        if !ok {
            return Err(UploadError::Configuration(format!(
                "进度阶段必须满足 0 < pre ({}) < upload ({}) < 100",
                self.pre_phase_end, self.upload_phase_end
            )));
        }
        Ok(())
    }
}

impl AppConfig {
    /// 校验全部配置
    pub fn validate(&self) -> Result<(), UploadError> {
        self.upload.validate()?;
        self.session.validate()?;
        self.progress.validate()?;
        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 加载配置，文件不存在时使用默认值
    pub async fn load_or_default(path: &str) -> Result<Self> {
        if fs::metadata(path).await.is_err() {
            tracing::info!("配置文件不存在，使用默认配置: {}", path);
            return Ok(Self::default());
        }
        Self::load_from_file(path).await
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败：配置校验未通过")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("配置已保存: {}", path);
        Ok(())
    }
}
