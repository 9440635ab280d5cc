// Kitstore 分片上传库
// 音色包市场的大文件分片、可续传上传链路

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 日志系统
pub mod logging;

// 上传会话模块（服务端）
pub mod session;

// 分片上传模块（客户端）
pub mod uploader;

// 导出常用类型
pub use config::AppConfig;
pub use error::UploadError;
pub use session::{
    LocalObjectStore, MemoryObjectStore, ObjectRef, ObjectStore, SessionApi, SessionStore,
};
pub use uploader::{
    CatalogService, JobOutcome, JobReport, KitScanner, MemoryCatalog, UploadEvent,
    UploadOrchestrator, UploadTask, UploadTaskStatus,
};
