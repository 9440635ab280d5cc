// 上传会话模块（服务端）
//
// - api: 客户端可见的会话协议
// - backend: 对象存储适配（内存 / 本地文件）
// - store: 会话状态机与过期回收

pub mod api;
pub mod backend;
pub mod store;

pub use api::{
    ChunkAck, FinalizeOutcome, ObjectRef, SessionApi, SessionId, SessionInit, SessionSnapshot,
    SessionStatus,
};
pub use backend::{CommitStatus, LocalObjectStore, MemoryObjectStore, ObjectStore, StagingHandle};
pub use store::SessionStore;
