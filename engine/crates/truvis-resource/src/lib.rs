//! Truvis 资源管理
//!
//! [`ResourceContext`](resource_context::ResourceContext) 负责 GPU 资源的整个生命周期：
//! 创建 native object、按 [`MemoryPolicy`](truvis_gfx::memory::MemoryPolicy) 绑定内存、
//! 写入初始数据（直接写映射内存，或经过 staging buffer + 设备端拷贝）以及销毁。
//!
//! staging 拷贝和前后的 barrier 被录制到同一条传输命令流中，
//! 由使用方每帧调用 `complete_pending_transfers` 提交并确认。

pub mod allocator;
pub mod config;
pub mod error;
pub mod handles;
pub mod resource_context;
pub mod resource_data;
pub mod staging;
pub mod transfer;
pub mod upload;
pub mod upload_arena;

pub use config::ResourceContextConfig;
pub use error::{ResourceError, ResourceResult};
pub use handles::{ResourceHandle, ResourceKind};
pub use resource_context::ResourceContext;
pub use resource_data::GpuResourceData;
