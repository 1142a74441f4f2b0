//! 异步文件加载与资源系统门面
//!
//! - [`AsyncFileLoader`](loader::AsyncFileLoader)：按文件类型 tag 注册加载函数，在后台线程池中把路径变成内存中的 payload。
//! - [`ResourceHub`](resource_hub::ResourceHub)：对外暴露资源生命周期、传输控制、文件加载接口，
//!   并在 swapchain 重建前后协调 loader 与传输通道。

pub mod config;
pub mod error;
pub mod file_loader;
pub mod loader;
pub mod resource_hub;

pub use config::{LoaderConfig, ResourceHubConfig};
pub use error::LoaderError;
pub use file_loader::{FileLoader, LoadedPayload};
pub use loader::{AsyncFileLoader, LoadCompletion, LoadResult, RequesterId};
pub use resource_hub::{ResizePhase, ResourceHub};
