//! Truvis GFX 设备边界
//!
//! 资源管理层 (`truvis-resource`) 只通过这里定义的类型和 [`device::GfxDevice`] trait 和底层设备交互：
//! - [`memory`]: MemoryPolicy 到 memory property flags 的映射
//! - [`resources`]: Buffer / Image / Sampler 的创建描述，以及资源访问状态
//! - [`commands`]: barrier 描述以及传输命令流
//! - [`headless`]: 纯软件实现的设备，用于测试和无 GPU 环境
//! - `vulkan`: 基于 ash + vk-mem 的实现（需要开启 `vulkan` feature）

pub mod commands;
pub mod device;
pub mod error;
pub mod headless;
pub mod memory;
pub mod resources;
#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use error::{GfxError, GfxResult};
