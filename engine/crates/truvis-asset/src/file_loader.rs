//! 文件类型对应的加载函数
//!
//! 每个 tag 注册一个 [`FileLoader`]：在 worker 线程上把路径同步地转换成内存中的 payload，
//! 以及在 payload 不再使用时调用的析构函数。

use std::any::Any;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use ash::vk;

/// 加载完成的内存对象，具体类型由 tag 决定，使用方通过 `downcast_ref` 取回
pub type LoadedPayload = Arc<dyn Any + Send + Sync>;

pub trait FileLoader: Send + Sync {
    /// 在 worker 线程上执行，允许阻塞
    fn load(&self, path: &Path) -> anyhow::Result<LoadedPayload>;

    /// payload 从常驻表移除时调用
    fn destroy(&self, payload: LoadedPayload) {
        drop(payload);
    }
}

/// 由一对闭包组成的 loader
pub struct FnFileLoader<L, D> {
    load_fn: L,
    destroy_fn: D,
}

impl<L, D> FnFileLoader<L, D>
where
    L: Fn(&Path) -> anyhow::Result<LoadedPayload> + Send + Sync,
    D: Fn(LoadedPayload) + Send + Sync,
{
    pub fn new(load_fn: L, destroy_fn: D) -> Self {
        Self { load_fn, destroy_fn }
    }
}

impl<L, D> FileLoader for FnFileLoader<L, D>
where
    L: Fn(&Path) -> anyhow::Result<LoadedPayload> + Send + Sync,
    D: Fn(LoadedPayload) + Send + Sync,
{
    fn load(&self, path: &Path) -> anyhow::Result<LoadedPayload> {
        (self.load_fn)(path)
    }

    fn destroy(&self, payload: LoadedPayload) {
        (self.destroy_fn)(payload)
    }
}

/// 原样读取文件内容，payload 类型为 `Vec<u8>`
pub struct RawFileLoader;

impl FileLoader for RawFileLoader {
    fn load(&self, path: &Path) -> anyhow::Result<LoadedPayload> {
        let _span = tracy_client::span!("RawFileLoader::load");
        let bytes = fs::read(path).with_context(|| format!("failed to read {:?}", path))?;
        Ok(Arc::new(bytes))
    }
}

/// 解码后的图片 (CPU 端)，可以直接作为 `set_image_data` 的数据
pub struct DecodedImage {
    pub pixels: Vec<u8>,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub mip_levels: u32,
}

/// 用 `image` crate 解码，统一转换为 RGBA8
pub struct ImageFileLoader;

impl FileLoader for ImageFileLoader {
    fn load(&self, path: &Path) -> anyhow::Result<LoadedPayload> {
        let _span = tracy_client::span!("ImageFileLoader::load");
        log::info!("Loading texture: {:?}", path);

        let img = image::open(path).with_context(|| format!("failed to decode image {:?}", path))?;
        let img = img.into_rgba8();
        let (width, height) = img.dimensions();

        Ok(Arc::new(DecodedImage {
            pixels: img.into_raw(),
            extent: vk::Extent3D { width, height, depth: 1 },
            format: vk::Format::R8G8B8A8_UNORM,
            // 只解码 level 0
            mip_levels: 1,
        }))
    }
}
