//! 在 headless 设备上跑一遍完整流程：
//! 注册 loader → 异步加载 → 回调中创建 DeviceLocal 资源 → 每帧提交传输 → 模拟一次 swapchain resize

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ash::vk;
use truvis_asset::file_loader::{DecodedImage, ImageFileLoader, RawFileLoader};
use truvis_asset::{RequesterId, ResourceHub, ResourceHubConfig};
use truvis_gfx::headless::HeadlessDevice;
use truvis_gfx::memory::MemoryPolicy;
use truvis_gfx::resources::desc::{BufferDesc, ImageDesc};
use truvis_resource::{GpuResourceData, ResourceHandle};

fn main() -> anyhow::Result<()> {
    truvis_crate_tools::init_log::init_log();

    let config = match std::env::args().nth(1) {
        Some(path) => ResourceHubConfig::from_file(&path)?,
        None => ResourceHubConfig::default(),
    };

    let device = Arc::new(HeadlessDevice::new());
    let hub = Arc::new(ResourceHub::new(device.clone(), &config));
    hub.register_file_type("RAW", Arc::new(RawFileLoader));
    hub.register_file_type("IMAGE", Arc::new(ImageFileLoader));

    let dir = std::env::temp_dir().join(format!("truvis-async-load-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    let raw_path = dir.join("vertices.bin");
    std::fs::write(&raw_path, [1u8, 2, 3, 4, 5, 6, 7, 8])?;
    let image_path = dir.join("checker.png");
    image::RgbaImage::from_fn(4, 4, |x, y| {
        if (x + y) % 2 == 0 { image::Rgba([255, 255, 255, 255]) } else { image::Rgba([0, 0, 0, 255]) }
    })
    .save(&image_path)?;

    let (tx, rx) = crossbeam_channel::unbounded::<(PathBuf, anyhow::Result<ResourceHandle>)>();

    {
        let context = hub.context().clone();
        let tx = tx.clone();
        hub.load_file(
            "RAW",
            &raw_path,
            RequesterId(1),
            move |completion| {
                let result = completion.result.map_err(anyhow::Error::from).and_then(|payload| {
                    let bytes = payload.downcast_ref::<Vec<u8>>().context("RAW payload is not bytes")?;
                    let handle = context.create_named_buffer(
                        &BufferDesc::new(
                            bytes.len() as u64,
                            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                        ),
                        None,
                        MemoryPolicy::DeviceLocal,
                        Some(&GpuResourceData::new(bytes)),
                        "vertices",
                        None,
                    )?;
                    Ok(handle)
                });
                let _ = tx.send((completion.path, result));
            },
            None,
        )?;
    }

    {
        let context = hub.context().clone();
        let tx = tx.clone();
        hub.load_file(
            "IMAGE",
            &image_path,
            RequesterId(2),
            move |completion| {
                let result = completion.result.map_err(anyhow::Error::from).and_then(|payload| {
                    let image = payload.downcast_ref::<DecodedImage>().context("IMAGE payload is not an image")?;
                    let desc = ImageDesc::new_2d(
                        image.format,
                        vk::Extent2D {
                            width: image.extent.width,
                            height: image.extent.height,
                        },
                        vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
                    );
                    let handle = context.create_named_image(
                        &desc,
                        None,
                        MemoryPolicy::DeviceLocal,
                        Some(&GpuResourceData::new(&image.pixels)),
                        "checker",
                        None,
                    )?;
                    Ok(handle)
                });
                let _ = tx.send((completion.path, result));
            },
            None,
        )?;
    }

    let mut handles = Vec::new();
    for _ in 0..2 {
        let (path, result) = rx.recv_timeout(Duration::from_secs(10))?;
        match result {
            Ok(handle) => {
                log::info!("loaded {:?} as {:?}", path, handle);
                handles.push(handle);
            }
            Err(e) => log::error!("failed to load {:?}: {:#}", path, e),
        }
    }

    // 模拟每帧调用
    let confirmed = hub.complete_pending_transfers()?;
    log::info!("frame 0: {} staged uploads confirmed, stats: {:?}", confirmed, hub.context().transfer_stats());

    let callbacks = hub.swapchain_callbacks();
    (callbacks.begin)(vk::SurfaceKHR::null(), 1920, 1080);
    (callbacks.complete)(vk::SurfaceKHR::null(), 1920, 1080);
    log::info!("surface after resize: {:?}", hub.surface_extent());

    for handle in handles {
        hub.destroy_resource(handle)?;
    }
    hub.unload_file("RAW", &raw_path)?;
    hub.unload_file("IMAGE", &image_path)?;
    log::info!("live device objects after cleanup: {}", device.live_object_count());

    drop(callbacks);
    drop(hub);
    std::fs::remove_dir_all(&dir)?;
    Ok(())
}
