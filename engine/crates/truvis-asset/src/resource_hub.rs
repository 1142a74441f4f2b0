use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use ash::vk;
use truvis_gfx::device::GfxDevice;
use truvis_gfx::memory::MemoryPolicy;
use truvis_gfx::resources::desc::{BufferDesc, BufferViewDesc, ImageDesc, ImageViewDesc, SamplerDesc};
use truvis_resource::resource_data::UserData;
use truvis_resource::{GpuResourceData, ResourceContext, ResourceHandle, ResourceResult};

use crate::config::ResourceHubConfig;
use crate::error::LoaderError;
use crate::file_loader::{FileLoader, LoadedPayload};
use crate::loader::{AsyncFileLoader, LoadCompletion, RequesterId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResizePhase {
    Running,
    Resizing,
}

/// 最近一次完成 resize 的 surface 尺寸
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceExtent {
    pub surface: vk::SurfaceKHR,
    pub extent: vk::Extent2D,
}

struct ResizeState {
    phase: ResizePhase,
    surface: Option<SurfaceExtent>,
}

pub type SwapchainResizeFn = Box<dyn Fn(vk::SurfaceKHR, u32, u32) + Send + Sync>;

/// 交给持有 swapchain 的一方的两个回调
pub struct SwapchainCallbacks {
    pub begin: SwapchainResizeFn,
    pub complete: SwapchainResizeFn,
}

/// 资源系统对外的门面
///
/// 持有 `ResourceContext` 和 `AsyncFileLoader`，并在 swapchain 重建前后协调两者：
/// - `begin_swapchain_resize`：暂停 loader（等待在途任务结束），提交并确认所有传输，然后释放 staging buffer。
/// - `complete_swapchain_resize`：恢复 loader。
///
/// 哪些资源依赖 surface 尺寸由使用方决定，需要在两次调用之间自行销毁和重建。
pub struct ResourceHub {
    // loader 先于 context 析构，保证回调不会在 context 销毁后运行
    loader: AsyncFileLoader,
    context: Arc<ResourceContext>,
    resize: Mutex<ResizeState>,
}

// new & init
impl ResourceHub {
    pub fn new(device: Arc<dyn GfxDevice>, config: &ResourceHubConfig) -> Self {
        Self {
            loader: AsyncFileLoader::new(&config.loader),
            context: Arc::new(ResourceContext::new(device, config.resource.clone())),
            resize: Mutex::new(ResizeState {
                phase: ResizePhase::Running,
                surface: None,
            }),
        }
    }

    pub fn from_config_file(device: Arc<dyn GfxDevice>, path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config = ResourceHubConfig::from_file(path)?;
        Ok(Self::new(device, &config))
    }

    /// 加载回调运行在 worker 线程上，需要在回调中创建资源时 clone 这个 `Arc`
    #[inline]
    pub fn context(&self) -> &Arc<ResourceContext> {
        &self.context
    }

    #[inline]
    pub fn loader(&self) -> &AsyncFileLoader {
        &self.loader
    }

    fn resize_state(&self) -> MutexGuard<'_, ResizeState> {
        self.resize.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// resource lifecycle
impl ResourceHub {
    pub fn create_buffer(
        &self,
        desc: &BufferDesc,
        view: Option<&BufferViewDesc>,
        policy: MemoryPolicy,
        initial_data: Option<&GpuResourceData>,
    ) -> ResourceResult<ResourceHandle> {
        self.context.create_buffer(desc, view, policy, initial_data)
    }

    pub fn create_named_buffer(
        &self,
        desc: &BufferDesc,
        view: Option<&BufferViewDesc>,
        policy: MemoryPolicy,
        initial_data: Option<&GpuResourceData>,
        name: &str,
        user_data: Option<UserData>,
    ) -> ResourceResult<ResourceHandle> {
        self.context.create_named_buffer(desc, view, policy, initial_data, name, user_data)
    }

    pub fn set_buffer_data(&self, handle: ResourceHandle, data: &GpuResourceData) -> ResourceResult<()> {
        self.context.set_buffer_data(handle, data)
    }

    pub fn create_image(
        &self,
        desc: &ImageDesc,
        view: Option<&ImageViewDesc>,
        policy: MemoryPolicy,
        initial_data: Option<&GpuResourceData>,
    ) -> ResourceResult<ResourceHandle> {
        self.context.create_image(desc, view, policy, initial_data)
    }

    pub fn create_named_image(
        &self,
        desc: &ImageDesc,
        view: Option<&ImageViewDesc>,
        policy: MemoryPolicy,
        initial_data: Option<&GpuResourceData>,
        name: &str,
        user_data: Option<UserData>,
    ) -> ResourceResult<ResourceHandle> {
        self.context.create_named_image(desc, view, policy, initial_data, name, user_data)
    }

    pub fn set_image_data(&self, handle: ResourceHandle, data: &GpuResourceData) -> ResourceResult<()> {
        self.context.set_image_data(handle, data)
    }

    pub fn create_sampler(&self, desc: &SamplerDesc, name: Option<&str>) -> ResourceResult<ResourceHandle> {
        self.context.create_sampler(desc, name)
    }

    pub fn destroy_resource(&self, handle: ResourceHandle) -> ResourceResult<()> {
        self.context.destroy_resource(handle)
    }

    pub fn copy_resource(&self, src: ResourceHandle, dst: ResourceHandle) -> ResourceResult<()> {
        self.context.copy_resource(src, dst)
    }

    pub fn complete_pending_transfers(&self) -> ResourceResult<usize> {
        self.context.complete_pending_transfers()
    }

    pub fn flush_staging_buffers(&self) -> ResourceResult<usize> {
        self.context.flush_staging_buffers()
    }

    /// 见 [`ResourceContext::abort_pending_transfers`]
    pub fn abort_pending_transfers(&self) -> Vec<ResourceHandle> {
        self.context.abort_pending_transfers()
    }
}

// file loading
impl ResourceHub {
    pub fn register_file_type(&self, tag: &str, loader: Arc<dyn FileLoader>) {
        self.loader.register_file_type(tag, loader);
    }

    pub fn register_file_type_factory<L, D>(&self, tag: &str, load_fn: L, destroy_fn: D)
    where
        L: Fn(&Path) -> anyhow::Result<LoadedPayload> + Send + Sync + 'static,
        D: Fn(LoadedPayload) + Send + Sync + 'static,
    {
        self.loader.register_file_type_fn(tag, load_fn, destroy_fn);
    }

    pub fn load_file<F>(
        &self,
        tag: &str,
        path: impl Into<PathBuf>,
        requester: RequesterId,
        callback: F,
        user_data: Option<UserData>,
    ) -> Result<(), LoaderError>
    where
        F: FnOnce(LoadCompletion) + Send + 'static,
    {
        self.loader.load(tag, path, requester, callback, user_data)
    }

    pub fn unload_file(&self, tag: &str, path: impl AsRef<Path>) -> Result<bool, LoaderError> {
        self.loader.unload(tag, path)
    }
}

// swapchain resize
impl ResourceHub {
    /// swapchain 即将重建
    ///
    /// 返回后 loader 不再分发新请求，没有未确认的传输，staging buffer 和 UploadArena 均已释放。
    /// 提交失败时返回错误，状态仍为 `Resizing`，可以再次调用；
    /// 不再重试时先 `abort_pending_transfers` 再调用。
    pub fn begin_swapchain_resize(&self, surface: vk::SurfaceKHR, width: u32, height: u32) -> ResourceResult<()> {
        let _span = tracy_client::span!("ResourceHub::begin_swapchain_resize");
        {
            let mut state = self.resize_state();
            if state.phase == ResizePhase::Resizing {
                log::warn!("begin_swapchain_resize called twice without complete");
            }
            state.phase = ResizePhase::Resizing;
        }
        log::info!("begin swapchain resize: {:?} -> {}x{}", surface, width, height);

        if let Err(e) = self.loader.pause() {
            log::warn!("failed to pause file loader: {}", e);
        }
        self.context.complete_pending_transfers()?;
        self.context.flush_staging_buffers()?;
        Ok(())
    }

    /// swapchain 重建完成，恢复 loader
    pub fn complete_swapchain_resize(&self, surface: vk::SurfaceKHR, width: u32, height: u32) {
        let _span = tracy_client::span!("ResourceHub::complete_swapchain_resize");
        {
            let mut state = self.resize_state();
            if state.phase != ResizePhase::Resizing {
                log::warn!("complete_swapchain_resize called without begin");
            }
            state.phase = ResizePhase::Running;
            state.surface = Some(SurfaceExtent {
                surface,
                extent: vk::Extent2D { width, height },
            });
        }

        if let Err(e) = self.loader.resume() {
            log::warn!("failed to resume file loader: {}", e);
        }
        log::info!("complete swapchain resize: {:?} {}x{}", surface, width, height);
    }

    pub fn resize_phase(&self) -> ResizePhase {
        self.resize_state().phase
    }

    pub fn surface_extent(&self) -> Option<SurfaceExtent> {
        self.resize_state().surface
    }

    /// 生成交给 swapchain 持有方的回调，只持有 hub 的弱引用
    pub fn swapchain_callbacks(self: &Arc<Self>) -> SwapchainCallbacks {
        let begin_hub: Weak<Self> = Arc::downgrade(self);
        let complete_hub: Weak<Self> = Arc::downgrade(self);
        SwapchainCallbacks {
            begin: Box::new(move |surface, width, height| {
                if let Some(hub) = begin_hub.upgrade()
                    && let Err(e) = hub.begin_swapchain_resize(surface, width, height)
                {
                    log::error!("begin swapchain resize failed: {}", e);
                }
            }),
            complete: Box::new(move |surface, width, height| {
                if let Some(hub) = complete_hub.upgrade() {
                    hub.complete_swapchain_resize(surface, width, height);
                }
            }),
        }
    }
}
