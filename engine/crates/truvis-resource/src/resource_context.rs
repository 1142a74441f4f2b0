use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use slotmap::SlotMap;
use truvis_gfx::device::{AllocationTarget, GfxDevice};
use truvis_gfx::memory::{DeviceAllocation, MemoryPolicy};
use truvis_gfx::resources::desc::{BufferDesc, BufferViewDesc, ImageDesc, ImageViewDesc, SamplerDesc};
use truvis_gfx::resources::resource_state::{BufferState, ImageState};

use crate::allocator::{AllocationRecord, AllocatorAdapter};
use crate::config::ResourceContextConfig;
use crate::error::{ResourceError, ResourceResult};
use crate::handles::{InnerResourceHandle, ResourceHandle, ResourceKind};
use crate::resource_data::{
    AccessState, GpuResourceData, NativeHandle, NativeView, ResourceInfo, ResourceRecord, UserData,
};
use crate::transfer::{TransferChannel, TransferRecorder, TransferStats};
use crate::upload;

/// 资源注册表和它拥有的内存分配
struct Registry {
    records: SlotMap<InnerResourceHandle, ResourceRecord>,
    allocator: AllocatorAdapter,
}

impl Registry {
    fn record(&self, handle: ResourceHandle) -> ResourceResult<&ResourceRecord> {
        self.records.get(handle.inner).ok_or(ResourceError::InvalidHandle(handle))
    }

    fn record_mut(&mut self, handle: ResourceHandle) -> ResourceResult<&mut ResourceRecord> {
        self.records.get_mut(handle.inner).ok_or(ResourceError::InvalidHandle(handle))
    }
}

/// GPU 资源的创建、数据写入和销毁
///
/// 所有状态都由这个对象持有，构造一次后以引用或 `Arc` 传给使用方。
/// 内部加锁，可以被加载线程和主线程同时使用。加锁顺序固定为 registry → transfer。
pub struct ResourceContext {
    device: Arc<dyn GfxDevice>,
    config: ResourceContextConfig,
    registry: Mutex<Registry>,
    transfer: TransferChannel,
}

// new & init
impl ResourceContext {
    pub fn new(device: Arc<dyn GfxDevice>, config: ResourceContextConfig) -> Self {
        log::info!("create resource context: {:?}", config);
        let transfer = TransferChannel::new(&config);
        Self {
            device,
            config,
            registry: Mutex::new(Registry {
                records: SlotMap::with_key(),
                allocator: AllocatorAdapter::new(),
            }),
            transfer,
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// buffer
impl ResourceContext {
    pub fn create_buffer(
        &self,
        desc: &BufferDesc,
        view: Option<&BufferViewDesc>,
        policy: MemoryPolicy,
        initial_data: Option<&GpuResourceData>,
    ) -> ResourceResult<ResourceHandle> {
        self.create_buffer_impl(desc, view, policy, initial_data, None, None)
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
        self.create_buffer_impl(desc, view, policy, initial_data, Some(name), user_data)
    }

    fn create_buffer_impl(
        &self,
        desc: &BufferDesc,
        view: Option<&BufferViewDesc>,
        policy: MemoryPolicy,
        initial_data: Option<&GpuResourceData>,
        name: Option<&str>,
        user_data: Option<UserData>,
    ) -> ResourceResult<ResourceHandle> {
        let _span = tracy_client::span!("ResourceContext::create_buffer");
        if let Some(data) = initial_data {
            upload::validate_buffer_data(desc, data)?;
        }

        let device = self.device.as_ref();
        let creation_error = |source| ResourceError::DeviceCreation {
            kind: ResourceKind::Buffer,
            name: name.map(str::to_string),
            source,
        };

        let mut registry = self.registry();

        // native object、内存、view 依次创建，任何一步失败都回滚之前的步骤
        let buffer = scopeguard::guard(device.create_buffer(desc, name).map_err(creation_error)?, |buffer| {
            device.destroy_buffer(buffer)
        });
        let allocation = scopeguard::guard(
            registry
                .allocator
                .bind(device, AllocationTarget::Buffer(*buffer), policy)
                .map_err(creation_error)?,
            |record| device.free_allocation(&record.allocation),
        );
        let buffer_view = match view {
            Some(view_desc) => Some(device.create_buffer_view(*buffer, view_desc).map_err(creation_error)?),
            None => None,
        };

        let allocation = scopeguard::ScopeGuard::into_inner(allocation);
        let buffer = scopeguard::ScopeGuard::into_inner(buffer);
        let key = registry.records.insert(ResourceRecord {
            native: NativeHandle::Buffer(buffer),
            view: buffer_view.map(NativeView::Buffer),
            info: ResourceInfo::Buffer {
                desc: *desc,
                view: view.copied(),
            },
            policy: Some(policy),
            name: name.map(str::to_string),
            user_data,
            state: AccessState::Buffer(BufferState::UNDEFINED),
        });
        registry.allocator.adopt(key, allocation);
        let handle = ResourceHandle {
            inner: key,
            kind: ResourceKind::Buffer,
        };

        if let Some(data) = initial_data {
            if let Err(e) = self.write_buffer_locked(&mut registry, handle, data) {
                self.destroy_locked(&mut registry, key);
                return Err(e);
            }
        }

        log::debug!("create buffer {:?} \"{}\" ({} bytes, {:?})", buffer, name.unwrap_or(""), desc.size, policy);
        Ok(handle)
    }

    /// 重新写入 buffer 的数据
    ///
    /// 调用方需保证上一次写入对应的传输已经确认，这里不做双缓冲。
    pub fn set_buffer_data(&self, handle: ResourceHandle, data: &GpuResourceData) -> ResourceResult<()> {
        let _span = tracy_client::span!("ResourceContext::set_buffer_data");
        let mut registry = self.registry();
        self.write_buffer_locked(&mut registry, handle, data)
    }

    fn write_buffer_locked(
        &self,
        registry: &mut Registry,
        handle: ResourceHandle,
        data: &GpuResourceData,
    ) -> ResourceResult<()> {
        expect_kind(handle, ResourceKind::Buffer)?;
        let record = registry.record(handle)?;
        let (NativeHandle::Buffer(buffer), ResourceInfo::Buffer { desc, .. }) = (record.native, record.info) else {
            return Err(ResourceError::WrongKind {
                expected: ResourceKind::Buffer,
                found: record.kind(),
            });
        };
        upload::validate_buffer_data(&desc, data)?;

        let allocation = *registry.allocator.get(handle.inner).ok_or(ResourceError::InvalidHandle(handle))?;
        if allocation.policy.is_host_writable() {
            return upload::write_host_visible(self.device.as_ref(), &allocation, 0, data.data);
        }

        let prior = match record.state {
            AccessState::Buffer(state) => state,
            _ => BufferState::UNDEFINED,
        };
        let mut recorder = self.transfer.acquire_recording_scope();
        let new_state = upload::stage_buffer_upload(
            self.device.as_ref(),
            &mut recorder,
            handle.inner,
            buffer,
            &desc,
            prior,
            data,
        )?;
        registry.record_mut(handle)?.state = AccessState::Buffer(new_state);
        Ok(())
    }
}

// image
impl ResourceContext {
    /// 创建 image，`view` 为空时创建覆盖全部 mip 和 layer 的默认 view
    pub fn create_image(
        &self,
        desc: &ImageDesc,
        view: Option<&ImageViewDesc>,
        policy: MemoryPolicy,
        initial_data: Option<&GpuResourceData>,
    ) -> ResourceResult<ResourceHandle> {
        self.create_image_impl(desc, view, policy, initial_data, None, None)
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
        self.create_image_impl(desc, view, policy, initial_data, Some(name), user_data)
    }

    fn create_image_impl(
        &self,
        desc: &ImageDesc,
        view: Option<&ImageViewDesc>,
        policy: MemoryPolicy,
        initial_data: Option<&GpuResourceData>,
        name: Option<&str>,
        user_data: Option<UserData>,
    ) -> ResourceResult<ResourceHandle> {
        let _span = tracy_client::span!("ResourceContext::create_image");
        upload::validate_image_desc(desc)?;
        if let Some(data) = initial_data {
            upload::image_copy_regions(desc, data)?;
        }

        let device = self.device.as_ref();
        let creation_error = |source| ResourceError::DeviceCreation {
            kind: ResourceKind::Image,
            name: name.map(str::to_string),
            source,
        };
        let view_desc = view.copied().unwrap_or_else(|| desc.default_view());

        let mut registry = self.registry();

        let image = scopeguard::guard(device.create_image(desc, name).map_err(creation_error)?, |image| {
            device.destroy_image(image)
        });
        let allocation = scopeguard::guard(
            registry
                .allocator
                .bind(device, AllocationTarget::Image(*image), policy)
                .map_err(creation_error)?,
            |record| device.free_allocation(&record.allocation),
        );
        let image_view = device.create_image_view(*image, &view_desc).map_err(creation_error)?;

        let allocation = scopeguard::ScopeGuard::into_inner(allocation);
        let image = scopeguard::ScopeGuard::into_inner(image);
        let key = registry.records.insert(ResourceRecord {
            native: NativeHandle::Image(image),
            view: Some(NativeView::Image(image_view)),
            info: ResourceInfo::Image {
                desc: *desc,
                view: view_desc,
            },
            policy: Some(policy),
            name: name.map(str::to_string),
            user_data,
            state: AccessState::Image(ImageState::UNDEFINED),
        });
        registry.allocator.adopt(key, allocation);
        let handle = ResourceHandle {
            inner: key,
            kind: ResourceKind::Image,
        };

        if let Some(data) = initial_data {
            if let Err(e) = self.write_image_locked(&mut registry, handle, data) {
                self.destroy_locked(&mut registry, key);
                return Err(e);
            }
        }

        log::debug!(
            "create image {:?} \"{}\" ({}x{}, {} mips, {:?})",
            image,
            name.unwrap_or(""),
            desc.extent.width,
            desc.extent.height,
            desc.mip_levels,
            policy
        );
        Ok(handle)
    }

    /// 重新写入 image 的全部 subresource
    pub fn set_image_data(&self, handle: ResourceHandle, data: &GpuResourceData) -> ResourceResult<()> {
        let _span = tracy_client::span!("ResourceContext::set_image_data");
        let mut registry = self.registry();
        self.write_image_locked(&mut registry, handle, data)
    }

    fn write_image_locked(
        &self,
        registry: &mut Registry,
        handle: ResourceHandle,
        data: &GpuResourceData,
    ) -> ResourceResult<()> {
        expect_kind(handle, ResourceKind::Image)?;
        let record = registry.record(handle)?;
        let (NativeHandle::Image(image), ResourceInfo::Image { desc, .. }) = (record.native, record.info) else {
            return Err(ResourceError::WrongKind {
                expected: ResourceKind::Image,
                found: record.kind(),
            });
        };

        let allocation = *registry.allocator.get(handle.inner).ok_or(ResourceError::InvalidHandle(handle))?;
        if allocation.policy.is_host_writable() {
            return upload::write_host_visible_image(self.device.as_ref(), &allocation, &desc, data);
        }

        let prior = match record.state {
            AccessState::Image(state) => state,
            _ => ImageState::UNDEFINED,
        };
        let mut recorder = self.transfer.acquire_recording_scope();
        let new_state =
            upload::stage_image_upload(self.device.as_ref(), &mut recorder, handle.inner, image, &desc, prior, data)?;
        registry.record_mut(handle)?.state = AccessState::Image(new_state);
        Ok(())
    }
}

// sampler
impl ResourceContext {
    pub fn create_sampler(&self, desc: &SamplerDesc, name: Option<&str>) -> ResourceResult<ResourceHandle> {
        let sampler = self.device.create_sampler(desc, name).map_err(|source| ResourceError::DeviceCreation {
            kind: ResourceKind::Sampler,
            name: name.map(str::to_string),
            source,
        })?;

        let key = self.registry().records.insert(ResourceRecord {
            native: NativeHandle::Sampler(sampler),
            view: None,
            info: ResourceInfo::Sampler(*desc),
            policy: None,
            name: name.map(str::to_string),
            user_data: None,
            state: AccessState::None,
        });
        log::debug!("create sampler {:?} \"{}\"", sampler, name.unwrap_or(""));
        Ok(ResourceHandle {
            inner: key,
            kind: ResourceKind::Sampler,
        })
    }
}

// destroy & copy
impl ResourceContext {
    /// 销毁资源以及它的 view 和内存
    ///
    /// 资源仍被未确认的传输引用时返回 `StaleTransfer`，此时资源保持不变。
    pub fn destroy_resource(&self, handle: ResourceHandle) -> ResourceResult<()> {
        let _span = tracy_client::span!("ResourceContext::destroy_resource");
        let mut registry = self.registry();
        registry.record(handle)?;
        if self.transfer.is_referenced(handle.inner) {
            return Err(ResourceError::StaleTransfer {
                operation: "destroy resource",
                outstanding: self.transfer.pending_count(),
            });
        }
        self.destroy_locked(&mut registry, handle.inner);
        Ok(())
    }

    fn destroy_locked(&self, registry: &mut Registry, key: InnerResourceHandle) {
        let Some(record) = registry.records.remove(key) else {
            return;
        };
        let device = self.device.as_ref();
        match record.view {
            Some(NativeView::Buffer(view)) => device.destroy_buffer_view(view),
            Some(NativeView::Image(view)) => device.destroy_image_view(view),
            None => {}
        }
        match record.native {
            NativeHandle::Buffer(buffer) => device.destroy_buffer(buffer),
            NativeHandle::Image(image) => device.destroy_image(image),
            NativeHandle::Sampler(sampler) => device.destroy_sampler(sampler),
        }
        registry.allocator.release(device, key);
        log::debug!("destroy {:?} \"{}\"", record.kind(), record.display_name());
    }

    /// 资源之间的拷贝尚未支持
    pub fn copy_resource(&self, _src: ResourceHandle, _dst: ResourceHandle) -> ResourceResult<()> {
        Err(ResourceError::NotImplemented("copy_resource"))
    }

    /// 以已有资源为模板创建副本，尚未支持
    pub fn create_resource_copy(&self, _src: ResourceHandle) -> ResourceResult<ResourceHandle> {
        Err(ResourceError::NotImplemented("create_resource_copy"))
    }
}

// transfer
impl ResourceContext {
    /// 拿到传输命令流的独占录制权限，用于录制自定义的传输命令
    ///
    /// 持有 recorder 期间不能调用其他会写入数据的方法，否则会死锁。
    pub fn acquire_recording_scope(&self) -> TransferRecorder<'_> {
        self.transfer.acquire_recording_scope()
    }

    /// 提交并确认所有已录制的传输，返回确认的 staging 请求数
    pub fn complete_pending_transfers(&self) -> ResourceResult<usize> {
        self.transfer.complete_pending_transfers(self.device.as_ref())
    }

    /// 释放所有 staging buffer 和 UploadArena，返回释放的 staging buffer 数量
    pub fn flush_staging_buffers(&self) -> ResourceResult<usize> {
        self.transfer.flush_staging_buffers(self.device.as_ref())
    }

    /// 放弃当前批次：丢弃已录制的命令和所有未确认的 staging 请求
    ///
    /// 用于提交失败且不再重试的情况。返回受影响且仍然存活的资源，
    /// 它们的内容未定义，访问状态回到 UNDEFINED，可以重新写入或直接销毁。
    pub fn abort_pending_transfers(&self) -> Vec<ResourceHandle> {
        let mut registry = self.registry();
        let aborted = self.transfer.abort_pending_transfers(self.device.as_ref());
        aborted
            .into_iter()
            .filter_map(|key| {
                let record = registry.records.get_mut(key)?;
                record.state = match record.state {
                    AccessState::Buffer(_) => AccessState::Buffer(BufferState::UNDEFINED),
                    AccessState::Image(_) => AccessState::Image(ImageState::UNDEFINED),
                    AccessState::None => AccessState::None,
                };
                Some(ResourceHandle {
                    inner: key,
                    kind: record.kind(),
                })
            })
            .collect()
    }

    pub fn pending_transfer_count(&self) -> usize {
        self.transfer.pending_count()
    }

    pub fn transfer_stats(&self) -> TransferStats {
        self.transfer.stats()
    }
}

// 映射内存读写
impl ResourceContext {
    /// 读取 host 可见资源的内存
    pub fn read_resource_memory(&self, handle: ResourceHandle, offset: u64, len: usize) -> ResourceResult<Vec<u8>> {
        let registry = self.registry();
        let allocation = self.host_allocation(&registry, handle)?;
        upload::allocation_range_check(&allocation.allocation, offset, len as u64)?;
        Ok(self.device.read_mapped(&allocation.allocation, offset, len)?)
    }

    /// 写入 host 可见资源的内存，非 coherent 内存会被 flush
    pub fn write_resource_memory(&self, handle: ResourceHandle, offset: u64, bytes: &[u8]) -> ResourceResult<()> {
        let registry = self.registry();
        let allocation = self.host_allocation(&registry, handle)?;
        upload::allocation_range_check(&allocation.allocation, offset, bytes.len() as u64)?;
        upload::write_host_visible(self.device.as_ref(), &allocation, offset, bytes)
    }

    fn host_allocation(
        &self,
        registry: &Registry,
        handle: ResourceHandle,
    ) -> ResourceResult<AllocationRecord> {
        registry.record(handle)?;
        let allocation = *registry.allocator.get(handle.inner).ok_or_else(|| {
            ResourceError::InvalidData(format!("{:?} resource has no memory", handle.kind))
        })?;
        if !allocation.policy.is_host_writable() {
            return Err(ResourceError::InvalidData(format!(
                "memory of {:?} policy is not host accessible",
                allocation.policy
            )));
        }
        Ok(allocation)
    }
}

// getters
impl ResourceContext {
    #[inline]
    pub fn device(&self) -> &Arc<dyn GfxDevice> {
        &self.device
    }

    #[inline]
    pub fn config(&self) -> &ResourceContextConfig {
        &self.config
    }

    pub fn contains(&self, handle: ResourceHandle) -> bool {
        self.registry().records.contains_key(handle.inner)
    }

    pub fn resource_kind(&self, handle: ResourceHandle) -> ResourceResult<ResourceKind> {
        Ok(self.registry().record(handle)?.kind())
    }

    pub fn resource_name(&self, handle: ResourceHandle) -> ResourceResult<Option<String>> {
        Ok(self.registry().record(handle)?.name.clone())
    }

    pub fn resource_info(&self, handle: ResourceHandle) -> ResourceResult<ResourceInfo> {
        Ok(self.registry().record(handle)?.info)
    }

    pub fn native_handle(&self, handle: ResourceHandle) -> ResourceResult<NativeHandle> {
        Ok(self.registry().record(handle)?.native)
    }

    pub fn native_view_handle(&self, handle: ResourceHandle) -> ResourceResult<Option<NativeView>> {
        Ok(self.registry().record(handle)?.view)
    }

    pub fn memory_policy(&self, handle: ResourceHandle) -> ResourceResult<Option<MemoryPolicy>> {
        Ok(self.registry().record(handle)?.policy)
    }

    pub fn allocation(&self, handle: ResourceHandle) -> ResourceResult<Option<DeviceAllocation>> {
        let registry = self.registry();
        registry.record(handle)?;
        Ok(registry.allocator.get(handle.inner).map(|r| r.allocation))
    }

    pub fn user_data(&self, handle: ResourceHandle) -> ResourceResult<Option<UserData>> {
        Ok(self.registry().record(handle)?.user_data.clone())
    }

    pub fn live_resource_count(&self) -> usize {
        self.registry().records.len()
    }
}

impl Drop for ResourceContext {
    fn drop(&mut self) {
        if let Err(e) = self.complete_pending_transfers() {
            log::error!("failed to complete pending transfers on drop: {}", e);
        }
        if let Err(e) = self.flush_staging_buffers() {
            log::error!("failed to flush staging buffers on drop: {}", e);
        }

        let mut registry = self.registry();
        let keys: Vec<_> = registry.records.keys().collect();
        if !keys.is_empty() {
            log::warn!("{} resources still alive when the resource context is dropped", keys.len());
        }
        for key in keys {
            self.destroy_locked(&mut registry, key);
        }
    }
}

fn expect_kind(handle: ResourceHandle, expected: ResourceKind) -> ResourceResult<()> {
    if handle.kind != expected {
        return Err(ResourceError::WrongKind {
            expected,
            found: handle.kind,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use ash::vk;
    use truvis_gfx::error::GfxError;
    use truvis_gfx::headless::HeadlessDevice;

    use super::*;

    fn context() -> (Arc<HeadlessDevice>, ResourceContext) {
        let device = Arc::new(HeadlessDevice::new());
        let config = ResourceContextConfig {
            staging_min_size: 256,
            ..Default::default()
        };
        let ctx = ResourceContext::new(device.clone(), config);
        (device, ctx)
    }

    fn native_buffer(ctx: &ResourceContext, handle: ResourceHandle) -> vk::Buffer {
        match ctx.native_handle(handle).unwrap() {
            NativeHandle::Buffer(buffer) => buffer,
            other => panic!("not a buffer: {other:?}"),
        }
    }

    fn native_image(ctx: &ResourceContext, handle: ResourceHandle) -> vk::Image {
        match ctx.native_handle(handle).unwrap() {
            NativeHandle::Image(image) => image,
            other => panic!("not an image: {other:?}"),
        }
    }

    #[test]
    fn test_host_visible_round_trip() {
        let (device, ctx) = context();
        let bytes: Vec<u8> = (0..64).collect();
        for policy in [MemoryPolicy::HostVisible, MemoryPolicy::HostVisibleCoherent] {
            let handle = ctx
                .create_buffer(
                    &BufferDesc::new(64, vk::BufferUsageFlags::UNIFORM_BUFFER),
                    None,
                    policy,
                    Some(&GpuResourceData::new(&bytes)),
                )
                .unwrap();
            assert_eq!(ctx.read_resource_memory(handle, 0, bytes.len()).unwrap(), bytes);
        }
        // 只有非 coherent 的写入需要 flush
        assert_eq!(device.flush_count(), 1);
        assert_eq!(ctx.pending_transfer_count(), 0);
    }

    #[test]
    fn test_write_resource_memory_at_offset() {
        let (_device, ctx) = context();
        let handle = ctx
            .create_buffer(
                &BufferDesc::new(8, vk::BufferUsageFlags::STORAGE_BUFFER),
                None,
                MemoryPolicy::HostVisibleCoherent,
                None,
            )
            .unwrap();
        ctx.write_resource_memory(handle, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(ctx.read_resource_memory(handle, 0, 8).unwrap(), vec![0, 0, 0, 0, 1, 2, 3, 4]);
        assert!(matches!(ctx.write_resource_memory(handle, 6, &[1, 2, 3]), Err(ResourceError::InvalidData(_))));
    }

    #[test]
    fn test_device_local_buffer_is_staged() {
        let (device, ctx) = context();
        let handle = ctx
            .create_named_buffer(
                &BufferDesc::new(4, vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST),
                None,
                MemoryPolicy::DeviceLocal,
                Some(&GpuResourceData::new(&[1, 2, 3, 4])),
                "vertices",
                None,
            )
            .unwrap();

        let buffer = native_buffer(&ctx, handle);
        assert_eq!(ctx.pending_transfer_count(), 1);
        assert_eq!(ctx.transfer_stats().commands_recorded, 3);
        assert_eq!(device.buffer_contents(buffer).unwrap(), vec![0, 0, 0, 0]);
        assert!(matches!(ctx.read_resource_memory(handle, 0, 4), Err(ResourceError::InvalidData(_))));

        assert_eq!(ctx.complete_pending_transfers().unwrap(), 1);
        assert_eq!(device.buffer_contents(buffer).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(ctx.resource_name(handle).unwrap().as_deref(), Some("vertices"));

        let stats = ctx.transfer_stats();
        assert_eq!(stats.batches_submitted, 1);
        assert_eq!(stats.requests_confirmed, 1);
        assert_eq!(stats.outstanding, 0);
    }

    #[test]
    fn test_each_policy_binds_its_flags() {
        let (device, ctx) = context();
        for policy in MemoryPolicy::ALL {
            ctx.create_buffer(&BufferDesc::new(16, vk::BufferUsageFlags::STORAGE_BUFFER), None, policy, None)
                .unwrap();
        }
        let expected: Vec<_> = MemoryPolicy::ALL.iter().map(|p| p.required_flags()).collect();
        assert_eq!(device.requested_flags_log(), expected);
    }

    #[test]
    fn test_failed_native_creation_leaves_nothing() {
        let (device, ctx) = context();
        device.fail_next_create();
        let result = ctx.create_named_buffer(
            &BufferDesc::new(16, vk::BufferUsageFlags::UNIFORM_BUFFER),
            None,
            MemoryPolicy::HostVisible,
            None,
            "broken",
            None,
        );
        match result {
            Err(ResourceError::DeviceCreation { kind, name, source }) => {
                assert_eq!(kind, ResourceKind::Buffer);
                assert_eq!(name.as_deref(), Some("broken"));
                assert!(matches!(source, GfxError::ObjectCreation { object: "buffer", .. }));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(ctx.live_resource_count(), 0);
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn test_failed_allocation_rolls_back_native_object() {
        let (device, ctx) = context();
        device.fail_next_allocation();
        let result = ctx.create_image(
            &ImageDesc::new_2d(
                vk::Format::R8G8B8A8_UNORM,
                vk::Extent2D { width: 4, height: 4 },
                vk::ImageUsageFlags::SAMPLED,
            ),
            None,
            MemoryPolicy::DeviceLocal,
            None,
        );
        assert!(matches!(result, Err(ResourceError::DeviceCreation { kind: ResourceKind::Image, .. })));
        assert_eq!(ctx.live_resource_count(), 0);
        assert_eq!(device.live_object_count(), 0);
        assert_eq!(device.live_allocation_count(), 0);
    }

    #[test]
    fn test_unsatisfiable_policy_fails_without_fallback() {
        let device = Arc::new(HeadlessDevice::with_memory_types(vec![
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]));
        let ctx = ResourceContext::new(device.clone(), ResourceContextConfig::default());
        let result =
            ctx.create_buffer(&BufferDesc::new(16, vk::BufferUsageFlags::INDEX_BUFFER), None, MemoryPolicy::DeviceLocal, None);
        assert!(matches!(
            result,
            Err(ResourceError::DeviceCreation {
                source: GfxError::Allocation { .. },
                ..
            })
        ));
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn test_failed_view_creation_rolls_back() {
        let (device, ctx) = context();
        let desc = BufferDesc::new(64, vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER);
        let view = BufferViewDesc::new(vk::Format::R32_SFLOAT);

        let handle = ctx.create_buffer(&desc, Some(&view), MemoryPolicy::HostVisible, None).unwrap();
        assert!(matches!(ctx.native_view_handle(handle).unwrap(), Some(NativeView::Buffer(_))));
        ctx.destroy_resource(handle).unwrap();

        // buffer 创建成功，view 创建失败
        device.fail_create_after(1);
        let result = ctx.create_buffer(&desc, Some(&view), MemoryPolicy::HostVisible, None);
        assert!(matches!(result, Err(ResourceError::DeviceCreation { .. })));
        assert_eq!(ctx.live_resource_count(), 0);
        assert_eq!(device.live_object_count(), 0);
        assert_eq!(device.live_allocation_count(), 0);
    }

    #[test]
    fn test_invalid_initial_data_leaves_nothing() {
        let (device, ctx) = context();
        let result = ctx.create_buffer(
            &BufferDesc::new(2, vk::BufferUsageFlags::VERTEX_BUFFER),
            None,
            MemoryPolicy::DeviceLocal,
            Some(&GpuResourceData::new(&[1, 2, 3])),
        );
        assert!(matches!(result, Err(ResourceError::InvalidData(_))));
        assert_eq!(ctx.live_resource_count(), 0);
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn test_destroy_while_transfer_pending_is_rejected() {
        let (device, ctx) = context();
        let handle = ctx
            .create_buffer(
                &BufferDesc::new(4, vk::BufferUsageFlags::STORAGE_BUFFER),
                None,
                MemoryPolicy::DeviceLocal,
                Some(&GpuResourceData::new(&[5; 4])),
            )
            .unwrap();

        assert!(matches!(ctx.destroy_resource(handle), Err(ResourceError::StaleTransfer { .. })));
        assert!(ctx.contains(handle));

        ctx.complete_pending_transfers().unwrap();
        ctx.destroy_resource(handle).unwrap();
        assert!(matches!(ctx.destroy_resource(handle), Err(ResourceError::InvalidHandle(_))));
        assert!(matches!(ctx.resource_kind(handle), Err(ResourceError::InvalidHandle(_))));

        ctx.flush_staging_buffers().unwrap();
        assert_eq!(device.live_object_count(), 0);
        assert_eq!(device.live_allocation_count(), 0);
    }

    #[test]
    fn test_flush_requires_confirmed_transfers_and_is_idempotent() {
        let (device, ctx) = context();
        ctx.create_buffer(
            &BufferDesc::new(4, vk::BufferUsageFlags::UNIFORM_BUFFER),
            None,
            MemoryPolicy::DeviceLocal,
            Some(&GpuResourceData::new(&[1; 4])),
        )
        .unwrap();
        assert!(matches!(ctx.flush_staging_buffers(), Err(ResourceError::StaleTransfer { outstanding: 1, .. })));

        ctx.complete_pending_transfers().unwrap();
        assert_eq!(ctx.flush_staging_buffers().unwrap(), 1);
        let live = device.live_object_count();
        assert_eq!(ctx.flush_staging_buffers().unwrap(), 0);
        assert_eq!(device.live_object_count(), live);
        assert_eq!(ctx.transfer.arena_allocation_count(), 0);
    }

    #[test]
    fn test_staging_buffer_is_reused_after_confirmation() {
        let (device, ctx) = context();
        let desc = BufferDesc::new(16, vk::BufferUsageFlags::INDEX_BUFFER);
        let handle = ctx.create_buffer(&desc, None, MemoryPolicy::DeviceLocal, None).unwrap();

        ctx.set_buffer_data(handle, &GpuResourceData::new(&[1; 16])).unwrap();
        ctx.complete_pending_transfers().unwrap();
        let objects = device.live_object_count();

        ctx.set_buffer_data(handle, &GpuResourceData::new(&[2; 8])).unwrap();
        assert_eq!(device.live_object_count(), objects);
        ctx.complete_pending_transfers().unwrap();

        let mut expected = vec![2; 8];
        expected.extend([1; 8]);
        assert_eq!(device.buffer_contents(native_buffer(&ctx, handle)).unwrap(), expected);
    }

    #[test]
    fn test_image_mip_chain_upload() {
        let (device, ctx) = context();
        let desc = ImageDesc::new_2d(
            vk::Format::R8G8B8A8_UNORM,
            vk::Extent2D { width: 4, height: 2 },
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        )
        .with_mip_levels(3);
        // mip0: 4x2, mip1: 2x1, mip2: 1x1
        let mut data = vec![10u8; 32];
        data.extend([20u8; 8]);
        data.extend([30u8; 4]);

        let handle = ctx.create_image(&desc, None, MemoryPolicy::DeviceLocal, Some(&GpuResourceData::new(&data))).unwrap();
        ctx.complete_pending_transfers().unwrap();

        let image = native_image(&ctx, handle);
        assert_eq!(device.image_subresource_contents(image, 0, 0).unwrap(), vec![10; 32]);
        assert_eq!(device.image_subresource_contents(image, 1, 0).unwrap(), vec![20; 8]);
        assert_eq!(device.image_subresource_contents(image, 2, 0).unwrap(), vec![30; 4]);
        for mip in 0..3 {
            assert_eq!(device.image_layout(image, mip, 0), Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL));
        }

        // 第二次上传从 SHADER_READ_ONLY 开始转换
        ctx.set_image_data(handle, &GpuResourceData::new(&[7u8; 44])).unwrap();
        ctx.complete_pending_transfers().unwrap();
        assert_eq!(device.image_subresource_contents(image, 2, 0).unwrap(), vec![7; 4]);
    }

    #[test]
    fn test_image_default_view_and_destroy() {
        let (device, ctx) = context();
        let desc = ImageDesc::new_2d(
            vk::Format::R8G8B8A8_UNORM,
            vk::Extent2D { width: 8, height: 8 },
            vk::ImageUsageFlags::COLOR_ATTACHMENT,
        )
        .with_array_layers(2);
        let handle = ctx.create_image(&desc, None, MemoryPolicy::DeviceLocal, None).unwrap();

        match ctx.resource_info(handle).unwrap() {
            ResourceInfo::Image { view, .. } => {
                assert_eq!(view.view_type, vk::ImageViewType::TYPE_2D_ARRAY);
                assert_eq!(view.subresource_range.layer_count, 2);
            }
            other => panic!("unexpected info {other:?}"),
        }
        assert!(matches!(ctx.native_view_handle(handle).unwrap(), Some(NativeView::Image(_))));
        assert_eq!(device.live_object_count(), 2);

        ctx.destroy_resource(handle).unwrap();
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn test_wrong_kind_and_unsupported_copy() {
        let (_device, ctx) = context();
        let sampler = ctx.create_sampler(&SamplerDesc::default(), Some("linear")).unwrap();
        assert_eq!(ctx.resource_kind(sampler).unwrap(), ResourceKind::Sampler);
        assert_eq!(ctx.memory_policy(sampler).unwrap(), None);
        assert!(matches!(
            ctx.set_buffer_data(sampler, &GpuResourceData::new(&[1])),
            Err(ResourceError::WrongKind {
                expected: ResourceKind::Buffer,
                found: ResourceKind::Sampler
            })
        ));
        assert!(matches!(ctx.copy_resource(sampler, sampler), Err(ResourceError::NotImplemented(_))));
        assert!(matches!(ctx.create_resource_copy(sampler), Err(ResourceError::NotImplemented(_))));
        ctx.destroy_resource(sampler).unwrap();
    }

    #[test]
    fn test_user_data_is_kept() {
        let (_device, ctx) = context();
        let handle = ctx
            .create_named_buffer(
                &BufferDesc::new(4, vk::BufferUsageFlags::UNIFORM_BUFFER),
                None,
                MemoryPolicy::HostVisibleCoherent,
                None,
                "with-user-data",
                Some(Arc::new(42u32)),
            )
            .unwrap();
        let user_data = ctx.user_data(handle).unwrap().unwrap();
        assert_eq!(user_data.downcast_ref::<u32>(), Some(&42));
    }

    #[test]
    fn test_failed_submit_keeps_transfers_pending() {
        let (device, ctx) = context();
        let handle = ctx
            .create_buffer(
                &BufferDesc::new(4, vk::BufferUsageFlags::UNIFORM_BUFFER),
                None,
                MemoryPolicy::DeviceLocal,
                Some(&GpuResourceData::new(&[9; 4])),
            )
            .unwrap();
        device.fail_next_submit();
        assert!(matches!(ctx.complete_pending_transfers(), Err(ResourceError::Device(GfxError::Submit(_)))));
        assert_eq!(ctx.pending_transfer_count(), 1);

        assert_eq!(ctx.complete_pending_transfers().unwrap(), 1);
        assert_eq!(device.buffer_contents(native_buffer(&ctx, handle)).unwrap(), vec![9; 4]);
    }

    #[test]
    fn test_abort_pending_transfers_unblocks_channel() {
        let (device, ctx) = context();
        let handle = ctx
            .create_buffer(
                &BufferDesc::new(4, vk::BufferUsageFlags::UNIFORM_BUFFER),
                None,
                MemoryPolicy::DeviceLocal,
                Some(&GpuResourceData::new(&[9; 4])),
            )
            .unwrap();
        let other = ctx
            .create_buffer(
                &BufferDesc::new(4, vk::BufferUsageFlags::STORAGE_BUFFER),
                None,
                MemoryPolicy::HostVisibleCoherent,
                None,
            )
            .unwrap();
        device.fail_next_submit();
        assert!(ctx.complete_pending_transfers().is_err());
        assert!(matches!(ctx.destroy_resource(handle), Err(ResourceError::StaleTransfer { .. })));

        assert_eq!(ctx.abort_pending_transfers(), vec![handle]);
        assert_eq!(ctx.pending_transfer_count(), 0);
        assert_eq!(ctx.complete_pending_transfers().unwrap(), 0);
        assert_eq!(device.submission_count(), 0);

        // 被丢弃的资源可以重新上传
        ctx.set_buffer_data(handle, &GpuResourceData::new(&[5; 4])).unwrap();
        assert_eq!(ctx.complete_pending_transfers().unwrap(), 1);
        assert_eq!(device.buffer_contents(native_buffer(&ctx, handle)).unwrap(), vec![5; 4]);

        ctx.destroy_resource(other).unwrap();
        ctx.destroy_resource(handle).unwrap();
        assert_eq!(ctx.flush_staging_buffers().unwrap(), 1);
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn test_abort_reports_each_resource_once() {
        let (_device, ctx) = context();
        let desc = BufferDesc::new(4, vk::BufferUsageFlags::UNIFORM_BUFFER);
        let first = ctx
            .create_buffer(&desc, None, MemoryPolicy::DeviceLocal, Some(&GpuResourceData::new(&[1; 4])))
            .unwrap();
        let second = ctx
            .create_buffer(&desc, None, MemoryPolicy::DeviceLocal, Some(&GpuResourceData::new(&[2; 4])))
            .unwrap();
        ctx.set_buffer_data(first, &GpuResourceData::new(&[3; 4])).unwrap();
        assert_eq!(ctx.pending_transfer_count(), 3);

        assert_eq!(ctx.abort_pending_transfers(), vec![first, second]);
        assert!(ctx.abort_pending_transfers().is_empty());
    }

    #[test]
    fn test_unreplayable_image_upload_is_rejected_at_record_time() {
        let (device, ctx) = context();
        let handle = ctx
            .create_buffer(
                &BufferDesc::new(4, vk::BufferUsageFlags::UNIFORM_BUFFER),
                None,
                MemoryPolicy::DeviceLocal,
                Some(&GpuResourceData::new(&[9; 4])),
            )
            .unwrap();
        let live = device.live_object_count();

        let bc7 = ImageDesc::new_2d(
            vk::Format::BC7_UNORM_BLOCK,
            vk::Extent2D { width: 8, height: 8 },
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        );
        let result = ctx.create_image(&bc7, None, MemoryPolicy::DeviceLocal, Some(&GpuResourceData::new(&[0u8; 64])));
        assert!(matches!(result, Err(ResourceError::UnsupportedFormat(vk::Format::BC7_UNORM_BLOCK))));
        assert_eq!(device.live_object_count(), live);
        assert_eq!(ctx.pending_transfer_count(), 1);

        // 没有图像数据时压缩格式仍然可以创建
        let empty = ctx.create_image(&bc7, None, MemoryPolicy::DeviceLocal, None).unwrap();
        assert!(matches!(
            ctx.set_image_data(empty, &GpuResourceData::new(&[0u8; 64])),
            Err(ResourceError::UnsupportedFormat(_))
        ));

        assert_eq!(ctx.complete_pending_transfers().unwrap(), 1);
        assert_eq!(device.buffer_contents(native_buffer(&ctx, handle)).unwrap(), vec![9; 4]);
    }

    #[test]
    fn test_zero_extent_image_is_rejected() {
        let (device, ctx) = context();
        let desc = ImageDesc::new_2d(
            vk::Format::R8G8B8A8_UNORM,
            vk::Extent2D { width: 0, height: 4 },
            vk::ImageUsageFlags::SAMPLED,
        );
        assert!(matches!(
            ctx.create_image(&desc, None, MemoryPolicy::DeviceLocal, None),
            Err(ResourceError::InvalidData(_))
        ));
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn test_sparse_buffer_is_staged() {
        let (device, ctx) = context();
        let handle = ctx
            .create_buffer(
                &BufferDesc::new(8, vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST),
                None,
                MemoryPolicy::Sparse,
                Some(&GpuResourceData::new(&[4; 8])),
            )
            .unwrap();
        assert_eq!(ctx.memory_policy(handle).unwrap(), Some(MemoryPolicy::Sparse));
        assert_eq!(ctx.pending_transfer_count(), 1);

        let buffer = native_buffer(&ctx, handle);
        assert_eq!(device.buffer_contents(buffer).unwrap(), vec![0; 8]);
        assert_eq!(ctx.complete_pending_transfers().unwrap(), 1);
        assert_eq!(device.buffer_contents(buffer).unwrap(), vec![4; 8]);
    }

    #[test]
    fn test_host_visible_image_round_trip() {
        let (device, ctx) = context();
        let desc = ImageDesc::new_2d(
            vk::Format::R8G8B8A8_UNORM,
            vk::Extent2D { width: 2, height: 2 },
            vk::ImageUsageFlags::SAMPLED,
        );
        let pixels: Vec<u8> = (0..16).collect();
        let handle = ctx
            .create_image(&desc, None, MemoryPolicy::HostVisibleCoherent, Some(&GpuResourceData::new(&pixels)))
            .unwrap();
        assert_eq!(ctx.pending_transfer_count(), 0);
        assert_eq!(ctx.read_resource_memory(handle, 0, 16).unwrap(), pixels);

        let flipped: Vec<u8> = pixels.iter().rev().copied().collect();
        ctx.set_image_data(handle, &GpuResourceData::new(&flipped)).unwrap();
        assert_eq!(ctx.read_resource_memory(handle, 0, 16).unwrap(), flipped);
        assert_eq!(device.submission_count(), 0);
    }

    #[test]
    fn test_concurrent_staging_is_not_interleaved() {
        let (device, ctx) = context();
        let threads = 4;
        let per_thread = 8;

        std::thread::scope(|s| {
            for t in 0..threads {
                let ctx = &ctx;
                s.spawn(move || {
                    for i in 0..per_thread {
                        let byte = (t * per_thread + i) as u8;
                        ctx.create_buffer(
                            &BufferDesc::new(16, vk::BufferUsageFlags::STORAGE_BUFFER),
                            None,
                            MemoryPolicy::DeviceLocal,
                            Some(&GpuResourceData::new(&[byte; 16])),
                        )
                        .unwrap();
                    }
                });
            }
        });

        let staged = threads * per_thread;
        assert_eq!(ctx.pending_transfer_count(), staged);
        assert_eq!(ctx.transfer_stats().commands_recorded, 3 * staged as u64);
        assert_eq!(ctx.complete_pending_transfers().unwrap(), staged);
        assert_eq!(device.submitted_command_count(), 3 * staged);
    }

    #[test]
    fn test_drop_releases_everything() {
        let device = Arc::new(HeadlessDevice::new());
        {
            let ctx = ResourceContext::new(device.clone(), ResourceContextConfig::default());
            ctx.create_buffer(
                &BufferDesc::new(4, vk::BufferUsageFlags::UNIFORM_BUFFER),
                None,
                MemoryPolicy::DeviceLocal,
                Some(&GpuResourceData::new(&[1; 4])),
            )
            .unwrap();
            ctx.create_sampler(&SamplerDesc::default(), None).unwrap();
        }
        assert_eq!(device.live_object_count(), 0);
        assert_eq!(device.live_allocation_count(), 0);
    }
}
