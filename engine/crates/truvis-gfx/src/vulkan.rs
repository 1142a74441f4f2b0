//! 基于 ash + vk-mem 的 GfxDevice
//!
//! 内存分配完全交给 VMA，只通过 `required_flags` 指定 memory property，
//! 不设置 usage 和 preferred flags，因此 memory type 完全由 MemoryPolicy 决定。
//!
//! 传输命令流在提交时回放到一个 one-time command buffer，提交到 transfer queue 后等待 fence。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use ash::vk;
use vk_mem::Alloc;

use crate::commands::transfer_command::TransferCommand;
use crate::device::{AllocationTarget, GfxDevice};
use crate::error::{GfxError, GfxResult};
use crate::memory::{AllocationId, AllocationRequirements, DeviceAllocation};
use crate::resources::desc::{BufferDesc, BufferViewDesc, ImageDesc, ImageViewDesc, SamplerDesc};

/// command pool 和 fence 需要外部同步，提交时整体加锁
struct TransferSubmitter {
    command_pool: vk::CommandPool,
    fence: vk::Fence,
}

pub struct VulkanDevice {
    device: ash::Device,
    allocator: vk_mem::Allocator,
    transfer_queue: vk::Queue,

    submitter: Mutex<TransferSubmitter>,
    allocations: Mutex<HashMap<AllocationId, vk_mem::Allocation>>,
    next_allocation_id: AtomicU64,
}

// new & init
impl VulkanDevice {
    /// 由于 vma 的生命周期设定：需要引用 Instance 以及 Device，
    /// 调用方需要保证 `instance` 的生命周期长于返回的 VulkanDevice
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        transfer_queue_family: u32,
        transfer_queue: vk::Queue,
    ) -> GfxResult<Self> {
        let mut vma_ci = vk_mem::AllocatorCreateInfo::new(instance, &device, physical_device);
        vma_ci.vulkan_api_version = vk::API_VERSION_1_3;
        let allocator = unsafe { vk_mem::Allocator::new(vma_ci) }.map_err(|result| GfxError::ObjectCreation {
            object: "memory allocator",
            result,
        })?;

        let pool_ci = vk::CommandPoolCreateInfo::default()
            .queue_family_index(transfer_queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_ci, None) }.map_err(|result| {
            GfxError::ObjectCreation {
                object: "command pool",
                result,
            }
        })?;
        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }.map_err(|result| {
            unsafe { device.destroy_command_pool(command_pool, None) };
            GfxError::ObjectCreation { object: "fence", result }
        })?;

        Ok(Self {
            device,
            allocator,
            transfer_queue,
            submitter: Mutex::new(TransferSubmitter { command_pool, fence }),
            allocations: Mutex::new(HashMap::new()),
            next_allocation_id: AtomicU64::new(1),
        })
    }

    fn allocations(&self) -> MutexGuard<'_, HashMap<AllocationId, vk_mem::Allocation>> {
        self.allocations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 映射一段内存，在闭包中访问后立刻解除映射
    fn with_mapped<R>(
        &self,
        allocation: &DeviceAllocation,
        offset: vk::DeviceSize,
        len: u64,
        f: impl FnOnce(*mut u8) -> R,
    ) -> GfxResult<R> {
        if !allocation.is_host_visible() {
            return Err(GfxError::NotHostVisible {
                flags: allocation.property_flags,
            });
        }
        if offset.checked_add(len).is_none_or(|end| end > allocation.size) {
            return Err(GfxError::OutOfRange {
                offset,
                len,
                size: allocation.size,
            });
        }

        let mut allocations = self.allocations();
        let vma_allocation = allocations
            .get_mut(&allocation.id)
            .ok_or_else(|| GfxError::UnknownObject(format!("allocation {}", allocation.id.0)))?;
        unsafe {
            let ptr = self.allocator.map_memory(vma_allocation).map_err(GfxError::Submit)?;
            let result = f(ptr.add(offset as usize));
            self.allocator.unmap_memory(vma_allocation);
            Ok(result)
        }
    }

    fn record(&self, command_buffer: vk::CommandBuffer, command: &TransferCommand) {
        unsafe {
            match command {
                TransferCommand::BufferBarrier(barrier) => {
                    let barriers = [barrier.to_vk()];
                    let dependency_info = vk::DependencyInfo::default().buffer_memory_barriers(&barriers);
                    self.device.cmd_pipeline_barrier2(command_buffer, &dependency_info);
                }
                TransferCommand::ImageBarrier(barrier) => {
                    let barriers = [barrier.to_vk()];
                    let dependency_info = vk::DependencyInfo::default().image_memory_barriers(&barriers);
                    self.device.cmd_pipeline_barrier2(command_buffer, &dependency_info);
                }
                TransferCommand::CopyBuffer { src, dst, regions } => {
                    self.device.cmd_copy_buffer(command_buffer, *src, *dst, regions);
                }
                TransferCommand::CopyBufferToImage {
                    src,
                    dst,
                    dst_layout,
                    regions,
                } => {
                    self.device.cmd_copy_buffer_to_image(command_buffer, *src, *dst, *dst_layout, regions);
                }
            }
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        let submitter = self.submitter.get_mut().unwrap_or_else(PoisonError::into_inner);
        unsafe {
            self.device.destroy_fence(submitter.fence, None);
            self.device.destroy_command_pool(submitter.command_pool, None);
        }
        let allocations = self.allocations.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !allocations.is_empty() {
            log::warn!("{} allocations still alive when the device is dropped", allocations.len());
            for (_, mut allocation) in allocations.drain() {
                unsafe { self.allocator.free_memory(&mut allocation) };
            }
        }
    }
}

impl GfxDevice for VulkanDevice {
    fn create_buffer(&self, desc: &BufferDesc, name: Option<&str>) -> GfxResult<vk::Buffer> {
        let buffer = unsafe { self.device.create_buffer(&desc.to_vk(), None) }
            .map_err(|result| GfxError::ObjectCreation { object: "buffer", result })?;
        log::debug!("create buffer {:?} ({} bytes) {:?}", buffer, desc.size, name);
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn create_buffer_view(&self, buffer: vk::Buffer, desc: &BufferViewDesc) -> GfxResult<vk::BufferView> {
        unsafe { self.device.create_buffer_view(&desc.to_vk(buffer), None) }.map_err(|result| {
            GfxError::ObjectCreation {
                object: "buffer view",
                result,
            }
        })
    }

    fn destroy_buffer_view(&self, view: vk::BufferView) {
        unsafe { self.device.destroy_buffer_view(view, None) };
    }

    fn create_image(&self, desc: &ImageDesc, name: Option<&str>) -> GfxResult<vk::Image> {
        let image = unsafe { self.device.create_image(&desc.to_vk(), None) }
            .map_err(|result| GfxError::ObjectCreation { object: "image", result })?;
        log::debug!("create image {:?} {:?} {:?}", image, desc.extent, name);
        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) };
    }

    fn create_image_view(&self, image: vk::Image, desc: &ImageViewDesc) -> GfxResult<vk::ImageView> {
        unsafe { self.device.create_image_view(&desc.to_vk(image), None) }.map_err(|result| {
            GfxError::ObjectCreation {
                object: "image view",
                result,
            }
        })
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_sampler(&self, desc: &SamplerDesc, _name: Option<&str>) -> GfxResult<vk::Sampler> {
        unsafe { self.device.create_sampler(&desc.to_vk(), None) }
            .map_err(|result| GfxError::ObjectCreation { object: "sampler", result })
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    fn allocate_and_bind(
        &self,
        target: AllocationTarget,
        requirements: &AllocationRequirements,
    ) -> GfxResult<DeviceAllocation> {
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::Unknown,
            required_flags: requirements.required_flags,
            ..Default::default()
        };
        let allocation_error = |result| GfxError::Allocation {
            required: requirements.required_flags,
            result,
        };

        let mut allocation = unsafe {
            match target {
                AllocationTarget::Buffer(buffer) => self.allocator.allocate_memory_for_buffer(buffer, &alloc_ci),
                AllocationTarget::Image(image) => self.allocator.allocate_memory_for_image(image, &alloc_ci),
            }
        }
        .map_err(allocation_error)?;

        let bind_result = unsafe {
            match target {
                AllocationTarget::Buffer(buffer) => self.allocator.bind_buffer_memory(&mut allocation, buffer),
                AllocationTarget::Image(image) => self.allocator.bind_image_memory(&mut allocation, image),
            }
        };
        if let Err(result) = bind_result {
            unsafe { self.allocator.free_memory(&mut allocation) };
            return Err(allocation_error(result));
        }

        let (info, property_flags) = unsafe {
            (
                self.allocator.get_allocation_info(&allocation),
                self.allocator.get_allocation_memory_properties(&allocation),
            )
        };
        let id = AllocationId(self.next_allocation_id.fetch_add(1, Ordering::Relaxed));
        self.allocations().insert(id, allocation);

        Ok(DeviceAllocation {
            id,
            memory: info.device_memory,
            offset: info.offset,
            size: info.size,
            property_flags,
        })
    }

    fn free_allocation(&self, allocation: &DeviceAllocation) {
        match self.allocations().remove(&allocation.id) {
            Some(mut vma_allocation) => unsafe { self.allocator.free_memory(&mut vma_allocation) },
            None => log::warn!("free unknown allocation {}", allocation.id.0),
        }
    }

    fn write_mapped(&self, allocation: &DeviceAllocation, offset: vk::DeviceSize, data: &[u8]) -> GfxResult<()> {
        self.with_mapped(allocation, offset, data.len() as u64, |ptr| unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
        })
    }

    fn read_mapped(&self, allocation: &DeviceAllocation, offset: vk::DeviceSize, len: usize) -> GfxResult<Vec<u8>> {
        self.with_mapped(allocation, offset, len as u64, |ptr| unsafe {
            std::slice::from_raw_parts(ptr as *const u8, len).to_vec()
        })
    }

    fn flush_mapped(
        &self,
        allocation: &DeviceAllocation,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> GfxResult<()> {
        let allocations = self.allocations();
        let vma_allocation = allocations
            .get(&allocation.id)
            .ok_or_else(|| GfxError::UnknownObject(format!("allocation {}", allocation.id.0)))?;
        unsafe { self.allocator.flush_allocation(vma_allocation, offset, size) }.map_err(GfxError::Submit)
    }

    fn submit_transfers(&self, commands: &[TransferCommand]) -> GfxResult<()> {
        let _span = tracy_client::span!("VulkanDevice::submit_transfers");
        let submitter = self.submitter.lock().unwrap_or_else(PoisonError::into_inner);

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(submitter.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|result| GfxError::ObjectCreation {
                object: "command buffer",
                result,
            })?[0];
        // 无论提交成功与否都释放 one-time command buffer
        scopeguard::defer! {
            unsafe { self.device.free_command_buffers(submitter.command_pool, &[command_buffer]) };
        }

        unsafe {
            let begin_info =
                vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device.begin_command_buffer(command_buffer, &begin_info).map_err(GfxError::Submit)?;
            for command in commands {
                self.record(command_buffer, command);
            }
            self.device.end_command_buffer(command_buffer).map_err(GfxError::Submit)?;

            let command_buffer_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(command_buffer)];
            let submit_info = vk::SubmitInfo2::default().command_buffer_infos(&command_buffer_infos);
            self.device
                .queue_submit2(self.transfer_queue, std::slice::from_ref(&submit_info), submitter.fence)
                .map_err(GfxError::Submit)?;
            self.device
                .wait_for_fences(std::slice::from_ref(&submitter.fence), true, u64::MAX)
                .map_err(GfxError::Submit)?;
            self.device.reset_fences(std::slice::from_ref(&submitter.fence)).map_err(GfxError::Submit)?;
        }
        Ok(())
    }
}
