//! 纯软件实现的 GfxDevice
//!
//! - 每个分配都是一段真实的 host 内存，映射读写和 buffer 拷贝逐字节生效
//! - image 的内容按 (mip, layer) 紧密排列保存，layout 按 subresource 跟踪，
//!   拷贝到 image 时要求目标 subresource 处于 TRANSFER_DST_OPTIMAL 或 GENERAL
//! - 提供失败注入和若干观察接口，供上层测试使用

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use ash::vk;
use ash::vk::Handle;

use crate::commands::barrier::{BufferBarrierDesc, ImageBarrierDesc};
use crate::commands::transfer_command::TransferCommand;
use crate::device::{AllocationTarget, GfxDevice};
use crate::error::{GfxError, GfxResult};
use crate::memory::{AllocationId, AllocationRequirements, DeviceAllocation};
use crate::resources::desc::{BufferDesc, BufferViewDesc, ImageDesc, ImageViewDesc, SamplerDesc, format_texel_size};

/// 默认的 memory type 列表，按 memory type index 排列
pub const DEFAULT_MEMORY_TYPES: [vk::MemoryPropertyFlags; 3] = [
    vk::MemoryPropertyFlags::DEVICE_LOCAL,
    vk::MemoryPropertyFlags::from_raw(
        vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_CACHED.as_raw(),
    ),
    vk::MemoryPropertyFlags::from_raw(
        vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
    ),
];

struct HeadlessBuffer {
    size: vk::DeviceSize,
    allocation: Option<AllocationId>,
}

#[derive(Clone)]
struct HeadlessImage {
    desc: ImageDesc,
    /// 下标为 `mip * array_layers + layer`
    layouts: Vec<vk::ImageLayout>,
    contents: HashMap<(u32, u32), Vec<u8>>,
}

impl HeadlessImage {
    fn subresource_index(&self, mip: u32, layer: u32) -> usize {
        (mip * self.desc.array_layers + layer) as usize
    }
}

#[derive(Clone)]
struct HeadlessAllocation {
    bytes: Vec<u8>,
    property_flags: vk::MemoryPropertyFlags,
}

#[derive(Default)]
struct HeadlessState {
    next_handle: u64,

    buffers: HashMap<u64, HeadlessBuffer>,
    images: HashMap<u64, HeadlessImage>,
    buffer_views: HashSet<u64>,
    image_views: HashSet<u64>,
    samplers: HashSet<u64>,
    allocations: HashMap<AllocationId, HeadlessAllocation>,

    requested_flags: Vec<vk::MemoryPropertyFlags>,
    flush_count: usize,
    submitted_batches: Vec<usize>,

    /// 剩余多少次 create 调用成功之后失败一次
    fail_create_countdown: Option<usize>,
    fail_next_allocation: bool,
    fail_next_submit: bool,
}

impl HeadlessState {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn take_create_failure(&mut self, object: &'static str) -> GfxResult<()> {
        match self.fail_create_countdown {
            Some(0) => {
                self.fail_create_countdown = None;
                Err(GfxError::ObjectCreation {
                    object,
                    result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
                })
            }
            Some(n) => {
                self.fail_create_countdown = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn allocation_mut(&mut self, id: AllocationId) -> GfxResult<&mut HeadlessAllocation> {
        self.allocations.get_mut(&id).ok_or_else(|| GfxError::UnknownObject(format!("allocation {}", id.0)))
    }

    fn buffer_allocation(&self, buffer: vk::Buffer) -> GfxResult<AllocationId> {
        self.buffers
            .get(&buffer.as_raw())
            .and_then(|b| b.allocation)
            .ok_or_else(|| GfxError::InvalidCommand(format!("buffer {:#x} is unknown or has no memory", buffer.as_raw())))
    }

    fn apply(&mut self, command: &TransferCommand) -> GfxResult<()> {
        match command {
            TransferCommand::BufferBarrier(barrier) => self.apply_buffer_barrier(barrier),
            TransferCommand::ImageBarrier(barrier) => self.apply_image_barrier(barrier),
            TransferCommand::CopyBuffer { src, dst, regions } => {
                let src_id = self.buffer_allocation(*src)?;
                let dst_id = self.buffer_allocation(*dst)?;
                for region in regions {
                    let chunk = {
                        let src_bytes = &self.allocation_mut(src_id)?.bytes;
                        checked_range(src_bytes.len(), region.src_offset, region.size)
                            .map(|range| src_bytes[range].to_vec())?
                    };
                    let dst_bytes = &mut self.allocation_mut(dst_id)?.bytes;
                    let range = checked_range(dst_bytes.len(), region.dst_offset, region.size)?;
                    dst_bytes[range].copy_from_slice(&chunk);
                }
                Ok(())
            }
            TransferCommand::CopyBufferToImage {
                src,
                dst,
                dst_layout,
                regions,
            } => {
                let src_id = self.buffer_allocation(*src)?;
                let src_bytes = self.allocation_mut(src_id)?.bytes.clone();
                let image = self
                    .images
                    .get_mut(&dst.as_raw())
                    .ok_or_else(|| GfxError::InvalidCommand(format!("image {:#x} is unknown", dst.as_raw())))?;
                if *dst_layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL && *dst_layout != vk::ImageLayout::GENERAL {
                    return Err(GfxError::InvalidCommand(format!("copy destination layout {dst_layout:?}")));
                }
                for region in regions {
                    copy_region_to_image(&src_bytes, image, *dst_layout, region)?;
                }
                Ok(())
            }
        }
    }

    fn apply_buffer_barrier(&mut self, barrier: &BufferBarrierDesc) -> GfxResult<()> {
        if !self.buffers.contains_key(&barrier.buffer.as_raw()) {
            return Err(GfxError::InvalidCommand(format!("barrier on unknown buffer {:#x}", barrier.buffer.as_raw())));
        }
        Ok(())
    }

    fn apply_image_barrier(&mut self, barrier: &ImageBarrierDesc) -> GfxResult<()> {
        let image = self.images.get_mut(&barrier.image.as_raw()).ok_or_else(|| {
            GfxError::InvalidCommand(format!("barrier on unknown image {:#x}", barrier.image.as_raw()))
        })?;
        let range = barrier.subresource_range;
        let level_count = resolve_count(range.level_count, range.base_mip_level, image.desc.mip_levels);
        let layer_count = resolve_count(range.layer_count, range.base_array_layer, image.desc.array_layers);
        for mip in range.base_mip_level..range.base_mip_level + level_count {
            for layer in range.base_array_layer..range.base_array_layer + layer_count {
                let index = image.subresource_index(mip, layer);
                let current = image.layouts.get(index).copied().ok_or_else(|| {
                    GfxError::InvalidCommand(format!("subresource (mip {mip}, layer {layer}) out of range"))
                })?;
                let old = barrier.src_state.layout;
                if old != vk::ImageLayout::UNDEFINED && old != current {
                    return Err(GfxError::InvalidCommand(format!(
                        "image barrier expects {old:?} but subresource (mip {mip}, layer {layer}) is {current:?}"
                    )));
                }
                image.layouts[index] = barrier.dst_state.layout;
            }
        }
        Ok(())
    }
}

fn resolve_count(count: u32, base: u32, total: u32) -> u32 {
    if count == vk::REMAINING_MIP_LEVELS { total.saturating_sub(base) } else { count }
}

fn checked_range(len: usize, offset: vk::DeviceSize, size: vk::DeviceSize) -> GfxResult<std::ops::Range<usize>> {
    let end = offset.checked_add(size).filter(|end| *end <= len as u64).ok_or(GfxError::OutOfRange {
        offset,
        len: size,
        size: len as u64,
    })?;
    Ok(offset as usize..end as usize)
}

fn copy_region_to_image(
    src_bytes: &[u8],
    image: &mut HeadlessImage,
    dst_layout: vk::ImageLayout,
    region: &vk::BufferImageCopy,
) -> GfxResult<()> {
    let desc = image.desc;
    let texel = format_texel_size(desc.format).ok_or(GfxError::UnsupportedFormat(desc.format))? as u64;
    let sub = region.image_subresource;
    if sub.mip_level >= desc.mip_levels || sub.base_array_layer + sub.layer_count > desc.array_layers {
        return Err(GfxError::InvalidCommand(format!(
            "copy region (mip {}, layers {}..{}) outside image",
            sub.mip_level,
            sub.base_array_layer,
            sub.base_array_layer + sub.layer_count
        )));
    }

    let mip_extent = desc.mip_extent(sub.mip_level);
    let extent = region.image_extent;
    let offset = region.image_offset;
    if offset.x < 0
        || offset.y < 0
        || offset.z < 0
        || offset.x as u32 + extent.width > mip_extent.width
        || offset.y as u32 + extent.height > mip_extent.height
        || offset.z as u32 + extent.depth > mip_extent.depth
    {
        return Err(GfxError::InvalidCommand(format!("copy extent {extent:?} exceeds mip extent {mip_extent:?}")));
    }

    let row_length = if region.buffer_row_length == 0 { extent.width } else { region.buffer_row_length } as u64;
    let image_height = if region.buffer_image_height == 0 { extent.height } else { region.buffer_image_height } as u64;
    let layer_stride = row_length * image_height * extent.depth as u64 * texel;
    let row_bytes = extent.width as u64 * texel;

    for i in 0..sub.layer_count {
        let layer = sub.base_array_layer + i;
        let index = image.subresource_index(sub.mip_level, layer);
        if image.layouts[index] != dst_layout {
            return Err(GfxError::InvalidCommand(format!(
                "copy to subresource (mip {}, layer {layer}) in layout {:?}, expected {dst_layout:?}",
                sub.mip_level, image.layouts[index]
            )));
        }

        let mip_size = mip_extent.width as u64 * mip_extent.height as u64 * mip_extent.depth as u64 * texel;
        let contents = image.contents.entry((sub.mip_level, layer)).or_insert_with(|| vec![0; mip_size as usize]);
        for z in 0..extent.depth as u64 {
            for y in 0..extent.height as u64 {
                let src_offset = region.buffer_offset + i as u64 * layer_stride + (z * image_height + y) * row_length * texel;
                let src = checked_range(src_bytes.len(), src_offset, row_bytes)?;

                let dst_z = offset.z as u64 + z;
                let dst_y = offset.y as u64 + y;
                let dst_offset = ((dst_z * mip_extent.height as u64 + dst_y) * mip_extent.width as u64
                    + offset.x as u64)
                    * texel;
                let dst = checked_range(contents.len(), dst_offset, row_bytes)?;
                contents[dst].copy_from_slice(&src_bytes[src]);
            }
        }
    }
    Ok(())
}

/// image 的分配大小：所有 subresource 紧密排列，未知格式按 4 字节 texel 估算
fn image_allocation_size(desc: &ImageDesc) -> vk::DeviceSize {
    let texel = format_texel_size(desc.format).unwrap_or(4) as u64;
    (0..desc.mip_levels)
        .map(|mip| {
            let e = desc.mip_extent(mip);
            e.width as u64 * e.height as u64 * e.depth as u64 * texel
        })
        .sum::<u64>()
        * desc.array_layers as u64
}

pub struct HeadlessDevice {
    memory_types: Vec<vk::MemoryPropertyFlags>,
    state: Mutex<HeadlessState>,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

// new & init
impl HeadlessDevice {
    pub fn new() -> Self {
        Self::with_memory_types(DEFAULT_MEMORY_TYPES.to_vec())
    }

    /// 使用自定义的 memory type 列表，例如模拟没有 DEVICE_LOCAL 内存的设备
    pub fn with_memory_types(memory_types: Vec<vk::MemoryPropertyFlags>) -> Self {
        Self {
            memory_types,
            state: Mutex::new(HeadlessState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, HeadlessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// 失败注入
impl HeadlessDevice {
    /// 下一次 create_* 调用失败
    pub fn fail_next_create(&self) {
        self.fail_create_after(0);
    }

    /// 接下来的 `successes` 次 create_* 调用成功，之后的一次失败
    pub fn fail_create_after(&self, successes: usize) {
        self.state().fail_create_countdown = Some(successes);
    }

    /// 下一次 allocate_and_bind 调用失败
    pub fn fail_next_allocation(&self) {
        self.state().fail_next_allocation = true;
    }

    /// 下一次 submit_transfers 调用失败，命令不会被执行
    pub fn fail_next_submit(&self) {
        self.state().fail_next_submit = true;
    }
}

// 观察接口
impl HeadlessDevice {
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        let state = self.state();
        let id = state.buffers.get(&buffer.as_raw())?.allocation?;
        state.allocations.get(&id).map(|a| a.bytes.clone())
    }

    /// 某个 subresource 紧密排列的内容，从未被写入时返回 None
    pub fn image_subresource_contents(&self, image: vk::Image, mip: u32, layer: u32) -> Option<Vec<u8>> {
        self.state().images.get(&image.as_raw())?.contents.get(&(mip, layer)).cloned()
    }

    pub fn image_layout(&self, image: vk::Image, mip: u32, layer: u32) -> Option<vk::ImageLayout> {
        let state = self.state();
        let image = state.images.get(&image.as_raw())?;
        image.layouts.get(image.subresource_index(mip, layer)).copied()
    }

    /// 还未销毁的 native object 数量（buffer、image、view、sampler）
    pub fn live_object_count(&self) -> usize {
        let state = self.state();
        state.buffers.len()
            + state.images.len()
            + state.buffer_views.len()
            + state.image_views.len()
            + state.samplers.len()
    }

    pub fn live_allocation_count(&self) -> usize {
        self.state().allocations.len()
    }

    /// 每次 allocate_and_bind 请求的 required flags，按调用顺序
    pub fn requested_flags_log(&self) -> Vec<vk::MemoryPropertyFlags> {
        self.state().requested_flags.clone()
    }

    pub fn flush_count(&self) -> usize {
        self.state().flush_count
    }

    pub fn submission_count(&self) -> usize {
        self.state().submitted_batches.len()
    }

    /// 所有成功提交的批次中的命令总数
    pub fn submitted_command_count(&self) -> usize {
        self.state().submitted_batches.iter().sum()
    }
}

impl GfxDevice for HeadlessDevice {
    fn create_buffer(&self, desc: &BufferDesc, name: Option<&str>) -> GfxResult<vk::Buffer> {
        let mut state = self.state();
        state.take_create_failure("buffer")?;
        let handle = state.next_handle();
        state.buffers.insert(
            handle,
            HeadlessBuffer {
                size: desc.size,
                allocation: None,
            },
        );
        log::trace!("headless: create buffer {handle:#x} ({} bytes) {:?}", desc.size, name);
        Ok(vk::Buffer::from_raw(handle))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        if self.state().buffers.remove(&buffer.as_raw()).is_none() {
            log::warn!("headless: destroy unknown buffer {:#x}", buffer.as_raw());
        }
    }

    fn create_buffer_view(&self, buffer: vk::Buffer, _desc: &BufferViewDesc) -> GfxResult<vk::BufferView> {
        let mut state = self.state();
        state.take_create_failure("buffer view")?;
        if !state.buffers.contains_key(&buffer.as_raw()) {
            return Err(GfxError::UnknownObject(format!("buffer {:#x}", buffer.as_raw())));
        }
        let handle = state.next_handle();
        state.buffer_views.insert(handle);
        Ok(vk::BufferView::from_raw(handle))
    }

    fn destroy_buffer_view(&self, view: vk::BufferView) {
        self.state().buffer_views.remove(&view.as_raw());
    }

    fn create_image(&self, desc: &ImageDesc, name: Option<&str>) -> GfxResult<vk::Image> {
        let mut state = self.state();
        state.take_create_failure("image")?;
        let handle = state.next_handle();
        state.images.insert(
            handle,
            HeadlessImage {
                desc: *desc,
                layouts: vec![vk::ImageLayout::UNDEFINED; desc.subresource_count() as usize],
                contents: HashMap::new(),
            },
        );
        log::trace!("headless: create image {handle:#x} {:?} {:?}", desc.extent, name);
        Ok(vk::Image::from_raw(handle))
    }

    fn destroy_image(&self, image: vk::Image) {
        if self.state().images.remove(&image.as_raw()).is_none() {
            log::warn!("headless: destroy unknown image {:#x}", image.as_raw());
        }
    }

    fn create_image_view(&self, image: vk::Image, _desc: &ImageViewDesc) -> GfxResult<vk::ImageView> {
        let mut state = self.state();
        state.take_create_failure("image view")?;
        if !state.images.contains_key(&image.as_raw()) {
            return Err(GfxError::UnknownObject(format!("image {:#x}", image.as_raw())));
        }
        let handle = state.next_handle();
        state.image_views.insert(handle);
        Ok(vk::ImageView::from_raw(handle))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state().image_views.remove(&view.as_raw());
    }

    fn create_sampler(&self, _desc: &SamplerDesc, _name: Option<&str>) -> GfxResult<vk::Sampler> {
        let mut state = self.state();
        state.take_create_failure("sampler")?;
        let handle = state.next_handle();
        state.samplers.insert(handle);
        Ok(vk::Sampler::from_raw(handle))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.state().samplers.remove(&sampler.as_raw());
    }

    fn allocate_and_bind(
        &self,
        target: AllocationTarget,
        requirements: &AllocationRequirements,
    ) -> GfxResult<DeviceAllocation> {
        let mut state = self.state();
        state.requested_flags.push(requirements.required_flags);

        let allocation_error = |result| GfxError::Allocation {
            required: requirements.required_flags,
            result,
        };
        if std::mem::take(&mut state.fail_next_allocation) {
            return Err(allocation_error(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        let property_flags = self
            .memory_types
            .iter()
            .copied()
            .find(|flags| flags.contains(requirements.required_flags))
            .ok_or_else(|| allocation_error(vk::Result::ERROR_FEATURE_NOT_PRESENT))?;

        let size = match target {
            AllocationTarget::Buffer(buffer) => state
                .buffers
                .get(&buffer.as_raw())
                .map(|b| b.size)
                .ok_or_else(|| GfxError::UnknownObject(format!("buffer {:#x}", buffer.as_raw())))?,
            AllocationTarget::Image(image) => state
                .images
                .get(&image.as_raw())
                .map(|i| image_allocation_size(&i.desc))
                .ok_or_else(|| GfxError::UnknownObject(format!("image {:#x}", image.as_raw())))?,
        };

        let id = AllocationId(state.next_handle());
        state.allocations.insert(
            id,
            HeadlessAllocation {
                bytes: vec![0; size as usize],
                property_flags,
            },
        );
        if let AllocationTarget::Buffer(buffer) = target {
            if let Some(b) = state.buffers.get_mut(&buffer.as_raw()) {
                b.allocation = Some(id);
            }
        }

        Ok(DeviceAllocation {
            id,
            memory: vk::DeviceMemory::from_raw(id.0),
            offset: 0,
            size,
            property_flags,
        })
    }

    fn free_allocation(&self, allocation: &DeviceAllocation) {
        if self.state().allocations.remove(&allocation.id).is_none() {
            log::warn!("headless: free unknown allocation {}", allocation.id.0);
        }
    }

    fn write_mapped(&self, allocation: &DeviceAllocation, offset: vk::DeviceSize, data: &[u8]) -> GfxResult<()> {
        let mut state = self.state();
        let memory = state.allocation_mut(allocation.id)?;
        if !memory.property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(GfxError::NotHostVisible {
                flags: memory.property_flags,
            });
        }
        let range = checked_range(memory.bytes.len(), offset, data.len() as u64)?;
        memory.bytes[range].copy_from_slice(data);
        Ok(())
    }

    fn read_mapped(&self, allocation: &DeviceAllocation, offset: vk::DeviceSize, len: usize) -> GfxResult<Vec<u8>> {
        let mut state = self.state();
        let memory = state.allocation_mut(allocation.id)?;
        if !memory.property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(GfxError::NotHostVisible {
                flags: memory.property_flags,
            });
        }
        let range = checked_range(memory.bytes.len(), offset, len as u64)?;
        Ok(memory.bytes[range].to_vec())
    }

    fn flush_mapped(
        &self,
        allocation: &DeviceAllocation,
        _offset: vk::DeviceSize,
        _size: vk::DeviceSize,
    ) -> GfxResult<()> {
        let mut state = self.state();
        state.allocation_mut(allocation.id)?;
        state.flush_count += 1;
        Ok(())
    }

    fn submit_transfers(&self, commands: &[TransferCommand]) -> GfxResult<()> {
        let mut state = self.state();
        if std::mem::take(&mut state.fail_next_submit) {
            return Err(GfxError::Submit(vk::Result::ERROR_DEVICE_LOST));
        }
        // 整批命令要么全部生效，要么全部不生效
        let images = state.images.clone();
        let allocations = state.allocations.clone();
        if let Err(e) = commands.iter().try_for_each(|command| state.apply(command)) {
            state.images = images;
            state.allocations = allocations;
            return Err(e);
        }
        state.submitted_batches.push(commands.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryPolicy;
    use crate::resources::resource_state::ImageState;

    fn host_buffer(device: &HeadlessDevice, size: u64) -> (vk::Buffer, DeviceAllocation) {
        let buffer = device
            .create_buffer(&BufferDesc::new(size, vk::BufferUsageFlags::TRANSFER_SRC), Some("staging"))
            .unwrap();
        let allocation = device
            .allocate_and_bind(AllocationTarget::Buffer(buffer), &MemoryPolicy::HostVisibleCoherent.into())
            .unwrap();
        (buffer, allocation)
    }

    #[test]
    fn test_allocation_picks_first_matching_type() {
        let device = HeadlessDevice::new();
        let (_, allocation) = host_buffer(&device, 16);
        assert!(allocation.property_flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT));

        let buffer = device.create_buffer(&BufferDesc::new(16, vk::BufferUsageFlags::UNIFORM_BUFFER), None).unwrap();
        let allocation =
            device.allocate_and_bind(AllocationTarget::Buffer(buffer), &MemoryPolicy::HostVisible.into()).unwrap();
        assert!(!allocation.property_flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT));
    }

    #[test]
    fn test_allocation_without_matching_type_fails() {
        let device = HeadlessDevice::with_memory_types(vec![vk::MemoryPropertyFlags::HOST_VISIBLE]);
        let buffer = device.create_buffer(&BufferDesc::new(16, vk::BufferUsageFlags::STORAGE_BUFFER), None).unwrap();
        let result = device.allocate_and_bind(AllocationTarget::Buffer(buffer), &MemoryPolicy::DeviceLocal.into());
        assert!(matches!(result, Err(GfxError::Allocation { .. })));
    }

    #[test]
    fn test_mapped_write_and_read_back() {
        let device = HeadlessDevice::new();
        let (buffer, allocation) = host_buffer(&device, 8);
        device.write_mapped(&allocation, 2, &[9, 8, 7]).unwrap();
        assert_eq!(device.read_mapped(&allocation, 2, 3).unwrap(), vec![9, 8, 7]);
        assert_eq!(device.buffer_contents(buffer).unwrap(), vec![0, 0, 9, 8, 7, 0, 0, 0]);
        assert!(matches!(device.write_mapped(&allocation, 6, &[1, 2, 3]), Err(GfxError::OutOfRange { .. })));
    }

    #[test]
    fn test_device_local_memory_is_not_mappable() {
        let device = HeadlessDevice::new();
        let buffer = device.create_buffer(&BufferDesc::new(4, vk::BufferUsageFlags::VERTEX_BUFFER), None).unwrap();
        let allocation =
            device.allocate_and_bind(AllocationTarget::Buffer(buffer), &MemoryPolicy::DeviceLocal.into()).unwrap();
        assert!(matches!(device.write_mapped(&allocation, 0, &[1]), Err(GfxError::NotHostVisible { .. })));
    }

    #[test]
    fn test_copy_to_image_requires_transfer_dst_layout() {
        let device = HeadlessDevice::new();
        let (staging, allocation) = host_buffer(&device, 16);
        device.write_mapped(&allocation, 0, &(0u8..16).collect::<Vec<_>>()).unwrap();

        let desc = ImageDesc::new_2d(
            vk::Format::R8G8B8A8_UNORM,
            vk::Extent2D { width: 2, height: 2 },
            vk::ImageUsageFlags::SAMPLED,
        );
        let image = device.create_image(&desc, None).unwrap();
        device.allocate_and_bind(AllocationTarget::Image(image), &MemoryPolicy::DeviceLocal.into()).unwrap();

        let region = vk::BufferImageCopy {
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_extent: desc.extent,
            ..Default::default()
        };
        let copy = TransferCommand::CopyBufferToImage {
            src: staging,
            dst: image,
            dst_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            regions: vec![region],
        };
        assert!(matches!(device.submit_transfers(&[copy.clone()]), Err(GfxError::InvalidCommand(_))));

        let to_dst = TransferCommand::ImageBarrier(ImageBarrierDesc::new(
            image,
            ImageState::UNDEFINED,
            ImageState::TRANSFER_DST,
            desc.full_subresource_range(),
        ));
        device.submit_transfers(&[to_dst, copy]).unwrap();
        assert_eq!(device.image_subresource_contents(image, 0, 0).unwrap(), (0u8..16).collect::<Vec<_>>());
        assert_eq!(device.submission_count(), 1);
        assert_eq!(device.submitted_command_count(), 2);
    }

    #[test]
    fn test_rejected_batch_has_no_partial_effect() {
        let device = HeadlessDevice::new();
        let (src, src_allocation) = host_buffer(&device, 4);
        let (dst, _) = host_buffer(&device, 4);
        device.write_mapped(&src_allocation, 0, &[1, 2, 3, 4]).unwrap();

        let desc = ImageDesc::new_2d(
            vk::Format::BC7_UNORM_BLOCK,
            vk::Extent2D { width: 4, height: 4 },
            vk::ImageUsageFlags::SAMPLED,
        );
        let image = device.create_image(&desc, None).unwrap();
        device.allocate_and_bind(AllocationTarget::Image(image), &MemoryPolicy::DeviceLocal.into()).unwrap();

        let batch = [
            TransferCommand::CopyBuffer {
                src,
                dst,
                regions: vec![vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: 4,
                }],
            },
            TransferCommand::ImageBarrier(ImageBarrierDesc::new(
                image,
                ImageState::UNDEFINED,
                ImageState::TRANSFER_DST,
                desc.full_subresource_range(),
            )),
            TransferCommand::CopyBufferToImage {
                src,
                dst: image,
                dst_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                regions: vec![vk::BufferImageCopy {
                    image_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    image_extent: desc.extent,
                    ..Default::default()
                }],
            },
        ];
        assert!(matches!(device.submit_transfers(&batch), Err(GfxError::UnsupportedFormat(_))));

        assert_eq!(device.buffer_contents(dst).unwrap(), vec![0; 4]);
        assert_eq!(device.image_layout(image, 0, 0), Some(vk::ImageLayout::UNDEFINED));
        assert_eq!(device.submission_count(), 0);
    }

    #[test]
    fn test_fail_next_create_is_one_shot() {
        let device = HeadlessDevice::new();
        device.fail_next_create();
        assert!(device.create_sampler(&SamplerDesc::default(), None).is_err());
        assert!(device.create_sampler(&SamplerDesc::default(), None).is_ok());
        assert_eq!(device.live_object_count(), 1);
    }
}
