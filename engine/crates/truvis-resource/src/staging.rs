//! staging buffer 池
//!
//! staging buffer 是 HostVisibleCoherent 的 TRANSFER_SRC buffer。
//! 被录制进命令流后进入 in-flight 列表，传输确认后回到空闲列表供后续请求复用，
//! `flush_staging_buffers` 时全部销毁。

use ash::vk;
use truvis_gfx::device::{AllocationTarget, GfxDevice};
use truvis_gfx::memory::{AllocationRequirements, DeviceAllocation, MemoryPolicy};
use truvis_gfx::resources::desc::BufferDesc;

use crate::error::{ResourceError, ResourceResult};
use crate::handles::ResourceKind;

#[derive(Clone, Copy, Debug)]
pub struct StagingBuffer {
    pub buffer: vk::Buffer,
    pub allocation: DeviceAllocation,
    pub size: vk::DeviceSize,
}

impl StagingBuffer {
    fn destroy(self, device: &dyn GfxDevice) {
        device.free_allocation(&self.allocation);
        device.destroy_buffer(self.buffer);
    }
}

pub struct StagingBufferPool {
    min_size: vk::DeviceSize,
    max_free: usize,
    in_flight: Vec<StagingBuffer>,
    /// 按 size 升序
    free: Vec<StagingBuffer>,
}

impl StagingBufferPool {
    pub fn new(min_size: vk::DeviceSize, max_free: usize) -> Self {
        Self {
            min_size,
            max_free,
            in_flight: Vec::new(),
            free: Vec::new(),
        }
    }

    /// 取一个至少 `size` 字节的 staging buffer
    ///
    /// 优先复用空闲列表中最小的合适 buffer，没有时新建。
    /// 返回的 buffer 不在任何列表中，调用方写入成功后要 `mark_in_flight`，失败时 `give_back`。
    pub fn acquire(&mut self, device: &dyn GfxDevice, size: vk::DeviceSize) -> ResourceResult<StagingBuffer> {
        if let Some(index) = self.free.iter().position(|s| s.size >= size) {
            return Ok(self.free.remove(index));
        }

        let _span = tracy_client::span!("StagingBufferPool::create");
        let buffer_size = size.max(self.min_size);
        let creation_error = |source| ResourceError::DeviceCreation {
            kind: ResourceKind::Buffer,
            name: Some("staging-buffer".to_string()),
            source,
        };

        let buffer = device
            .create_buffer(&BufferDesc::new(buffer_size, vk::BufferUsageFlags::TRANSFER_SRC), Some("staging-buffer"))
            .map_err(creation_error)?;
        let allocation = device
            .allocate_and_bind(
                AllocationTarget::Buffer(buffer),
                &AllocationRequirements::from(MemoryPolicy::HostVisibleCoherent),
            )
            .map_err(|e| {
                device.destroy_buffer(buffer);
                creation_error(e)
            })?;
        log::debug!("create staging buffer {:?} ({} bytes)", buffer, buffer_size);

        Ok(StagingBuffer {
            buffer,
            allocation,
            size: buffer_size,
        })
    }

    #[inline]
    pub fn mark_in_flight(&mut self, staging: StagingBuffer) {
        self.in_flight.push(staging);
    }

    /// 未被使用的 buffer 直接回到空闲列表
    pub fn give_back(&mut self, device: &dyn GfxDevice, staging: StagingBuffer) {
        self.push_free(device, staging);
    }

    /// 传输确认后，in-flight 的 buffer 全部回到空闲列表，超出上限的销毁
    pub fn recycle_in_flight(&mut self, device: &dyn GfxDevice) {
        for staging in std::mem::take(&mut self.in_flight) {
            self.push_free(device, staging);
        }
    }

    fn push_free(&mut self, device: &dyn GfxDevice, staging: StagingBuffer) {
        if self.free.len() >= self.max_free {
            staging.destroy(device);
            return;
        }
        let index = self.free.partition_point(|s| s.size < staging.size);
        self.free.insert(index, staging);
    }

    /// 销毁所有空闲 buffer，返回销毁的数量
    ///
    /// 调用方需保证没有 in-flight 的 buffer。
    pub fn release_all(&mut self, device: &dyn GfxDevice) -> usize {
        debug_assert!(self.in_flight.is_empty());
        let released = self.free.len();
        for staging in self.free.drain(..) {
            staging.destroy(device);
        }
        released
    }

    #[inline]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use truvis_gfx::headless::HeadlessDevice;

    use super::*;

    #[test]
    fn test_reuse_smallest_fitting_buffer() {
        let device = HeadlessDevice::new();
        let mut pool = StagingBufferPool::new(16, 4);

        let small = pool.acquire(&device, 8).unwrap();
        let large = pool.acquire(&device, 100).unwrap();
        assert_eq!(small.size, 16);
        assert_eq!(large.size, 100);
        pool.mark_in_flight(large);
        pool.mark_in_flight(small);
        pool.recycle_in_flight(&device);
        assert_eq!(pool.free_count(), 2);

        let reused = pool.acquire(&device, 10).unwrap();
        assert_eq!(reused.buffer, small.buffer);
        let reused = pool.acquire(&device, 50).unwrap();
        assert_eq!(reused.buffer, large.buffer);
    }

    #[test]
    fn test_free_list_is_bounded() {
        let device = HeadlessDevice::new();
        let mut pool = StagingBufferPool::new(16, 1);
        let a = pool.acquire(&device, 8).unwrap();
        let b = pool.acquire(&device, 8).unwrap();
        pool.mark_in_flight(a);
        pool.mark_in_flight(b);
        pool.recycle_in_flight(&device);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(device.live_object_count(), 1);

        assert_eq!(pool.release_all(&device), 1);
        assert_eq!(pool.release_all(&device), 0);
        assert_eq!(device.live_object_count(), 0);
        assert_eq!(device.live_allocation_count(), 0);
    }
}
