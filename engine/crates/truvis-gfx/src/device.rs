use ash::vk;

use crate::commands::transfer_command::TransferCommand;
use crate::error::GfxResult;
use crate::memory::{AllocationRequirements, DeviceAllocation};
use crate::resources::desc::{BufferDesc, BufferViewDesc, ImageDesc, ImageViewDesc, SamplerDesc};

/// 需要绑定内存的 native object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationTarget {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

/// 资源管理层看到的设备
///
/// 包含两部分职责：
/// 1. native object 的创建和销毁
/// 2. 设备内存分配器：按 memory property flags 分配并绑定内存，读写映射内存
///
/// 以及传输命令流的提交。实现必须可以被多个线程同时调用。
pub trait GfxDevice: Send + Sync {
    fn create_buffer(&self, desc: &BufferDesc, name: Option<&str>) -> GfxResult<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);

    fn create_buffer_view(&self, buffer: vk::Buffer, desc: &BufferViewDesc) -> GfxResult<vk::BufferView>;
    fn destroy_buffer_view(&self, view: vk::BufferView);

    fn create_image(&self, desc: &ImageDesc, name: Option<&str>) -> GfxResult<vk::Image>;
    fn destroy_image(&self, image: vk::Image);

    fn create_image_view(&self, image: vk::Image, desc: &ImageViewDesc) -> GfxResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);

    fn create_sampler(&self, desc: &SamplerDesc, name: Option<&str>) -> GfxResult<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    /// 分配满足 `requirements.required_flags` 的内存并绑定到 `target`
    ///
    /// 只允许选择包含全部 required flags 的 memory type，找不到时返回错误，不做回退。
    fn allocate_and_bind(
        &self,
        target: AllocationTarget,
        requirements: &AllocationRequirements,
    ) -> GfxResult<DeviceAllocation>;
    fn free_allocation(&self, allocation: &DeviceAllocation);

    /// 写入映射内存，不做 flush
    fn write_mapped(&self, allocation: &DeviceAllocation, offset: vk::DeviceSize, data: &[u8]) -> GfxResult<()>;
    fn read_mapped(&self, allocation: &DeviceAllocation, offset: vk::DeviceSize, len: usize) -> GfxResult<Vec<u8>>;
    /// flush 非 coherent 内存的映射范围
    fn flush_mapped(&self, allocation: &DeviceAllocation, offset: vk::DeviceSize, size: vk::DeviceSize)
    -> GfxResult<()>;

    /// 按顺序回放并提交命令流，阻塞直到设备执行完成
    fn submit_transfers(&self, commands: &[TransferCommand]) -> GfxResult<()>;
}
