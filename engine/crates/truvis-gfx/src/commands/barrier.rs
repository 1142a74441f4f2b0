//! Barrier 描述
//!
//! 只保存 handle 和前后状态，需要提交时再转换为 `vk::*MemoryBarrier2`。
//! ash 的结构体带有裸指针，不能跨线程传递，所以命令流里存放的是这里的描述。

use ash::vk;

use crate::resources::resource_state::{BufferState, ImageState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferBarrierDesc {
    pub buffer: vk::Buffer,
    pub src_state: BufferState,
    pub dst_state: BufferState,
    pub offset: vk::DeviceSize,
    /// WHOLE_SIZE 表示整个缓冲区
    pub size: vk::DeviceSize,
}

impl BufferBarrierDesc {
    pub fn new(buffer: vk::Buffer, src_state: BufferState, dst_state: BufferState) -> Self {
        Self {
            buffer,
            src_state,
            dst_state,
            offset: 0,
            size: vk::WHOLE_SIZE,
        }
    }

    pub fn to_vk(&self) -> vk::BufferMemoryBarrier2<'static> {
        vk::BufferMemoryBarrier2::default()
            .src_stage_mask(self.src_state.stage)
            .src_access_mask(self.src_state.access)
            .dst_stage_mask(self.dst_state.stage)
            .dst_access_mask(self.dst_state.access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(self.buffer)
            .offset(self.offset)
            .size(self.size)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ImageBarrierDesc {
    pub image: vk::Image,
    pub src_state: ImageState,
    pub dst_state: ImageState,
    pub subresource_range: vk::ImageSubresourceRange,
}

impl ImageBarrierDesc {
    pub fn new(
        image: vk::Image,
        src_state: ImageState,
        dst_state: ImageState,
        subresource_range: vk::ImageSubresourceRange,
    ) -> Self {
        Self {
            image,
            src_state,
            dst_state,
            subresource_range,
        }
    }

    pub fn to_vk(&self) -> vk::ImageMemoryBarrier2<'static> {
        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(self.src_state.stage)
            .src_access_mask(self.src_state.src_access())
            .dst_stage_mask(self.dst_state.stage)
            .dst_access_mask(self.dst_state.access)
            .old_layout(self.src_state.layout)
            .new_layout(self.dst_state.layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(self.subresource_range)
    }
}
