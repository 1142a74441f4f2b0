use ash::vk;

use crate::commands::barrier::{BufferBarrierDesc, ImageBarrierDesc};

/// 传输命令流中的一条命令
///
/// ResourceContext 在持有录制锁时按顺序追加命令，
/// 提交时由 GfxDevice 一次性回放到 command buffer。
#[derive(Clone, Debug)]
pub enum TransferCommand {
    BufferBarrier(BufferBarrierDesc),
    ImageBarrier(ImageBarrierDesc),
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
}

impl TransferCommand {
    #[inline]
    pub fn is_copy(&self) -> bool {
        matches!(self, TransferCommand::CopyBuffer { .. } | TransferCommand::CopyBufferToImage { .. })
    }
}
