//! 资源状态定义
//!
//! 封装 Vulkan 的 pipeline stage、access mask 和 image layout，
//! 以及从资源声明的 usage 推断上传完成后应处于的状态。
//!
//! usage → state 的推断是一张按优先级排列的查找表，第一个命中的 usage 决定结果，
//! 都未命中时退化为通用的 MEMORY_READ。

use ash::vk;

/// 缓冲区资源状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferState {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

impl Default for BufferState {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

impl BufferState {
    #[inline]
    pub const fn new(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        Self { stage, access }
    }

    /// 刚创建、尚未被访问过
    pub const UNDEFINED: Self = Self::new(vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::NONE);

    pub const TRANSFER_DST: Self = Self::new(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE);

    pub const UNIFORM_READ: Self =
        Self::new(vk::PipelineStageFlags2::ALL_COMMANDS, vk::AccessFlags2::UNIFORM_READ);

    pub const INDEX_READ: Self = Self::new(vk::PipelineStageFlags2::INDEX_INPUT, vk::AccessFlags2::INDEX_READ);

    pub const VERTEX_READ: Self =
        Self::new(vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT, vk::AccessFlags2::VERTEX_ATTRIBUTE_READ);

    pub const INDIRECT_READ: Self =
        Self::new(vk::PipelineStageFlags2::DRAW_INDIRECT, vk::AccessFlags2::INDIRECT_COMMAND_READ);

    /// storage buffer / storage texel buffer 读写
    pub const SHADER_READ_WRITE: Self = Self::new(
        vk::PipelineStageFlags2::ALL_COMMANDS,
        vk::AccessFlags2::from_raw(vk::AccessFlags2::SHADER_READ.as_raw() | vk::AccessFlags2::SHADER_WRITE.as_raw()),
    );

    /// uniform texel buffer 只读
    pub const SHADER_READ: Self = Self::new(vk::PipelineStageFlags2::ALL_COMMANDS, vk::AccessFlags2::SHADER_READ);

    /// 无法从 usage 推断时的通用读
    pub const MEMORY_READ: Self = Self::new(vk::PipelineStageFlags2::ALL_COMMANDS, vk::AccessFlags2::MEMORY_READ);

    const WRITE_ACCESS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
        vk::AccessFlags2::SHADER_WRITE.as_raw()
            | vk::AccessFlags2::TRANSFER_WRITE.as_raw()
            | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
    );

    #[inline]
    pub fn is_write(&self) -> bool {
        self.access.intersects(Self::WRITE_ACCESS)
    }
}

/// 图像资源状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageState {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
}

impl Default for ImageState {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

impl ImageState {
    #[inline]
    pub const fn new(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2, layout: vk::ImageLayout) -> Self {
        Self { stage, access, layout }
    }

    /// 未定义状态（初始状态或不关心内容）
    pub const UNDEFINED: Self =
        Self::new(vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::NONE, vk::ImageLayout::UNDEFINED);

    pub const TRANSFER_DST: Self = Self::new(
        vk::PipelineStageFlags2::TRANSFER,
        vk::AccessFlags2::TRANSFER_WRITE,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    );

    /// 着色器只读采样
    pub const SHADER_READ: Self = Self::new(
        vk::PipelineStageFlags2::ALL_COMMANDS,
        vk::AccessFlags2::SHADER_SAMPLED_READ,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    );

    /// 存储图像读写
    pub const STORAGE_READ_WRITE: Self = Self::new(
        vk::PipelineStageFlags2::ALL_COMMANDS,
        vk::AccessFlags2::from_raw(
            vk::AccessFlags2::SHADER_STORAGE_READ.as_raw() | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw(),
        ),
        vk::ImageLayout::GENERAL,
    );

    pub const COLOR_ATTACHMENT_WRITE: Self = Self::new(
        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    );

    pub const DEPTH_ATTACHMENT_READ_WRITE: Self = Self::new(
        vk::PipelineStageFlags2::from_raw(
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
        ),
        vk::AccessFlags2::from_raw(
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    );

    pub const INPUT_ATTACHMENT_READ: Self = Self::new(
        vk::PipelineStageFlags2::FRAGMENT_SHADER,
        vk::AccessFlags2::INPUT_ATTACHMENT_READ,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    );

    /// 无法从 usage 推断时的通用读
    pub const MEMORY_READ: Self = Self::new(
        vk::PipelineStageFlags2::ALL_COMMANDS,
        vk::AccessFlags2::MEMORY_READ,
        vk::ImageLayout::GENERAL,
    );

    const WRITE_ACCESS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
        vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw()
            | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw()
            | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
            | vk::AccessFlags2::TRANSFER_WRITE.as_raw()
            | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
    );

    #[inline]
    pub fn is_write(&self) -> bool {
        self.access.intersects(Self::WRITE_ACCESS)
    }

    /// 作为 barrier src 时只保留写 access
    #[inline]
    pub fn src_access(&self) -> vk::AccessFlags2 {
        self.access & Self::WRITE_ACCESS
    }
}

/// buffer usage → 上传完成后的状态，按优先级排列
pub const BUFFER_USAGE_STATES: [(vk::BufferUsageFlags, BufferState); 7] = [
    (vk::BufferUsageFlags::UNIFORM_BUFFER, BufferState::UNIFORM_READ),
    (vk::BufferUsageFlags::INDEX_BUFFER, BufferState::INDEX_READ),
    (vk::BufferUsageFlags::VERTEX_BUFFER, BufferState::VERTEX_READ),
    (vk::BufferUsageFlags::INDIRECT_BUFFER, BufferState::INDIRECT_READ),
    (vk::BufferUsageFlags::STORAGE_BUFFER, BufferState::SHADER_READ_WRITE),
    (vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER, BufferState::SHADER_READ_WRITE),
    (vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER, BufferState::SHADER_READ),
];

/// image usage → 上传完成后的状态，按优先级排列
pub const IMAGE_USAGE_STATES: [(vk::ImageUsageFlags, ImageState); 5] = [
    (vk::ImageUsageFlags::SAMPLED, ImageState::SHADER_READ),
    (vk::ImageUsageFlags::STORAGE, ImageState::STORAGE_READ_WRITE),
    (vk::ImageUsageFlags::COLOR_ATTACHMENT, ImageState::COLOR_ATTACHMENT_WRITE),
    (vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT, ImageState::DEPTH_ATTACHMENT_READ_WRITE),
    (vk::ImageUsageFlags::INPUT_ATTACHMENT, ImageState::INPUT_ATTACHMENT_READ),
];

pub fn buffer_state_for_usage(usage: vk::BufferUsageFlags) -> BufferState {
    BUFFER_USAGE_STATES
        .iter()
        .find(|(flag, _)| usage.contains(*flag))
        .map_or(BufferState::MEMORY_READ, |(_, state)| *state)
}

pub fn image_state_for_usage(usage: vk::ImageUsageFlags) -> ImageState {
    IMAGE_USAGE_STATES
        .iter()
        .find(|(flag, _)| usage.contains(*flag))
        .map_or(ImageState::MEMORY_READ, |(_, state)| *state)
}
