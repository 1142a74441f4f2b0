use std::any::Any;
use std::sync::Arc;

use ash::vk;
use truvis_gfx::memory::MemoryPolicy;
use truvis_gfx::resources::desc::{BufferDesc, BufferViewDesc, ImageDesc, ImageViewDesc, SamplerDesc};
use truvis_gfx::resources::resource_state::{BufferState, ImageState};

use crate::handles::ResourceKind;

/// 创建资源时附带的任意用户数据
pub type UserData = Arc<dyn Any + Send + Sync>;

/// 写入资源的数据及其布局
#[derive(Clone, Copy, Debug)]
pub struct GpuResourceData<'a> {
    pub data: &'a [u8],
    /// 0 表示不要求对齐，否则必须是 2 的幂
    pub alignment: u64,
    /// 以 texel 为单位的行长度，0 表示紧密排列；只对单个 subresource 的 image 上传有效
    pub row_pitch: u32,
    /// 以行为单位的切片高度，0 表示紧密排列；只对单个 subresource 的 image 上传有效
    pub slice_pitch: u32,
}

impl<'a> GpuResourceData<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            alignment: 0,
            row_pitch: 0,
            slice_pitch: 0,
        }
    }

    #[inline]
    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    #[inline]
    pub fn with_pitches(mut self, row_pitch: u32, slice_pitch: u32) -> Self {
        self.row_pitch = row_pitch;
        self.slice_pitch = slice_pitch;
        self
    }

    #[inline]
    pub fn is_tightly_packed(&self) -> bool {
        self.row_pitch == 0 && self.slice_pitch == 0
    }
}

impl<'a> From<&'a [u8]> for GpuResourceData<'a> {
    fn from(data: &'a [u8]) -> Self {
        Self::new(data)
    }
}

/// 创建参数的快照
#[derive(Clone, Copy, Debug)]
pub enum ResourceInfo {
    Buffer {
        desc: BufferDesc,
        view: Option<BufferViewDesc>,
    },
    Image {
        desc: ImageDesc,
        view: ImageViewDesc,
    },
    Sampler(SamplerDesc),
}

impl ResourceInfo {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceInfo::Buffer { .. } => ResourceKind::Buffer,
            ResourceInfo::Image { .. } => ResourceKind::Image,
            ResourceInfo::Sampler(_) => ResourceKind::Sampler,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NativeHandle {
    Buffer(vk::Buffer),
    Image(vk::Image),
    Sampler(vk::Sampler),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NativeView {
    Buffer(vk::BufferView),
    Image(vk::ImageView),
}

/// 资源最近一次 staging 上传之后所处的访问状态，作为下一次上传 barrier 的 src
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessState {
    Buffer(BufferState),
    Image(ImageState),
    None,
}

/// 注册表中的一条资源记录
pub struct ResourceRecord {
    pub native: NativeHandle,
    pub view: Option<NativeView>,
    pub info: ResourceInfo,
    /// sampler 没有内存
    pub policy: Option<MemoryPolicy>,
    pub name: Option<String>,
    pub user_data: Option<UserData>,
    pub state: AccessState,
}

impl ResourceRecord {
    #[inline]
    pub fn kind(&self) -> ResourceKind {
        self.info.kind()
    }

    #[inline]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }
}
