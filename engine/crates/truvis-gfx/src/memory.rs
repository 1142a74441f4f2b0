//! 内存策略
//!
//! [`MemoryPolicy`] 表达资源内存的使用意图，决定了：
//! 1. 向设备分配器请求哪些 memory property flags（纯函数，不做任何回退或替换）
//! 2. 写入数据时是直接写映射内存，还是经过 staging buffer + 设备端拷贝

use ash::vk;

/// 资源内存的使用意图
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryPolicy {
    /// Host 可见，但不保证 coherent，写入后需要显式 flush
    HostVisible,
    /// Host 可见且 coherent
    HostVisibleCoherent,
    /// 仅设备本地，必须通过 staging 上传
    DeviceLocal,
    /// Sparse 资源，不要求任何 memory property，必须通过 staging 上传
    Sparse,
}

impl MemoryPolicy {
    pub const ALL: [MemoryPolicy; 4] = [
        MemoryPolicy::HostVisible,
        MemoryPolicy::HostVisibleCoherent,
        MemoryPolicy::DeviceLocal,
        MemoryPolicy::Sparse,
    ];

    /// 该策略要求的 memory property flags
    #[inline]
    pub fn required_flags(self) -> vk::MemoryPropertyFlags {
        match self {
            MemoryPolicy::HostVisible => vk::MemoryPropertyFlags::HOST_VISIBLE,
            MemoryPolicy::HostVisibleCoherent => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
            MemoryPolicy::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryPolicy::Sparse => vk::MemoryPropertyFlags::empty(),
        }
    }

    /// 是否可以直接写映射内存
    #[inline]
    pub fn is_host_writable(self) -> bool {
        matches!(self, MemoryPolicy::HostVisible | MemoryPolicy::HostVisibleCoherent)
    }

    /// 直接写入后是否需要显式 flush 映射范围
    #[inline]
    pub fn needs_flush(self) -> bool {
        self == MemoryPolicy::HostVisible
    }
}

/// 向设备分配器发起分配时的要求
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationRequirements {
    pub required_flags: vk::MemoryPropertyFlags,
    /// 需要在分配后保持映射（host 可写的分配）
    pub host_access: bool,
}

impl From<MemoryPolicy> for AllocationRequirements {
    fn from(policy: MemoryPolicy) -> Self {
        Self {
            required_flags: policy.required_flags(),
            host_access: policy.is_host_writable(),
        }
    }
}

/// 设备端分配的标识，由具体的 GfxDevice 实现分配
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(pub u64);

/// 一块已经绑定到资源上的设备内存
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceAllocation {
    pub id: AllocationId,
    pub memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    /// 实际选中的 memory type 的 property flags，是 required flags 的超集
    pub property_flags: vk::MemoryPropertyFlags,
}

impl DeviceAllocation {
    #[inline]
    pub fn is_host_visible(&self) -> bool {
        self.property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }
}
