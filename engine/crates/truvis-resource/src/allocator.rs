//! 内存分配适配层
//!
//! 把 MemoryPolicy 翻译为 memory property 要求并向设备分配器申请内存，
//! 分配与资源一一对应，以资源 key 索引，生命周期和资源相同。

use slotmap::SecondaryMap;
use truvis_gfx::device::{AllocationTarget, GfxDevice};
use truvis_gfx::error::GfxResult;
use truvis_gfx::memory::{AllocationRequirements, DeviceAllocation, MemoryPolicy};

use crate::handles::InnerResourceHandle;

/// 绑定到某个资源上的一段设备内存
#[derive(Clone, Copy, Debug)]
pub struct AllocationRecord {
    pub allocation: DeviceAllocation,
    pub policy: MemoryPolicy,
}

#[derive(Default)]
pub struct AllocatorAdapter {
    records: SecondaryMap<InnerResourceHandle, AllocationRecord>,
}

impl AllocatorAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按 policy 分配并绑定内存
    ///
    /// required flags 只由 policy 决定，设备无法满足时直接失败。
    pub fn bind(
        &self,
        device: &dyn GfxDevice,
        target: AllocationTarget,
        policy: MemoryPolicy,
    ) -> GfxResult<AllocationRecord> {
        let requirements = AllocationRequirements::from(policy);
        let allocation = device.allocate_and_bind(target, &requirements)?;
        log::trace!(
            "bind {:?} with {:?}: memory flags {:?}, {} bytes",
            target,
            policy,
            allocation.property_flags,
            allocation.size
        );
        Ok(AllocationRecord { allocation, policy })
    }

    /// 资源记录创建成功后，登记它的分配
    pub fn adopt(&mut self, key: InnerResourceHandle, record: AllocationRecord) {
        if let Some(old) = self.records.insert(key, record) {
            log::error!("resource already owned allocation {:?}, it is leaked", old.allocation.id);
        }
    }

    #[inline]
    pub fn get(&self, key: InnerResourceHandle) -> Option<&AllocationRecord> {
        self.records.get(key)
    }

    /// 释放资源的分配，资源没有分配时什么都不做
    pub fn release(&mut self, device: &dyn GfxDevice, key: InnerResourceHandle) {
        if let Some(record) = self.records.remove(key) {
            device.free_allocation(&record.allocation);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
