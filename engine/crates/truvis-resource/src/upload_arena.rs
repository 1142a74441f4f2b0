//! UploadArena
//!
//! 调用方传入的数据只保证在调用期间有效，staging 上传会先把数据复制到 arena 中，
//! 从此不再引用调用方的内存。arena 中的数据要一直保留到传输被确认，
//! 只有在 `flush_staging_buffers` 确认没有未完成的传输后才整体重置。

use std::alloc::Layout;

use bumpalo::Bump;

use crate::error::{ResourceError, ResourceResult};

pub struct UploadArena {
    bump: Bump,
    allocation_count: usize,
}

impl UploadArena {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            bump: Bump::with_capacity(chunk_size),
            allocation_count: 0,
        }
    }

    /// 把 `data` 复制到 arena 中，返回的切片在下一次 `reset` 之前一直有效
    ///
    /// `alignment` 为 0 时按 1 字节对齐。
    pub fn stash(&mut self, data: &[u8], alignment: u64) -> ResourceResult<&[u8]> {
        let align = alignment.max(1) as usize;
        let layout = Layout::from_size_align(data.len(), align)
            .map_err(|_| ResourceError::InvalidData(format!("alignment {alignment} is not a power of two")))?;
        self.allocation_count += 1;
        let dst = self.bump.alloc_layout(layout);
        // SAFETY: dst 由 bump 按 layout 新分配，长度为 data.len()，与 data 不重叠
        let copied = unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst.as_ptr(), data.len());
            std::slice::from_raw_parts(dst.as_ptr(), data.len())
        };
        Ok(copied)
    }

    /// 当前持有的副本数量
    #[inline]
    pub fn allocation_count(&self) -> usize {
        self.allocation_count
    }

    #[inline]
    pub fn allocated_bytes(&self) -> usize {
        self.bump.allocated_bytes()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.allocation_count == 0
    }

    /// 释放全部副本，保留已申请的 chunk 供下次复用
    pub fn reset(&mut self) {
        self.bump.reset();
        self.allocation_count = 0;
    }
}
