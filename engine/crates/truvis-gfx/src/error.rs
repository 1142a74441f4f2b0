use ash::vk;
use thiserror::Error;

/// 设备层错误
///
/// native object 创建、内存分配、映射以及传输提交过程中可能出现的错误。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GfxError {
    /// native object 创建失败
    #[error("failed to create {object}: {result}")]
    ObjectCreation {
        /// 对象类型，例如 "buffer"、"image view"
        object: &'static str,
        result: vk::Result,
    },

    /// 设备分配器无法满足要求的 memory property flags
    #[error("no memory type satisfies required flags {required:?}: {result}")]
    Allocation {
        required: vk::MemoryPropertyFlags,
        result: vk::Result,
    },

    /// 对不可被 host 访问的内存执行了映射读写
    #[error("allocation is not host visible (flags: {flags:?})")]
    NotHostVisible { flags: vk::MemoryPropertyFlags },

    /// 映射读写越界
    #[error("mapped range out of bounds: offset {offset} + len {len} > size {size}")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    /// 设备不认识该 native handle（已经销毁或从未创建）
    #[error("unknown device object: {0}")]
    UnknownObject(String),

    /// 无法计算该格式的 texel 大小
    #[error("unsupported format: {0:?}")]
    UnsupportedFormat(vk::Format),

    /// 命令流中包含非法命令，例如 image 不在 TRANSFER_DST layout 时执行拷贝
    #[error("invalid transfer command: {0}")]
    InvalidCommand(String),

    /// 提交或等待传输队列失败
    #[error("transfer submission failed: {0}")]
    Submit(vk::Result),
}

pub type GfxResult<T> = Result<T, GfxError>;
