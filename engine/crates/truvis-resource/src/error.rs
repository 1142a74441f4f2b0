use ash::vk;
use thiserror::Error;
use truvis_gfx::error::GfxError;

use crate::handles::{ResourceHandle, ResourceKind};

#[derive(Error, Debug)]
pub enum ResourceError {
    /// native object 创建或内存绑定失败，半成品记录已经回滚
    #[error("failed to create {kind:?} resource {name:?}: {source}")]
    DeviceCreation {
        kind: ResourceKind,
        name: Option<String>,
        #[source]
        source: GfxError,
    },

    /// 句柄已被销毁或不属于这个 ResourceContext
    #[error("invalid resource handle {0:?}")]
    InvalidHandle(ResourceHandle),

    /// 仍有未确认的传输引用了资源或 UploadArena
    #[error("{operation} while {outstanding} staged transfer(s) are unconfirmed")]
    StaleTransfer {
        operation: &'static str,
        outstanding: usize,
    },

    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    #[error("invalid resource data: {0}")]
    InvalidData(String),

    /// 多个 subresource 的上传需要知道 texel 大小
    #[error("cannot compute subresource layout for format {0:?}")]
    UnsupportedFormat(vk::Format),

    #[error("expected a {expected:?} resource, got {found:?}")]
    WrongKind {
        expected: ResourceKind,
        found: ResourceKind,
    },

    /// 映射读写、提交等设备操作失败
    #[error(transparent)]
    Device(#[from] GfxError),
}

pub type ResourceResult<T> = Result<T, ResourceError>;
