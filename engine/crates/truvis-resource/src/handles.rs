use slotmap::new_key_type;

new_key_type! {
    /// 资源注册表内部使用的 key
    pub struct InnerResourceHandle;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Image,
    Sampler,
}

/// 指向一个 GPU 资源（buffer、image 或 sampler）的句柄
///
/// 句柄带有代际信息，资源销毁后旧句柄不会指向新创建的资源。
/// kind 在创建时确定，之后不会改变。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    pub(crate) inner: InnerResourceHandle,
    pub(crate) kind: ResourceKind,
}

impl ResourceHandle {
    #[inline]
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    #[inline]
    pub fn is_buffer(&self) -> bool {
        self.kind == ResourceKind::Buffer
    }

    #[inline]
    pub fn is_image(&self) -> bool {
        self.kind == ResourceKind::Image
    }
}
