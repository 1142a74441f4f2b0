use serde::Deserialize;

/// ResourceContext 的配置
///
/// ```toml
/// arena_chunk_size = 1048576
/// staging_min_size = 65536
/// max_free_staging_buffers = 16
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ResourceContextConfig {
    /// UploadArena 预分配的容量（字节）
    pub arena_chunk_size: usize,
    /// 新建 staging buffer 的最小尺寸（字节），小请求会向上取整到这个值以便复用
    pub staging_min_size: u64,
    /// 传输确认后最多保留多少个空闲 staging buffer，多余的立刻销毁
    pub max_free_staging_buffers: usize,
}

impl Default for ResourceContextConfig {
    fn default() -> Self {
        Self {
            arena_chunk_size: 1 << 20,
            staging_min_size: 64 << 10,
            max_free_staging_buffers: 16,
        }
    }
}
