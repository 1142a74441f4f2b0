use std::path::Path;

use serde::Deserialize;
use truvis_resource::ResourceContextConfig;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoaderConfig {
    /// 执行加载函数的 worker 线程数
    pub worker_threads: usize,
    /// worker 线程名前缀，实际名字为 `{prefix}-{index}`
    pub thread_name_prefix: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            thread_name_prefix: "Asset-Loader".to_string(),
        }
    }
}

/// ResourceHub 的全部配置
///
/// ```toml
/// [resource]
/// staging_min_size = 65536
///
/// [loader]
/// worker_threads = 4
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResourceHubConfig {
    pub resource: ResourceContextConfig,
    pub loader: LoaderConfig,
}

impl ResourceHubConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        truvis_crate_tools::config::load_toml(path)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        truvis_crate_tools::config::parse_toml(content)
    }
}
