use anyhow::Context;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;

/// 从 TOML 文件加载配置
///
/// 配置结构体通常带有 `#[serde(default)]`，因此文件中只需要写出需要覆盖的字段。
pub fn load_toml<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).with_context(|| format!("读取配置文件失败: {:?}", path))?;
    parse_toml(&content).with_context(|| format!("解析 TOML 配置失败: {:?}", path))
}

/// 从 TOML 字符串解析配置
pub fn parse_toml<T: DeserializeOwned>(content: &str) -> anyhow::Result<T> {
    let value = toml::from_str(content)?;
    Ok(value)
}
