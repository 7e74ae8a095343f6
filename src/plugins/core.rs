//! 插件契约定义
//!
//! 每个插件必须实现的四个生命周期操作：init / activate / deactivate / info

use crate::types::{ActivationConfig, InfoSnapshot, InitOptions, PluginHandle};
use async_trait::async_trait;

/// 核心插件特征 - 所有插件必须实现
///
/// 插件以 `anyhow::Error` 报告失败，宿主负责把它转换为对应阶段的 [`crate::HostError`]。
/// 所有调用都受宿主超时限制，插件不应假设调用一定能执行完毕。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Plugin: Send + Sync {
    /// 一次性初始化，返回不透明句柄
    async fn init_plugin(&mut self, options: &InitOptions) -> anyhow::Result<PluginHandle>;

    /// 进入运行状态，产生的副作用必须能被 `deactivate` 完全撤销
    async fn activate(&mut self, config: &ActivationConfig) -> anyhow::Result<()>;

    /// 释放 `activate` 获取的资源，激活部分失败后调用也必须安全
    async fn deactivate(&mut self, config: &ActivationConfig) -> anyhow::Result<()>;

    /// 当前状态快照
    async fn info(&self) -> anyhow::Result<InfoSnapshot>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct CounterPlugin {
        activations: u32,
        active: bool,
    }

    #[async_trait]
    impl Plugin for CounterPlugin {
        async fn init_plugin(&mut self, options: &InitOptions) -> anyhow::Result<PluginHandle> {
            let start = options
                .get("start")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            self.activations = start as u32;
            Ok(PluginHandle::new(start))
        }

        async fn activate(&mut self, _config: &ActivationConfig) -> anyhow::Result<()> {
            self.activations += 1;
            self.active = true;
            Ok(())
        }

        async fn deactivate(&mut self, _config: &ActivationConfig) -> anyhow::Result<()> {
            self.active = false;
            Ok(())
        }

        async fn info(&self) -> anyhow::Result<InfoSnapshot> {
            let mut info = HashMap::new();
            info.insert("activations".to_string(), serde_json::json!(self.activations));
            info.insert("active".to_string(), serde_json::json!(self.active));
            Ok(info)
        }
    }

    #[tokio::test]
    async fn test_plugin_contract_through_trait_object() {
        let mut plugin: Box<dyn Plugin> = Box::new(CounterPlugin {
            activations: 0,
            active: false,
        });

        let mut options = HashMap::new();
        options.insert("start".to_string(), serde_json::json!(3));
        let handle = plugin.init_plugin(&options).await.unwrap();
        assert_eq!(handle.downcast_ref::<u64>(), Some(&3));

        let config = ActivationConfig::new();
        plugin.activate(&config).await.unwrap();
        let info = plugin.info().await.unwrap();
        assert_eq!(info["activations"], serde_json::json!(4));
        assert_eq!(info["active"], serde_json::json!(true));

        plugin.deactivate(&config).await.unwrap();
        let info = plugin.info().await.unwrap();
        assert_eq!(info["active"], serde_json::json!(false));
    }
}
