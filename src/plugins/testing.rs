//! 测试用可编排插件

use super::core::Plugin;
use crate::types::{ActivationConfig, InfoSnapshot, InitOptions, PluginHandle};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 各操作的调用计数
#[derive(Debug, Clone, Default)]
pub(crate) struct CallCounters {
    pub init: Arc<AtomicU32>,
    pub activate: Arc<AtomicU32>,
    pub deactivate: Arc<AtomicU32>,
    pub info: Arc<AtomicU32>,
}

impl CallCounters {
    pub fn init(&self) -> u32 {
        self.init.load(Ordering::SeqCst)
    }

    pub fn activate(&self) -> u32 {
        self.activate.load(Ordering::SeqCst)
    }

    pub fn deactivate(&self) -> u32 {
        self.deactivate.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> u32 {
        self.info.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> u32 {
        self.init() + self.activate() + self.deactivate() + self.info()
    }
}

#[derive(Default)]
pub(crate) struct ScriptedPlugin {
    pub calls: CallCounters,
    /// 前 N 次初始化失败
    pub init_failures: u32,
    pub fail_activate: bool,
    pub fail_deactivate: bool,
    pub panic_on_activate: bool,
    pub activate_delay: Option<Duration>,
    pub info_delay: Option<Duration>,
    active: Arc<AtomicBool>,
}

impl ScriptedPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_init(mut self, times: u32) -> Self {
        self.init_failures = times;
        self
    }

    pub fn failing_activate(mut self) -> Self {
        self.fail_activate = true;
        self
    }

    pub fn failing_deactivate(mut self) -> Self {
        self.fail_deactivate = true;
        self
    }

    pub fn panicking_activate(mut self) -> Self {
        self.panic_on_activate = true;
        self
    }

    pub fn slow_activate(mut self, delay: Duration) -> Self {
        self.activate_delay = Some(delay);
        self
    }

    pub fn slow_info(mut self, delay: Duration) -> Self {
        self.info_delay = Some(delay);
        self
    }

    pub fn counters(&self) -> CallCounters {
        self.calls.clone()
    }
}

#[async_trait]
impl Plugin for ScriptedPlugin {
    async fn init_plugin(&mut self, _options: &InitOptions) -> anyhow::Result<PluginHandle> {
        let attempt = self.calls.init.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.init_failures {
            anyhow::bail!("init attempt {} rejected", attempt);
        }
        Ok(PluginHandle::new(attempt))
    }

    async fn activate(&mut self, _config: &ActivationConfig) -> anyhow::Result<()> {
        self.calls.activate.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.activate_delay {
            tokio::time::sleep(delay).await;
        }
        if self.panic_on_activate {
            panic!("activate blew up");
        }
        if self.fail_activate {
            anyhow::bail!("upstream unavailable");
        }
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn deactivate(&mut self, _config: &ActivationConfig) -> anyhow::Result<()> {
        self.calls.deactivate.fetch_add(1, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        if self.fail_deactivate {
            anyhow::bail!("connection close failed");
        }
        Ok(())
    }

    async fn info(&self) -> anyhow::Result<InfoSnapshot> {
        self.calls.info.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.info_delay {
            tokio::time::sleep(delay).await;
        }
        let mut info = HashMap::new();
        info.insert(
            "active".to_string(),
            serde_json::json!(self.active.load(Ordering::SeqCst)),
        );
        info.insert("activations".to_string(), serde_json::json!(self.calls.activate()));
        Ok(info)
    }
}
