//! 示例插件
//!
//! 一个简单的遥测采集插件：激活时启动后台刷新任务，停用时停止并等待任务退出。
//! 命令行程序用它演示完整的生命周期。

use crate::plugins::core::Plugin;
use crate::types::{ActivationConfig, InfoSnapshot, InitOptions, PluginHandle};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1000;

/// 遥测采集插件
///
/// 识别的初始化选项：`flush_interval_ms`。识别的激活配置：`endpoint`。
pub struct TelemetryPlugin {
    flush_interval: Duration,
    endpoint: Option<String>,
    flushes: Arc<AtomicU64>,
    worker: Option<(CancellationToken, JoinHandle<()>)>,
}

impl TelemetryPlugin {
    pub fn new() -> Self {
        Self {
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            endpoint: None,
            flushes: Arc::new(AtomicU64::new(0)),
            worker: None,
        }
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Plugin for TelemetryPlugin {
    async fn init_plugin(&mut self, options: &InitOptions) -> anyhow::Result<PluginHandle> {
        let interval_ms = match options.get("flush_interval_ms") {
            None => DEFAULT_FLUSH_INTERVAL_MS,
            Some(value) => value
                .as_u64()
                .filter(|ms| *ms > 0)
                .ok_or_else(|| anyhow::anyhow!("flush_interval_ms must be a positive integer"))?,
        };
        self.flush_interval = Duration::from_millis(interval_ms);
        Ok(PluginHandle::new(self.flushes.clone()))
    }

    async fn activate(&mut self, config: &ActivationConfig) -> anyhow::Result<()> {
        self.endpoint = config
            .get("endpoint")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let flushes = self.flushes.clone();
        let period = self.flush_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let total = flushes.fetch_add(1, Ordering::Relaxed) + 1;
                        debug!(total, "telemetry flushed");
                    }
                }
            }
        });

        self.worker = Some((cancel, handle));
        Ok(())
    }

    async fn deactivate(&mut self, _config: &ActivationConfig) -> anyhow::Result<()> {
        if let Some((cancel, handle)) = self.worker.take() {
            cancel.cancel();
            handle
                .await
                .map_err(|e| anyhow::anyhow!("telemetry worker did not stop cleanly: {}", e))?;
        }
        self.endpoint = None;
        Ok(())
    }

    async fn info(&self) -> anyhow::Result<InfoSnapshot> {
        let mut info = HashMap::new();
        info.insert("active".to_string(), serde_json::json!(self.worker.is_some()));
        info.insert("flushes".to_string(), serde_json::json!(self.flush_count()));
        info.insert(
            "flush_interval_ms".to_string(),
            serde_json::json!(self.flush_interval.as_millis() as u64),
        );
        info.insert("endpoint".to_string(), serde_json::json!(self.endpoint));
        Ok(info)
    }
}

impl Default for TelemetryPlugin {
    fn default() -> Self {
        Self::new()
    }
}

/// 初始化总是失败的插件，用于演示失败隔离
pub struct BrokenPlugin {
    reason: String,
}

impl BrokenPlugin {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Plugin for BrokenPlugin {
    async fn init_plugin(&mut self, _options: &InitOptions) -> anyhow::Result<PluginHandle> {
        Err(anyhow::anyhow!("{}", self.reason))
    }

    async fn activate(&mut self, _config: &ActivationConfig) -> anyhow::Result<()> {
        anyhow::bail!("plugin was never initialized")
    }

    async fn deactivate(&mut self, _config: &ActivationConfig) -> anyhow::Result<()> {
        Ok(())
    }

    async fn info(&self) -> anyhow::Result<InfoSnapshot> {
        Ok(InfoSnapshot::new())
    }
}
