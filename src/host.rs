//! 插件宿主
//!
//! 把注册表、生命周期协调器和监督器组合成宿主应用使用的接口：
//! 注册、状态查询、批量激活 / 停用以及关闭。

use crate::config::HostConfig;
use crate::core::event_bus::{LifecycleEvent, LifecycleEventBus};
use crate::error::Result;
use crate::plugins::core::Plugin;
use crate::plugins::lifecycle::{BatchReport, LifecycleCoordinator, PluginSelection};
use crate::plugins::registry::{PluginRegistry, Registration};
use crate::plugins::supervisor::{FailureEvent, Supervisor};
use crate::types::*;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// 插件宿主
pub struct PluginHost {
    name: String,
    events: LifecycleEventBus,
    registry: Arc<PluginRegistry>,
    coordinator: LifecycleCoordinator,
    supervisor: Arc<Supervisor>,
}

impl PluginHost {
    pub fn new(config: &HostConfig) -> Self {
        let events = LifecycleEventBus::new(config.host.event_capacity);
        let registry = Arc::new(PluginRegistry::new(config.call_timeouts(), events.clone()));
        let coordinator = LifecycleCoordinator::new(registry.clone(), config.coordinator_config());
        let supervisor = Arc::new(Supervisor::new(registry.clone(), config.restart_policy()));

        info!(
            host = %config.host.name,
            worker_pool_size = config.host.worker_pool_size,
            "plugin host created"
        );

        Self {
            name: config.host.name.clone(),
            events,
            registry,
            coordinator,
            supervisor,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &LifecycleCoordinator {
        &self.coordinator
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// 订阅生命周期事件
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// 启动后台监督
    pub fn supervise(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.supervisor.spawn(cancel)
    }

    /// 注册插件
    pub async fn register(
        &self,
        name: impl Into<PluginName>,
        plugin: Box<dyn Plugin>,
        options: InitOptions,
    ) -> Result<Registration> {
        self.registry.register(name, plugin, options).await
    }

    pub async fn unregister(&self, name: &str) -> Result<()> {
        self.registry.unregister(name).await
    }

    /// 按注册顺序返回所有描述符，`refresh_info` 为真时先刷新 info 快照
    pub async fn status(&self, refresh_info: bool) -> Vec<PluginDescriptor> {
        if refresh_info {
            self.coordinator.refresh_all_info().await
        } else {
            self.registry.list()
        }
    }

    pub async fn activate(
        &self,
        selection: &PluginSelection,
        config: &ActivationConfig,
        cancel: &CancellationToken,
    ) -> BatchReport {
        self.coordinator.activate_batch(selection, config, cancel).await
    }

    pub async fn deactivate(
        &self,
        selection: &PluginSelection,
        config: &ActivationConfig,
        cancel: &CancellationToken,
    ) -> BatchReport {
        self.coordinator.deactivate_batch(selection, config, cancel).await
    }

    /// 人工重置失败插件
    pub async fn reset(&self, name: &str) -> Result<PluginDescriptor> {
        self.supervisor.reset(name).await
    }

    pub fn failures(&self) -> Vec<FailureEvent> {
        self.supervisor.failures()
    }

    /// 停用所有运行中的插件
    pub async fn shutdown(&self, config: &ActivationConfig) -> BatchReport {
        info!(host = %self.name, "plugin host shutting down");
        self.coordinator.shutdown(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::lifecycle::BatchOutcome;
    use crate::plugins::testing::ScriptedPlugin;
    use std::time::Duration;

    fn host() -> PluginHost {
        let mut config = HostConfig::new(4);
        config.timeouts.activate_ms = 100;
        config.restart.max_retries = 0;
        PluginHost::new(&config)
    }

    #[tokio::test]
    async fn test_host_end_to_end() {
        let host = host();
        let cancel = CancellationToken::new();
        let supervision = host.supervise(cancel.clone());

        host.register("transport", Box::new(ScriptedPlugin::new()), InitOptions::new())
            .await
            .unwrap();
        host.register("security", Box::new(ScriptedPlugin::new().failing_activate()), InitOptions::new())
            .await
            .unwrap();
        let broken = host
            .register("broken", Box::new(ScriptedPlugin::new().failing_init(u32::MAX)), InitOptions::new())
            .await
            .unwrap();
        assert!(broken.init_error.is_some());

        let config = ActivationConfig::new();
        let report = host.activate(&PluginSelection::All, &config, &cancel).await;
        assert_eq!(report.completed(), vec!["transport"]);
        assert_eq!(report.failed(), vec!["security", "broken"]);

        let status = host.status(true).await;
        let states: Vec<_> = status.iter().map(|d| (d.name.as_str(), d.state)).collect();
        assert_eq!(
            states,
            vec![
                ("transport", LifecycleState::Active),
                ("security", LifecycleState::Failed),
                ("broken", LifecycleState::Failed),
            ]
        );
        assert_eq!(status[0].info["active"], serde_json::json!(true));

        // 等待监督器记录失败事件
        for _ in 0..50 {
            if host.failures().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let failed: Vec<_> = host.failures().into_iter().map(|f| f.plugin).collect();
        assert!(failed.contains(&"security".to_string()));
        assert!(failed.contains(&"broken".to_string()));

        let report = host.shutdown(&config).await;
        assert!(matches!(
            report.outcome("transport"),
            Some(BatchOutcome::Completed(LifecycleState::Deactivated))
        ));

        for name in ["transport", "security", "broken"] {
            host.unregister(name).await.unwrap();
        }
        assert!(host.status(false).await.is_empty());

        cancel.cancel();
        supervision.await.unwrap();
    }

    #[tokio::test]
    async fn test_host_reset_recovers_failed_plugin() {
        let host = host();
        host.register("flaky", Box::new(ScriptedPlugin::new().failing_init(1)), InitOptions::new())
            .await
            .unwrap();

        let descriptor = host.reset("flaky").await.unwrap();
        assert_eq!(descriptor.state, LifecycleState::Initialized);

        let report = host
            .activate(
                &PluginSelection::named(["flaky"]),
                &ActivationConfig::new(),
                &CancellationToken::new(),
            )
            .await;
        assert!(report.is_success());
    }
}
