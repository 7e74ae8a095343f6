//! 插件监督器
//!
//! 观察生命周期事件，记录失败事件日志，并按重启策略进行有界的重新初始化。
//! 重试耗尽后插件保持 `Failed` 并标记为需要人工处理。

use super::registry::PluginRegistry;
use crate::core::event_bus::{LifecycleEvent, LifecycleEventKind};
use crate::error::{HostError, Result};
use crate::types::*;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 重启策略
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// 最大重试次数，0 表示只记录不重试
    pub max_retries: u32,
    /// 首次重试前的等待时间
    pub initial_backoff: Duration,
    /// 退避上限
    pub max_backoff: Duration,
    /// 退避倍数
    pub multiplier: u32,
    /// 后台监督任务是否自动重启失败插件
    pub auto_restart: bool,
    /// 失败事件日志保留条数
    pub failure_log_capacity: usize,
}

impl RestartPolicy {
    /// 第 `attempt` 次重试（从 1 开始）之前的等待时间
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2,
            auto_restart: true,
            failure_log_capacity: 256,
        }
    }
}

/// 失败事件
#[derive(Debug, Clone, Serialize)]
pub struct FailureEvent {
    pub id: Uuid,
    pub plugin: PluginName,
    pub prior_state: LifecycleState,
    pub phase: LifecyclePhase,
    pub kind: FailureKind,
    pub error: String,
    pub occurred_at: DateTime<Utc>,
}

/// 恢复结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// 重新初始化成功
    Recovered { attempts: u32 },
    /// 重试耗尽，需要人工处理
    Exhausted { attempts: u32 },
    /// 插件已不处于失败状态
    NotFailed(LifecycleState),
    /// 已有恢复任务在执行
    InProgress,
}

/// 插件监督器
pub struct Supervisor {
    registry: Arc<PluginRegistry>,
    policy: RestartPolicy,
    failures: parking_lot::Mutex<VecDeque<FailureEvent>>,
    recovering: DashSet<PluginName>,
}

impl Supervisor {
    pub fn new(registry: Arc<PluginRegistry>, policy: RestartPolicy) -> Self {
        Self {
            registry,
            policy,
            failures: parking_lot::Mutex::new(VecDeque::new()),
            recovering: DashSet::new(),
        }
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// 失败事件日志，按发生顺序
    pub fn failures(&self) -> Vec<FailureEvent> {
        self.failures.lock().iter().cloned().collect()
    }

    pub fn failures_for(&self, name: &str) -> Vec<FailureEvent> {
        self.failures
            .lock()
            .iter()
            .filter(|f| f.plugin == name)
            .cloned()
            .collect()
    }

    /// 需要人工处理的插件
    pub fn permanent_failures(&self) -> Vec<PluginDescriptor> {
        self.registry
            .list()
            .into_iter()
            .filter(|d| d.requires_operator)
            .collect()
    }

    /// 记录一次失败事件
    pub fn record_failure(&self, event: &LifecycleEvent) -> Option<FailureEvent> {
        let LifecycleEventKind::Failed {
            phase,
            prior_state,
            kind,
            error,
        } = &event.kind
        else {
            return None;
        };

        let failure = FailureEvent {
            id: Uuid::new_v4(),
            plugin: event.plugin.clone(),
            prior_state: *prior_state,
            phase: *phase,
            kind: *kind,
            error: error.clone(),
            occurred_at: event.timestamp,
        };

        let mut failures = self.failures.lock();
        if failures.len() >= self.policy.failure_log_capacity.max(1) {
            failures.pop_front();
        }
        failures.push_back(failure.clone());
        Some(failure)
    }

    /// 按策略对失败插件进行有界的重新初始化
    pub async fn recover(&self, name: &str) -> Result<RecoveryOutcome> {
        if !self.recovering.insert(name.to_string()) {
            return Ok(RecoveryOutcome::InProgress);
        }
        let outcome = self.run_recovery(name).await;
        self.recovering.remove(name);
        outcome
    }

    async fn run_recovery(&self, name: &str) -> Result<RecoveryOutcome> {
        let slot = self.registry.slot(name)?;

        let record = slot.record();
        if record.state != LifecycleState::Failed {
            return Ok(RecoveryOutcome::NotFailed(record.state));
        }
        if record.requires_operator {
            return Ok(RecoveryOutcome::Exhausted {
                attempts: record.restart_attempts,
            });
        }

        while slot.record().restart_attempts < self.policy.max_retries {
            let attempt = slot.update(|r| {
                r.restart_attempts += 1;
                r.restart_attempts
            });
            let delay = self.policy.backoff(attempt);
            debug!(plugin = name, attempt, delay_ms = delay.as_millis() as u64, "waiting before restart");
            tokio::time::sleep(delay).await;

            match self.reinitialize(name).await {
                Ok(()) => {
                    // 重试次数按每次失败计算
                    slot.update(|r| r.restart_attempts = 0);
                    info!(plugin = name, attempt, "plugin recovered");
                    return Ok(RecoveryOutcome::Recovered { attempts: attempt });
                }
                Err(e) if e.is_plugin_failure() => {
                    warn!(plugin = name, attempt, "restart attempt failed: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        let attempts = slot.update(|r| {
            r.requires_operator = true;
            r.restart_attempts
        });
        self.registry.events().publish(LifecycleEvent::new(
            name,
            LifecycleEventKind::PermanentFailure { attempts },
        ));
        error!(plugin = name, attempts, "restart attempts exhausted, operator action required");
        Ok(RecoveryOutcome::Exhausted { attempts })
    }

    /// 人工重置：清除重试计数并立即重新初始化一次
    pub async fn reset(&self, name: &str) -> Result<PluginDescriptor> {
        if !self.recovering.insert(name.to_string()) {
            let state = self.registry.lookup(name)?.state;
            return Err(HostError::InvalidState {
                name: name.to_string(),
                state,
                reason: "a recovery is already in progress".to_string(),
            });
        }

        let result = self.reset_and_initialize(name).await;
        self.recovering.remove(name);
        result
    }

    async fn reset_and_initialize(&self, name: &str) -> Result<PluginDescriptor> {
        let slot = self.registry.slot(name)?;
        self.registry.reset(name).await?;
        slot.update(|r| {
            r.restart_attempts = 0;
            r.requires_operator = false;
        });
        info!(plugin = name, "operator reset");

        if let Err(e) = self.registry.initialize(name).await {
            if !e.is_plugin_failure() {
                return Err(e);
            }
        }
        Ok(slot.descriptor())
    }

    async fn reinitialize(&self, name: &str) -> Result<()> {
        self.registry.reset(name).await?;
        self.registry.initialize(name).await
    }

    /// 处理一个生命周期事件
    pub async fn handle_event(self: &Arc<Self>, event: LifecycleEvent) {
        let Some(failure) = self.record_failure(&event) else {
            return;
        };

        if !self.policy.auto_restart || self.policy.max_retries == 0 {
            return;
        }

        // 恢复过程本身产生的失败只记录，由正在运行的恢复循环继续处理
        if self.recovering.contains(&failure.plugin) {
            return;
        }

        let supervisor = self.clone();
        tokio::spawn(async move {
            match supervisor.recover(&failure.plugin).await {
                Ok(outcome) => debug!(plugin = %failure.plugin, ?outcome, "recovery finished"),
                Err(e) => warn!(plugin = %failure.plugin, "recovery aborted: {}", e),
            }
        });
    }

    /// 启动后台监督任务
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let supervisor = self.clone();
        let mut events = self.registry.events().subscribe();

        tokio::spawn(async move {
            info!("plugin supervisor started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => supervisor.handle_event(event).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "supervisor lagged behind lifecycle events");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            info!("plugin supervisor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event_bus::LifecycleEventBus;
    use crate::plugins::boundary::CallTimeouts;
    use crate::plugins::lifecycle::{CoordinatorConfig, LifecycleCoordinator};
    use crate::plugins::testing::ScriptedPlugin;

    fn fast_policy(max_retries: u32) -> RestartPolicy {
        RestartPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            multiplier: 2,
            auto_restart: true,
            failure_log_capacity: 16,
        }
    }

    fn setup(policy: RestartPolicy) -> (Arc<PluginRegistry>, Arc<Supervisor>) {
        let registry = Arc::new(PluginRegistry::new(
            CallTimeouts::uniform(Duration::from_millis(200)),
            LifecycleEventBus::default(),
        ));
        let supervisor = Arc::new(Supervisor::new(registry.clone(), policy));
        (registry, supervisor)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RestartPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            multiplier: 2,
            ..RestartPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_recover_flaky_init() {
        let (registry, supervisor) = setup(fast_policy(3));
        let plugin = ScriptedPlugin::new().failing_init(2);
        let calls = plugin.counters();
        registry
            .register("flaky", Box::new(plugin), InitOptions::new())
            .await
            .unwrap();

        let outcome = supervisor.recover("flaky").await.unwrap();
        assert_eq!(outcome, RecoveryOutcome::Recovered { attempts: 2 });
        assert_eq!(calls.init(), 3);

        let descriptor = registry.lookup("flaky").unwrap();
        assert_eq!(descriptor.state, LifecycleState::Initialized);
        assert!(!descriptor.requires_operator);
    }

    #[tokio::test]
    async fn test_retry_budget_refills_after_recovery() {
        let (registry, supervisor) = setup(fast_policy(2));
        let coordinator = LifecycleCoordinator::new(registry.clone(), CoordinatorConfig::new(1));
        let plugin = ScriptedPlugin::new().failing_init(2).failing_activate();
        let calls = plugin.counters();
        registry
            .register("flaky", Box::new(plugin), InitOptions::new())
            .await
            .unwrap();

        let outcome = supervisor.recover("flaky").await.unwrap();
        assert_eq!(outcome, RecoveryOutcome::Recovered { attempts: 2 });
        assert_eq!(registry.lookup("flaky").unwrap().restart_attempts, 0);

        assert!(coordinator.activate("flaky", &ActivationConfig::new()).await.is_err());
        assert_eq!(registry.lookup("flaky").unwrap().state, LifecycleState::Failed);

        let outcome = supervisor.recover("flaky").await.unwrap();
        assert_eq!(outcome, RecoveryOutcome::Recovered { attempts: 1 });
        assert_eq!(calls.init(), 4);

        let descriptor = registry.lookup("flaky").unwrap();
        assert_eq!(descriptor.state, LifecycleState::Initialized);
        assert!(!descriptor.requires_operator);
    }

    #[tokio::test]
    async fn test_exhausted_retries_require_operator() {
        let (registry, supervisor) = setup(fast_policy(2));
        let plugin = ScriptedPlugin::new().failing_init(u32::MAX);
        let calls = plugin.counters();
        registry
            .register("broken", Box::new(plugin), InitOptions::new())
            .await
            .unwrap();

        let outcome = supervisor.recover("broken").await.unwrap();
        assert_eq!(outcome, RecoveryOutcome::Exhausted { attempts: 2 });
        assert_eq!(calls.init(), 3);

        let descriptor = registry.lookup("broken").unwrap();
        assert_eq!(descriptor.state, LifecycleState::Failed);
        assert!(descriptor.requires_operator);
        assert_eq!(supervisor.permanent_failures().len(), 1);

        // 永久失败后不会再自动调用插件
        let outcome = supervisor.recover("broken").await.unwrap();
        assert_eq!(outcome, RecoveryOutcome::Exhausted { attempts: 2 });
        assert_eq!(calls.init(), 3);
    }

    #[tokio::test]
    async fn test_operator_reset_clears_permanent_failure() {
        let (registry, supervisor) = setup(fast_policy(1));
        let plugin = ScriptedPlugin::new().failing_init(2);
        let calls = plugin.counters();
        registry
            .register("flaky", Box::new(plugin), InitOptions::new())
            .await
            .unwrap();

        let outcome = supervisor.recover("flaky").await.unwrap();
        assert_eq!(outcome, RecoveryOutcome::Exhausted { attempts: 1 });

        let descriptor = supervisor.reset("flaky").await.unwrap();
        assert_eq!(descriptor.state, LifecycleState::Initialized);
        assert_eq!(descriptor.restart_attempts, 0);
        assert!(!descriptor.requires_operator);
        assert_eq!(calls.init(), 3);
    }

    #[tokio::test]
    async fn test_reset_cleans_up_failed_activation() {
        let (registry, supervisor) = setup(fast_policy(0));
        let coordinator = LifecycleCoordinator::new(registry.clone(), CoordinatorConfig::new(1));
        let plugin = ScriptedPlugin::new().failing_activate();
        let calls = plugin.counters();
        registry
            .register("amqp", Box::new(plugin), InitOptions::new())
            .await
            .unwrap();

        let mut config = ActivationConfig::new();
        config.insert("endpoint".to_string(), serde_json::json!("amqp://local"));
        assert!(coordinator.activate("amqp", &config).await.is_err());

        supervisor.reset("amqp").await.unwrap();
        assert_eq!(calls.deactivate(), 1);
        assert_eq!(registry.lookup("amqp").unwrap().state, LifecycleState::Initialized);
    }

    #[tokio::test]
    async fn test_reset_requires_failed_state() {
        let (registry, supervisor) = setup(fast_policy(1));
        registry
            .register("metrics", Box::new(ScriptedPlugin::new()), InitOptions::new())
            .await
            .unwrap();

        let err = supervisor.reset("metrics").await.unwrap_err();
        assert!(matches!(err, HostError::InvalidState { .. }));
        let outcome = supervisor.recover("metrics").await.unwrap();
        assert_eq!(outcome, RecoveryOutcome::NotFailed(LifecycleState::Initialized));
    }

    #[tokio::test]
    async fn test_failure_log_is_bounded() {
        let (_registry, supervisor) = setup(RestartPolicy {
            failure_log_capacity: 2,
            ..fast_policy(0)
        });

        for i in 0..3 {
            let event = LifecycleEvent::new(
                &format!("plugin-{}", i),
                LifecycleEventKind::Failed {
                    phase: LifecyclePhase::Activate,
                    prior_state: LifecycleState::Initialized,
                    kind: FailureKind::Error,
                    error: "refused".to_string(),
                },
            );
            assert!(supervisor.record_failure(&event).is_some());
        }
        assert!(supervisor
            .record_failure(&LifecycleEvent::new("x", LifecycleEventKind::Registered))
            .is_none());

        let plugins: Vec<_> = supervisor.failures().into_iter().map(|f| f.plugin).collect();
        assert_eq!(plugins, vec!["plugin-1", "plugin-2"]);
    }

    #[tokio::test]
    async fn test_background_supervision_restarts_failed_plugin() {
        let (registry, supervisor) = setup(fast_policy(3));
        let cancel = CancellationToken::new();
        let handle = supervisor.spawn(cancel.clone());

        let plugin = ScriptedPlugin::new().failing_init(1);
        let calls = plugin.counters();
        let registration = registry
            .register("flaky", Box::new(plugin), InitOptions::new())
            .await
            .unwrap();
        assert_eq!(registration.descriptor.state, LifecycleState::Failed);

        let mut recovered = false;
        for _ in 0..100 {
            if registry.lookup("flaky").unwrap().state == LifecycleState::Initialized {
                recovered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(recovered);
        assert_eq!(calls.init(), 2);

        let failures = supervisor.failures_for("flaky");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].phase, LifecyclePhase::Init);
        assert_eq!(failures[0].prior_state, LifecycleState::Uninitialized);

        cancel.cancel();
        handle.await.unwrap();
    }
}
