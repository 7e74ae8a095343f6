//! 插件生命周期协调器
//!
//! 负责驱动 activate / deactivate 状态迁移：
//! - 只允许 `Initialized -> Active` 和 `Active -> Deactivated`
//! - 同一插件同一时刻最多一个迁移在执行（按插件串行，而非全局串行）
//! - 批量操作通过有界工作池并发执行，支持协作式取消

use super::registry::{mark_failed, PluginRegistry};
use super::boundary::guarded_call;
use crate::core::event_bus::{LifecycleEvent, LifecycleEventKind};
use crate::error::{HostError, Result};
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 插件处于 `Failed` / `Uninitialized` 时 info 查询的行为
///
/// 这两种状态下都不会调用插件。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InactiveInfoPolicy {
    /// 返回最后一次成功的快照
    #[default]
    CachedSnapshot,
    /// 返回空映射
    Empty,
}

/// 协调器配置
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// 工作池大小，构造时必须显式给出
    pub worker_pool_size: usize,
    /// 是否允许 `Deactivated -> Active`
    pub allow_reactivation: bool,
    pub inactive_info: InactiveInfoPolicy,
}

impl CoordinatorConfig {
    pub fn new(worker_pool_size: usize) -> Self {
        Self {
            worker_pool_size: worker_pool_size.max(1),
            allow_reactivation: false,
            inactive_info: InactiveInfoPolicy::default(),
        }
    }

    pub fn with_reactivation(mut self, allow: bool) -> Self {
        self.allow_reactivation = allow;
        self
    }

    pub fn with_inactive_info(mut self, policy: InactiveInfoPolicy) -> Self {
        self.inactive_info = policy;
        self
    }
}

/// 批量操作的目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginSelection {
    /// 所有已注册插件，按注册顺序
    All,
    /// 指定名称
    Named(Vec<PluginName>),
}

impl PluginSelection {
    pub fn named<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<PluginName>,
    {
        Self::Named(names.into_iter().map(Into::into).collect())
    }

    fn resolve(&self, registry: &PluginRegistry) -> Vec<PluginName> {
        match self {
            PluginSelection::All => registry.names(),
            PluginSelection::Named(names) => names.clone(),
        }
    }
}

/// 单个插件在批量操作中的结果
#[derive(Debug)]
pub enum BatchOutcome {
    /// 迁移成功，携带新状态
    Completed(LifecycleState),
    /// 迁移失败
    Failed(HostError),
    /// 取消后未被调度
    NotReached,
}

/// 批量操作报告，顺序与请求顺序一致
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<(PluginName, BatchOutcome)>,
    /// 是否因取消而提前停止调度
    pub cancelled: bool,
}

impl BatchReport {
    pub fn outcome(&self, name: &str) -> Option<&BatchOutcome> {
        self.outcomes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, outcome)| outcome)
    }

    pub fn completed(&self) -> Vec<&str> {
        self.filter(|o| matches!(o, BatchOutcome::Completed(_)))
    }

    pub fn failed(&self) -> Vec<&str> {
        self.filter(|o| matches!(o, BatchOutcome::Failed(_)))
    }

    pub fn not_reached(&self) -> Vec<&str> {
        self.filter(|o| matches!(o, BatchOutcome::NotReached))
    }

    /// 所有插件都迁移成功
    pub fn is_success(&self) -> bool {
        self.outcomes
            .iter()
            .all(|(_, o)| matches!(o, BatchOutcome::Completed(_)))
    }

    fn filter(&self, pred: impl Fn(&BatchOutcome) -> bool) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| pred(o))
            .map(|(n, _)| n.as_str())
            .collect()
    }
}

/// 插件生命周期协调器
#[derive(Clone)]
pub struct LifecycleCoordinator {
    registry: Arc<PluginRegistry>,
    config: CoordinatorConfig,
    pool: Arc<Semaphore>,
    /// 关闭开始后拒绝新的激活
    shutting_down: Arc<AtomicBool>,
}

impl LifecycleCoordinator {
    pub fn new(registry: Arc<PluginRegistry>, config: CoordinatorConfig) -> Self {
        let pool = Arc::new(Semaphore::new(config.worker_pool_size));
        Self {
            registry,
            config,
            pool,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// 激活单个插件
    pub async fn activate(&self, name: &str, config: &ActivationConfig) -> Result<LifecycleState> {
        let _permit = self.pool.acquire().await.map_err(|_| pool_closed(name, LifecyclePhase::Activate))?;
        self.transition(name, LifecyclePhase::Activate, config).await
    }

    /// 停用单个插件
    pub async fn deactivate(&self, name: &str, config: &ActivationConfig) -> Result<LifecycleState> {
        let _permit = self.pool.acquire().await.map_err(|_| pool_closed(name, LifecyclePhase::Deactivate))?;
        self.transition(name, LifecyclePhase::Deactivate, config).await
    }

    /// 批量激活
    pub async fn activate_batch(
        &self,
        selection: &PluginSelection,
        config: &ActivationConfig,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let names = selection.resolve(&self.registry);
        self.run_batch(names, LifecyclePhase::Activate, config, cancel).await
    }

    /// 批量停用
    pub async fn deactivate_batch(
        &self,
        selection: &PluginSelection,
        config: &ActivationConfig,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let names = selection.resolve(&self.registry);
        self.run_batch(names, LifecyclePhase::Deactivate, config, cancel).await
    }

    /// 停用所有运行中的插件，按注册逆序调度
    ///
    /// 关闭开始后新的激活会被拒绝；正在进行的迁移先完成，再决定需要停用的插件。
    /// 每个 deactivate 调用都会等到完成或超时后才返回。
    pub async fn shutdown(&self, config: &ActivationConfig) -> BatchReport {
        self.shutting_down.store(true, Ordering::SeqCst);

        let mut names = Vec::new();
        for slot in self.registry.slots() {
            // 等待该插件正在进行的迁移结束
            drop(slot.instance.write().await);
            if slot.state() == LifecycleState::Active {
                names.push(slot.name.clone());
            }
        }
        names.reverse();

        info!(count = names.len(), "shutting down active plugins");
        let report = self
            .run_batch(names, LifecyclePhase::Deactivate, config, &CancellationToken::new())
            .await;

        if report.is_success() {
            info!("all active plugins deactivated");
        } else {
            warn!(failed = ?report.failed(), "shutdown completed with failures");
        }
        report
    }

    /// 调用插件的 info 并保存快照
    ///
    /// 与同一插件的 activate / deactivate 串行，与其它 info 调用并发。
    pub async fn refresh_info(&self, name: &str) -> Result<InfoSnapshot> {
        let slot = self.registry.slot(name)?;
        if !slot.state().accepts_calls() {
            return Ok(self.inactive_snapshot(&slot.record().info));
        }

        let instance = slot.instance.read().await;
        // 等锁期间状态可能已变化
        let state = slot.state();
        if !state.accepts_calls() {
            return Ok(self.inactive_snapshot(&slot.record().info));
        }

        let limit = self.registry.timeouts().info;
        match guarded_call(name, LifecyclePhase::Info, limit, instance.info()).await {
            Ok(snapshot) => {
                slot.update(|r| r.info = snapshot.clone());
                Ok(snapshot)
            }
            Err(e) => {
                // 普通错误只返回给调用方；超时和 panic 后不再信任该实例
                if e.failure_kind() != Some(FailureKind::Error) {
                    mark_failed(&slot, state, &e, self.registry.events());
                }
                Err(e)
            }
        }
    }

    /// 并发刷新所有插件的 info，返回最新描述符列表
    pub async fn refresh_all_info(&self) -> Vec<PluginDescriptor> {
        let names = self.registry.names();
        let refreshes = names.iter().map(|name| async move {
            if let Err(e) = self.refresh_info(name).await {
                debug!(plugin = %name, "info refresh failed: {}", e);
            }
        });
        futures::future::join_all(refreshes).await;
        self.registry.list()
    }

    fn inactive_snapshot(&self, cached: &InfoSnapshot) -> InfoSnapshot {
        match self.config.inactive_info {
            InactiveInfoPolicy::CachedSnapshot => cached.clone(),
            InactiveInfoPolicy::Empty => InfoSnapshot::new(),
        }
    }

    async fn run_batch(
        &self,
        names: Vec<PluginName>,
        phase: LifecyclePhase,
        config: &ActivationConfig,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let config = Arc::new(config.clone());
        let mut results: Vec<Option<BatchOutcome>> = names.iter().map(|_| None).collect();
        let mut dispatched = vec![false; names.len()];
        let mut tasks = JoinSet::new();
        let mut cancelled = false;

        for (idx, name) in names.iter().enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                permit = self.pool.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        error!("worker pool closed, stopping batch dispatch");
                        cancelled = true;
                        break;
                    }
                },
            };

            dispatched[idx] = true;
            let coordinator = self.clone();
            let name = name.clone();
            let config = config.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = coordinator.transition(&name, phase, &config).await;
                (idx, result)
            });
        }

        if cancelled {
            info!(%phase, dispatched = dispatched.iter().filter(|d| **d).count(), "batch cancelled");
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, Ok(state))) => results[idx] = Some(BatchOutcome::Completed(state)),
                Ok((idx, Err(e))) => results[idx] = Some(BatchOutcome::Failed(e)),
                Err(e) => error!(%phase, "transition task aborted: {}", e),
            }
        }

        let outcomes = names
            .into_iter()
            .zip(results)
            .zip(dispatched)
            .map(|((name, result), was_dispatched)| {
                let outcome = match (result, was_dispatched) {
                    (Some(outcome), _) => outcome,
                    (None, true) => BatchOutcome::Failed(HostError::plugin_failure(
                        &name,
                        phase,
                        FailureKind::Panic,
                        "transition task aborted",
                    )),
                    (None, false) => BatchOutcome::NotReached,
                };
                (name, outcome)
            })
            .collect();

        BatchReport {
            outcomes,
            cancelled,
        }
    }

    async fn transition(
        &self,
        name: &str,
        phase: LifecyclePhase,
        config: &ActivationConfig,
    ) -> Result<LifecycleState> {
        let slot = self.registry.slot(name)?;
        let events = self.registry.events();
        let mut instance = slot.instance.write().await;
        slot.ensure_registered()?;

        let prior = slot.state();
        if phase == LifecyclePhase::Activate && self.is_shutting_down() {
            return Err(HostError::InvalidState {
                name: name.to_string(),
                state: prior,
                reason: "the host is shutting down".to_string(),
            });
        }

        let (target, legal) = match phase {
            LifecyclePhase::Activate => (
                LifecycleState::Active,
                prior == LifecycleState::Initialized
                    || (self.config.allow_reactivation && prior == LifecycleState::Deactivated),
            ),
            _ => (LifecycleState::Deactivated, prior == LifecycleState::Active),
        };

        if !legal {
            return Err(HostError::InvalidTransition {
                name: name.to_string(),
                from: prior,
                to: target,
            });
        }

        events.publish(LifecycleEvent::new(
            name,
            LifecycleEventKind::TransitionStarted { phase },
        ));
        if phase == LifecyclePhase::Activate {
            slot.update(|r| r.last_activation = Some(config.clone()));
        }

        let limit = self.registry.timeouts().for_phase(phase);
        let call = match phase {
            LifecyclePhase::Activate => instance.activate(config),
            _ => instance.deactivate(config),
        };

        match guarded_call(name, phase, limit, call).await {
            Ok(()) => {
                slot.set_state(target);
                events.publish(LifecycleEvent::new(
                    name,
                    LifecycleEventKind::TransitionCompleted {
                        phase,
                        state: target,
                    },
                ));
                info!(plugin = name, from = %prior, to = %target, "plugin transitioned");
                Ok(target)
            }
            Err(e) => {
                mark_failed(&slot, prior, &e, events);
                Err(e)
            }
        }
    }
}

fn pool_closed(name: &str, phase: LifecyclePhase) -> HostError {
    HostError::plugin_failure(name, phase, FailureKind::Error, "worker pool closed")
}
