//! 插件注册表
//!
//! 持有插件实例及其生命周期记录。插件实例由注册表独占，
//! 读取描述符只会短暂持有记录锁，不会等待正在进行的生命周期调用。

use super::boundary::{guarded_call, CallTimeouts};
use super::core::Plugin;
use crate::core::event_bus::{LifecycleEvent, LifecycleEventBus, LifecycleEventKind};
use crate::error::{HostError, Result};
use crate::types::*;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// 插件记录 - 描述符的可变部分
#[derive(Debug, Clone)]
pub(crate) struct SlotRecord {
    pub state: LifecycleState,
    pub info: InfoSnapshot,
    pub handle: Option<PluginHandle>,
    pub last_error: Option<String>,
    pub last_failure_kind: Option<FailureKind>,
    /// 失败时插件可能仍持有 activate 获取的资源
    pub needs_cleanup: bool,
    pub last_activation: Option<ActivationConfig>,
    pub restart_attempts: u32,
    pub requires_operator: bool,
    /// 已从注册表移除，之后不再调用实例
    pub removed: bool,
    pub registered_at: DateTime<Utc>,
    pub state_changed_at: DateTime<Utc>,
}

/// 注册表中的一个插件
pub(crate) struct PluginSlot {
    pub name: PluginName,
    pub options: InitOptions,
    /// info 使用读锁，状态迁移使用写锁
    pub instance: RwLock<Box<dyn Plugin>>,
    record: parking_lot::RwLock<SlotRecord>,
}

impl PluginSlot {
    fn new(name: PluginName, plugin: Box<dyn Plugin>, options: InitOptions) -> Self {
        let now = Utc::now();
        Self {
            name,
            options,
            instance: RwLock::new(plugin),
            record: parking_lot::RwLock::new(SlotRecord {
                state: LifecycleState::Uninitialized,
                info: InfoSnapshot::new(),
                handle: None,
                last_error: None,
                last_failure_kind: None,
                needs_cleanup: false,
                last_activation: None,
                restart_attempts: 0,
                requires_operator: false,
                removed: false,
                registered_at: now,
                state_changed_at: now,
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.record.read().state
    }

    pub fn record(&self) -> SlotRecord {
        self.record.read().clone()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut SlotRecord) -> R) -> R {
        let mut record = self.record.write();
        f(&mut record)
    }

    pub fn set_state(&self, state: LifecycleState) {
        self.update(|r| {
            r.state = state;
            r.state_changed_at = Utc::now();
        });
    }

    /// 在持有实例锁后调用，确认插件仍在注册表中
    pub fn ensure_registered(&self) -> Result<()> {
        if self.record.read().removed {
            return Err(HostError::NotFound {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    pub fn descriptor(&self) -> PluginDescriptor {
        let record = self.record.read();
        PluginDescriptor {
            name: self.name.clone(),
            state: record.state,
            info: record.info.clone(),
            handle: record.handle.clone(),
            last_error: record.last_error.clone(),
            last_failure_kind: record.last_failure_kind,
            restart_attempts: record.restart_attempts,
            requires_operator: record.requires_operator,
            registered_at: record.registered_at,
            state_changed_at: record.state_changed_at,
        }
    }
}

/// 把插件标记为失败并发布事件
pub(crate) fn mark_failed(
    slot: &PluginSlot,
    prior_state: LifecycleState,
    error: &HostError,
    events: &LifecycleEventBus,
) {
    let phase = error.phase().unwrap_or(LifecyclePhase::Init);
    let kind = error.failure_kind().unwrap_or(FailureKind::Error);
    let message = error.to_string();

    slot.update(|r| {
        r.state = LifecycleState::Failed;
        r.state_changed_at = Utc::now();
        r.last_error = Some(message.clone());
        r.last_failure_kind = Some(kind);
        r.needs_cleanup = r.needs_cleanup
            || prior_state == LifecycleState::Active
            || matches!(phase, LifecyclePhase::Activate | LifecyclePhase::Deactivate);
    });

    warn!(
        plugin = %slot.name,
        %phase,
        %kind,
        prior = %prior_state,
        "plugin failed: {}",
        message
    );

    events.publish(LifecycleEvent::new(
        &slot.name,
        LifecycleEventKind::Failed {
            phase,
            prior_state,
            kind,
            error: message,
        },
    ));
}

/// 注册结果
///
/// 初始化失败不会导致注册失败：描述符处于 `Failed`，错误随结果一起返回。
#[derive(Debug)]
pub struct Registration {
    pub descriptor: PluginDescriptor,
    pub init_error: Option<HostError>,
}

impl Registration {
    pub fn is_initialized(&self) -> bool {
        self.init_error.is_none() && self.descriptor.state == LifecycleState::Initialized
    }
}

/// 插件注册表
pub struct PluginRegistry {
    /// 按注册顺序保存
    slots: parking_lot::RwLock<Vec<Arc<PluginSlot>>>,
    timeouts: CallTimeouts,
    events: LifecycleEventBus,
}

impl PluginRegistry {
    pub fn new(timeouts: CallTimeouts, events: LifecycleEventBus) -> Self {
        Self {
            slots: parking_lot::RwLock::new(Vec::new()),
            timeouts,
            events,
        }
    }

    pub fn timeouts(&self) -> &CallTimeouts {
        &self.timeouts
    }

    pub fn events(&self) -> &LifecycleEventBus {
        &self.events
    }

    /// 注册插件并同步执行初始化
    pub async fn register(
        &self,
        name: impl Into<PluginName>,
        plugin: Box<dyn Plugin>,
        options: InitOptions,
    ) -> Result<Registration> {
        let name = name.into();
        let slot = {
            let mut slots = self.slots.write();
            if slots.iter().any(|s| s.name == name) {
                return Err(HostError::DuplicateName { name });
            }
            let slot = Arc::new(PluginSlot::new(name.clone(), plugin, options));
            slots.push(slot.clone());
            slot
        };

        self.events
            .publish(LifecycleEvent::new(&name, LifecycleEventKind::Registered));
        debug!(plugin = %name, "plugin registered, initializing");

        let init_error = self.initialize_slot(&slot).await.err();
        Ok(Registration {
            descriptor: slot.descriptor(),
            init_error,
        })
    }

    /// 查找插件
    pub fn lookup(&self, name: &str) -> Result<PluginDescriptor> {
        self.slot(name).map(|slot| slot.descriptor())
    }

    /// 按注册顺序列出所有插件
    pub fn list(&self) -> Vec<PluginDescriptor> {
        let slots = self.slots.read();
        slots.iter().map(|slot| slot.descriptor()).collect()
    }

    pub fn names(&self) -> Vec<PluginName> {
        let slots = self.slots.read();
        slots.iter().map(|slot| slot.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// 注销插件，只允许 `Deactivated` 或 `Failed` 状态
    pub async fn unregister(&self, name: &str) -> Result<()> {
        let slot = self.slot(name)?;
        // 等待正在进行的调用结束
        let _instance = slot.instance.write().await;

        let state = slot.state();
        if !state.is_removable() {
            return Err(HostError::InvalidState {
                name: name.to_string(),
                state,
                reason: "deactivate it or wait for it to fail before unregistering".to_string(),
            });
        }

        {
            let mut slots = self.slots.write();
            let before = slots.len();
            slots.retain(|s| !Arc::ptr_eq(s, &slot));
            if slots.len() == before {
                return Err(HostError::NotFound {
                    name: name.to_string(),
                });
            }
        }
        slot.update(|r| r.removed = true);

        self.events
            .publish(LifecycleEvent::new(name, LifecycleEventKind::Unregistered));
        info!(plugin = name, "plugin unregistered");
        Ok(())
    }

    pub(crate) fn slot(&self, name: &str) -> Result<Arc<PluginSlot>> {
        let slots = self.slots.read();
        slots
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| HostError::NotFound {
                name: name.to_string(),
            })
    }

    pub(crate) fn slots(&self) -> Vec<Arc<PluginSlot>> {
        self.slots.read().clone()
    }

    /// 执行 `Uninitialized -> Initialized`
    pub(crate) async fn initialize(&self, name: &str) -> Result<()> {
        let slot = self.slot(name)?;
        self.initialize_slot(&slot).await
    }

    async fn initialize_slot(&self, slot: &PluginSlot) -> Result<()> {
        let mut instance = slot.instance.write().await;
        slot.ensure_registered()?;

        let prior = slot.state();
        if prior != LifecycleState::Uninitialized {
            return Err(HostError::InvalidTransition {
                name: slot.name.clone(),
                from: prior,
                to: LifecycleState::Initialized,
            });
        }

        self.events.publish(LifecycleEvent::new(
            &slot.name,
            LifecycleEventKind::TransitionStarted {
                phase: LifecyclePhase::Init,
            },
        ));

        let result = guarded_call(
            &slot.name,
            LifecyclePhase::Init,
            self.timeouts.init,
            instance.init_plugin(&slot.options),
        )
        .await;

        match result {
            Ok(handle) => {
                slot.update(|r| {
                    r.handle = Some(handle);
                    r.state = LifecycleState::Initialized;
                    r.state_changed_at = Utc::now();
                });
                self.events.publish(LifecycleEvent::new(
                    &slot.name,
                    LifecycleEventKind::TransitionCompleted {
                        phase: LifecyclePhase::Init,
                        state: LifecycleState::Initialized,
                    },
                ));
                info!(plugin = %slot.name, "plugin initialized");
                Ok(())
            }
            Err(e) => {
                mark_failed(slot, prior, &e, &self.events);
                Err(e)
            }
        }
    }

    /// 把 `Failed` 插件重置为 `Uninitialized`
    ///
    /// 插件失败时若可能持有资源，先以最后一次激活配置尽力调用一次 `deactivate`。
    pub(crate) async fn reset(&self, name: &str) -> Result<()> {
        let slot = self.slot(name)?;
        let mut instance = slot.instance.write().await;
        slot.ensure_registered()?;

        let record = slot.record();
        if record.state != LifecycleState::Failed {
            return Err(HostError::InvalidState {
                name: name.to_string(),
                state: record.state,
                reason: "only failed plugins can be reset".to_string(),
            });
        }

        if record.needs_cleanup {
            let config = record.last_activation.clone().unwrap_or_default();
            let cleanup = guarded_call(
                name,
                LifecyclePhase::Deactivate,
                self.timeouts.deactivate,
                instance.deactivate(&config),
            )
            .await;
            if let Err(e) = cleanup {
                warn!(plugin = name, "cleanup before reset failed: {}", e);
            }
        }

        slot.update(|r| {
            r.state = LifecycleState::Uninitialized;
            r.state_changed_at = Utc::now();
            r.handle = None;
            r.info.clear();
            r.needs_cleanup = false;
            r.last_activation = None;
        });

        self.events
            .publish(LifecycleEvent::new(name, LifecycleEventKind::Reset));
        info!(plugin = name, "plugin reset to uninitialized");
        Ok(())
    }
}
