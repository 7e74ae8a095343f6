//! 生命周期事件总线
//!
//! 注册表和协调器发布状态变化，监督器和宿主应用订阅

use crate::types::{FailureKind, LifecyclePhase, LifecycleState, PluginName};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// 默认事件通道容量
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// 生命周期事件类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LifecycleEventKind {
    /// 插件注册
    Registered,
    /// 状态迁移开始
    TransitionStarted { phase: LifecyclePhase },
    /// 状态迁移完成
    TransitionCompleted {
        phase: LifecyclePhase,
        state: LifecycleState,
    },
    /// 插件进入失败状态
    Failed {
        phase: LifecyclePhase,
        prior_state: LifecycleState,
        kind: FailureKind,
        error: String,
    },
    /// 监督器重置
    Reset,
    /// 重试耗尽
    PermanentFailure { attempts: u32 },
    /// 插件注销
    Unregistered,
}

/// 插件生命周期事件
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEvent {
    /// 插件名称
    pub plugin: PluginName,
    /// 事件类型
    pub kind: LifecycleEventKind,
    /// 事件时间
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(plugin: &str, kind: LifecycleEventKind) -> Self {
        Self {
            plugin: plugin.to_string(),
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// 生命周期事件总线
///
/// 基于 broadcast 通道，没有订阅者时事件直接丢弃；订阅者落后太多时会收到 `Lagged`。
#[derive(Clone)]
pub struct LifecycleEventBus {
    sender: broadcast::Sender<LifecycleEvent>,
    published: Arc<AtomicU64>,
}

impl LifecycleEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 发布事件
    pub fn publish(&self, event: LifecycleEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        if self.sender.send(event).is_err() {
            debug!("lifecycle event dropped, no subscribers");
        }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// 已发布的事件总数
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for LifecycleEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
