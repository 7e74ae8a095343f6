//! 插件宿主核心数据类型模块
//!
//! 生命周期状态、配置映射以及描述符快照等跨模块共享的类型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::Arc;

/// 插件名称 - 注册表内唯一，大小写敏感
pub type PluginName = String;

/// 初始化选项 - 注册时传入，之后不可变
pub type InitOptions = HashMap<String, serde_json::Value>;

/// 激活配置 - 调用方持有，插件只读
pub type ActivationConfig = HashMap<String, serde_json::Value>;

/// 插件信息快照
pub type InfoSnapshot = HashMap<String, serde_json::Value>;

/// 插件生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// 未初始化
    Uninitialized,
    /// 已初始化
    Initialized,
    /// 运行中
    Active,
    /// 已停用
    Deactivated,
    /// 失败（终态，需要监督器重置）
    Failed,
}

impl LifecycleState {
    /// 是否允许注销
    pub fn is_removable(self) -> bool {
        matches!(self, LifecycleState::Deactivated | LifecycleState::Failed)
    }

    /// 插件是否处于可以接受调用的状态
    pub fn accepts_calls(self) -> bool {
        matches!(
            self,
            LifecycleState::Initialized | LifecycleState::Active | LifecycleState::Deactivated
        )
    }
}

impl Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Active => "active",
            LifecycleState::Deactivated => "deactivated",
            LifecycleState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// 生命周期阶段 - 对应契约中的四个操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecyclePhase {
    Init,
    Activate,
    Deactivate,
    Info,
}

impl Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecyclePhase::Init => "init",
            LifecyclePhase::Activate => "activate",
            LifecyclePhase::Deactivate => "deactivate",
            LifecyclePhase::Info => "info",
        };
        f.write_str(name)
    }
}

/// 插件调用失败的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// 插件返回错误
    Error,
    /// 超过调用超时
    Timeout,
    /// 插件内部panic
    Panic,
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Error => "error",
            FailureKind::Timeout => "timeout",
            FailureKind::Panic => "panic",
        };
        f.write_str(name)
    }
}

/// 插件初始化返回的不透明句柄
///
/// 宿主不解释句柄内容，只负责保存，插件或宿主应用可以通过 [`PluginHandle::downcast_ref`] 取回。
#[derive(Clone)]
pub struct PluginHandle(Arc<dyn Any + Send + Sync>);

impl PluginHandle {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// 不携带任何数据的句柄
    pub fn empty() -> Self {
        Self::new(())
    }

    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PluginHandle(..)")
    }
}

/// 插件描述符 - 注册表内部记录的只读快照
#[derive(Debug, Clone, Serialize)]
pub struct PluginDescriptor {
    /// 插件名称
    pub name: PluginName,
    /// 当前生命周期状态
    pub state: LifecycleState,
    /// 最近一次 info 调用的快照
    pub info: InfoSnapshot,
    /// 初始化句柄
    #[serde(skip)]
    pub handle: Option<PluginHandle>,
    /// 最后错误
    pub last_error: Option<String>,
    /// 最后一次失败的类型
    pub last_failure_kind: Option<FailureKind>,
    /// 监督器重启尝试次数
    pub restart_attempts: u32,
    /// 重试耗尽，需要人工处理
    pub requires_operator: bool,
    /// 注册时间
    pub registered_at: DateTime<Utc>,
    /// 状态变更时间
    pub state_changed_at: DateTime<Utc>,
}
