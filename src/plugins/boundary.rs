//! 插件调用的失败边界
//!
//! 每一次插件调用都在这里加上超时并捕获 panic，统一转换为对应阶段的 [`HostError`]

use crate::error::{HostError, Result};
use crate::types::{FailureKind, LifecyclePhase};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::warn;

/// 各阶段的调用超时
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTimeouts {
    pub init: Duration,
    pub activate: Duration,
    pub deactivate: Duration,
    pub info: Duration,
}

impl CallTimeouts {
    /// 所有阶段使用同一个超时
    pub fn uniform(limit: Duration) -> Self {
        Self {
            init: limit,
            activate: limit,
            deactivate: limit,
            info: limit,
        }
    }

    pub fn for_phase(&self, phase: LifecyclePhase) -> Duration {
        match phase {
            LifecyclePhase::Init => self.init,
            LifecyclePhase::Activate => self.activate,
            LifecyclePhase::Deactivate => self.deactivate,
            LifecyclePhase::Info => self.info,
        }
    }
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self {
            init: Duration::from_secs(30),
            activate: Duration::from_secs(30),
            deactivate: Duration::from_secs(10),
            info: Duration::from_secs(5),
        }
    }
}

/// 在失败边界内执行一次插件调用
///
/// 超时后被调用的 future 会被丢弃，调用方需要把插件标记为失败。
pub async fn guarded_call<T, F>(
    name: &str,
    phase: LifecyclePhase,
    limit: Duration,
    call: F,
) -> Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let outcome = tokio::time::timeout(limit, AssertUnwindSafe(call).catch_unwind()).await;

    match outcome {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(e))) => Err(HostError::plugin_failure(
            name,
            phase,
            FailureKind::Error,
            format!("{:#}", e),
        )),
        Ok(Err(payload)) => {
            let message = panic_message(payload.as_ref());
            warn!(plugin = name, %phase, "plugin panicked: {}", message);
            Err(HostError::plugin_failure(name, phase, FailureKind::Panic, message))
        }
        Err(_) => {
            warn!(plugin = name, %phase, timeout_ms = limit.as_millis() as u64, "plugin call timed out");
            Err(HostError::plugin_failure(
                name,
                phase,
                FailureKind::Timeout,
                format!("call exceeded {}ms", limit.as_millis()),
            ))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
