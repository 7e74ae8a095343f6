//! 插件宿主错误处理系统
//!
//! 统一的错误类型：调用方使用错误立即返回且不重试；插件产生的错误记录在描述符上，由监督器决定是否重试

use crate::types::{FailureKind, LifecyclePhase, LifecycleState, PluginName};
use thiserror::Error;

/// 宿主统一错误类型
#[derive(Error, Debug)]
pub enum HostError {
    #[error("plugin '{name}' is already registered")]
    DuplicateName { name: PluginName },

    #[error("plugin '{name}' not found")]
    NotFound { name: PluginName },

    #[error("plugin '{name}' is {state}, {reason}")]
    InvalidState {
        name: PluginName,
        state: LifecycleState,
        reason: String,
    },

    #[error("plugin '{name}' cannot move from {from} to {to}")]
    InvalidTransition {
        name: PluginName,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("plugin '{name}' init failed ({kind}): {reason}")]
    Init {
        name: PluginName,
        kind: FailureKind,
        reason: String,
    },

    #[error("plugin '{name}' activation failed ({kind}): {reason}")]
    Activation {
        name: PluginName,
        kind: FailureKind,
        reason: String,
    },

    #[error("plugin '{name}' deactivation failed ({kind}): {reason}")]
    Deactivation {
        name: PluginName,
        kind: FailureKind,
        reason: String,
    },

    #[error("plugin '{name}' info failed ({kind}): {reason}")]
    Info {
        name: PluginName,
        kind: FailureKind,
        reason: String,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HostError {
    /// 根据生命周期阶段构造插件错误
    pub fn plugin_failure(
        name: &str,
        phase: LifecyclePhase,
        kind: FailureKind,
        reason: impl Into<String>,
    ) -> Self {
        let name = name.to_string();
        let reason = reason.into();
        match phase {
            LifecyclePhase::Init => Self::Init { name, kind, reason },
            LifecyclePhase::Activate => Self::Activation { name, kind, reason },
            LifecyclePhase::Deactivate => Self::Deactivation { name, kind, reason },
            LifecyclePhase::Info => Self::Info { name, kind, reason },
        }
    }

    /// 创建配置相关错误
    pub fn config(message: &str) -> Self {
        Self::Config {
            message: message.to_string(),
        }
    }

    /// 调用方使用错误，不会被重试
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateName { .. }
                | Self::NotFound { .. }
                | Self::InvalidState { .. }
                | Self::InvalidTransition { .. }
        )
    }

    /// 插件产生的错误
    pub fn is_plugin_failure(&self) -> bool {
        self.failure_kind().is_some()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Init { kind, .. }
            | Self::Activation { kind, .. }
            | Self::Deactivation { kind, .. }
            | Self::Info { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// 插件错误对应的生命周期阶段
    pub fn phase(&self) -> Option<LifecyclePhase> {
        match self {
            Self::Init { .. } => Some(LifecyclePhase::Init),
            Self::Activation { .. } => Some(LifecyclePhase::Activate),
            Self::Deactivation { .. } => Some(LifecyclePhase::Deactivate),
            Self::Info { .. } => Some(LifecyclePhase::Info),
            _ => None,
        }
    }
}

impl From<serde_yaml::Error> for HostError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Config {
            message: format!("YAML error: {}", e),
        }
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, HostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let usage = HostError::NotFound {
            name: "metrics".to_string(),
        };
        assert!(usage.is_usage_error());
        assert!(!usage.is_plugin_failure());
        assert_eq!(usage.to_string(), "plugin 'metrics' not found");

        let timeout = HostError::plugin_failure(
            "metrics",
            LifecyclePhase::Activate,
            FailureKind::Timeout,
            "exceeded 50ms",
        );
        assert!(matches!(timeout, HostError::Activation { .. }));
        assert!(!timeout.is_usage_error());
        assert_eq!(timeout.failure_kind(), Some(FailureKind::Timeout));
        assert_eq!(timeout.phase(), Some(LifecyclePhase::Activate));
    }

    #[test]
    fn test_error_from_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let host_error = HostError::from(io_error);
        assert!(matches!(host_error, HostError::Io(_)));
        assert!(host_error.phase().is_none());
    }

    #[test]
    fn test_invalid_transition_message() {
        let error = HostError::InvalidTransition {
            name: "metrics".to_string(),
            from: LifecycleState::Deactivated,
            to: LifecycleState::Active,
        };
        assert_eq!(
            error.to_string(),
            "plugin 'metrics' cannot move from deactivated to active"
        );
    }
}
