//! 插件宿主配置管理
//!
//! 支持 YAML / TOML 配置文件。插件自身的配置不在这里定义，宿主只负责把映射原样传给插件。

use crate::core::event_bus::DEFAULT_EVENT_CAPACITY;
use crate::error::{HostError, Result};
use crate::plugins::boundary::CallTimeouts;
use crate::plugins::lifecycle::{CoordinatorConfig, InactiveInfoPolicy};
use crate::plugins::supervisor::RestartPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 宿主配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// 宿主基础设置
    pub host: HostSettings,
    /// 插件调用超时
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// 重启策略
    #[serde(default)]
    pub restart: RestartPolicyConfig,
    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 宿主基础设置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    /// 宿主名称
    #[serde(default = "default_host_name")]
    pub name: String,
    /// 工作池大小，没有默认值
    pub worker_pool_size: usize,
    /// 是否允许停用后再次激活
    #[serde(default)]
    pub allow_reactivation: bool,
    /// 失败或未初始化插件的 info 行为
    #[serde(default)]
    pub inactive_info: InactiveInfoPolicy,
    /// 生命周期事件通道容量
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_host_name() -> String {
    "cybernetic-host".to_string()
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

/// 插件调用超时（毫秒）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub init_ms: u64,
    pub activate_ms: u64,
    pub deactivate_ms: u64,
    pub info_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let defaults = CallTimeouts::default();
        Self {
            init_ms: defaults.init.as_millis() as u64,
            activate_ms: defaults.activate.as_millis() as u64,
            deactivate_ms: defaults.deactivate.as_millis() as u64,
            info_ms: defaults.info.as_millis() as u64,
        }
    }
}

impl From<&TimeoutConfig> for CallTimeouts {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            init: Duration::from_millis(config.init_ms),
            activate: Duration::from_millis(config.activate_ms),
            deactivate: Duration::from_millis(config.deactivate_ms),
            info: Duration::from_millis(config.info_ms),
        }
    }
}

/// 重启策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicyConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: u32,
    pub auto_restart: bool,
    pub failure_log_capacity: usize,
}

impl Default for RestartPolicyConfig {
    fn default() -> Self {
        let defaults = RestartPolicy::default();
        Self {
            max_retries: defaults.max_retries,
            initial_backoff_ms: defaults.initial_backoff.as_millis() as u64,
            max_backoff_ms: defaults.max_backoff.as_millis() as u64,
            multiplier: defaults.multiplier,
            auto_restart: defaults.auto_restart,
            failure_log_capacity: defaults.failure_log_capacity,
        }
    }
}

impl From<&RestartPolicyConfig> for RestartPolicy {
    fn from(config: &RestartPolicyConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
            auto_restart: config.auto_restart,
            failure_log_capacity: config.failure_log_capacity,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别
    pub level: LogLevel,
    /// 是否输出事件的 target
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            with_target: false,
        }
    }
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl HostConfig {
    /// 工作池大小必须由调用方给出
    pub fn new(worker_pool_size: usize) -> Self {
        Self {
            host: HostSettings {
                name: default_host_name(),
                worker_pool_size,
                allow_reactivation: false,
                inactive_info: InactiveInfoPolicy::default(),
                event_capacity: DEFAULT_EVENT_CAPACITY,
            },
            timeouts: TimeoutConfig::default(),
            restart: RestartPolicyConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn call_timeouts(&self) -> CallTimeouts {
        CallTimeouts::from(&self.timeouts)
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy::from(&self.restart)
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig::new(self.host.worker_pool_size)
            .with_reactivation(self.host.allow_reactivation)
            .with_inactive_info(self.host.inactive_info)
    }
}

/// 配置管理器
#[derive(Debug)]
pub struct ConfigManager {
    config: HostConfig,
}

impl ConfigManager {
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }

    /// 从文件加载配置，`.toml` 按 TOML 解析，其余按 YAML 解析
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| HostError::config(&format!("Failed to read config file: {}", e)))?;

        let config: HostConfig = if is_toml(path) {
            toml::from_str(&content)
                .map_err(|e| HostError::config(&format!("Failed to parse config file: {}", e)))?
        } else {
            serde_yaml::from_str(&content)
                .map_err(|e| HostError::config(&format!("Failed to parse config file: {}", e)))?
        };

        Ok(Self { config })
    }

    /// 保存配置到文件
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = if is_toml(path) {
            toml::to_string_pretty(&self.config)
                .map_err(|e| HostError::config(&format!("Failed to serialize config: {}", e)))?
        } else {
            serde_yaml::to_string(&self.config)?
        };

        tokio::fs::write(path, content)
            .await
            .map_err(|e| HostError::config(&format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    pub fn get_config(&self) -> &HostConfig {
        &self.config
    }

    pub fn get_config_mut(&mut self) -> &mut HostConfig {
        &mut self.config
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<()> {
        let config = &self.config;

        if config.host.name.is_empty() {
            return Err(HostError::config("Host name cannot be empty"));
        }

        if config.host.worker_pool_size == 0 {
            return Err(HostError::config("Worker pool size must be positive"));
        }

        let timeouts = &config.timeouts;
        if [timeouts.init_ms, timeouts.activate_ms, timeouts.deactivate_ms, timeouts.info_ms]
            .contains(&0)
        {
            return Err(HostError::config("Plugin call timeouts must be positive"));
        }

        let restart = &config.restart;
        if restart.multiplier == 0 {
            return Err(HostError::config("Restart backoff multiplier must be at least 1"));
        }
        if restart.initial_backoff_ms > restart.max_backoff_ms {
            return Err(HostError::config(
                "Initial restart backoff cannot exceed the maximum backoff",
            ));
        }
        if restart.failure_log_capacity == 0 {
            return Err(HostError::config("Failure log capacity must be positive"));
        }

        tracing::info!("Configuration validation passed");
        Ok(())
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "toml")
}

/// 生成默认配置文件，工作池大小取 CPU 核心数
pub async fn generate_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let config_manager = ConfigManager::new(HostConfig::new(num_cpus::get()));
    config_manager.save_to_file(path).await?;
    Ok(())
}
