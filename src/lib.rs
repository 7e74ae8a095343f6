//! Cybernetic Host - 插件生命周期宿主
//!
//! 为独立开发的扩展模块（传输适配器、安全模块、遥测采集器等）提供统一的生命周期管理
//!
//! # 组件
//!
//! - **插件契约**: `init_plugin` / `activate` / `deactivate` / `info` 四个操作
//! - **插件注册表**: 插件实例、身份和当前生命周期状态
//! - **生命周期协调器**: 驱动状态迁移，保证阶段顺序和按插件串行
//! - **监督器**: 记录失败事件，按策略有界重试，隔离失败插件
//!
//! # 特性
//!
//! - **失败隔离**: 每次插件调用都有超时并捕获 panic，插件失败不会让宿主崩溃
//! - **有界并发**: 批量操作通过显式配置大小的工作池执行
//! - **协作式取消**: 取消后不再调度新的调用，报告未被调度的插件

pub mod types;
pub mod error;
pub mod core;
pub mod plugins;
pub mod config;
pub mod host;
pub mod demo;

// 重新导出核心类型
pub use types::*;
pub use error::*;
pub use crate::core::*;
pub use plugins::*;
pub use config::{ConfigManager, HostConfig, LogLevel, LoggingConfig};
pub use host::PluginHost;

/// 框架信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const FRAMEWORK_NAME: &str = "CyberneticHost";

/// 初始化日志系统，重复调用时保留已安装的订阅者
pub fn init_logging(config: &LoggingConfig) {
    let installed = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::from(config.level))
        .with_target(config.with_target)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("Initializing {} v{}", FRAMEWORK_NAME, VERSION);
    }
}
