//! 插件系统模块
//!
//! 插件契约、注册表、生命周期协调器、监督器以及插件调用的失败边界

pub mod boundary;
pub mod core;
pub mod lifecycle;
pub mod registry;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

// 重新导出核心组件
pub use self::core::*;
pub use boundary::{guarded_call, CallTimeouts};
pub use lifecycle::*;
pub use registry::{PluginRegistry, Registration};
pub use supervisor::*;
