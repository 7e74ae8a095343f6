//! 核心基础层模块
//!
//! 提供宿主的基础设施：生命周期事件总线

pub mod event_bus;

// 重新导出核心组件
pub use event_bus::*;
