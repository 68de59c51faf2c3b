//! 工具模块 - 通用工具函数
//!
//! # 内容
//!
//! - [`logger`] - 日志初始化
//! - [`time`] - 时间戳工具

pub mod logger;
pub mod time;

pub use time::now_millis;
