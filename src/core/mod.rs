//! 核心模块 - 配置、错误与后台任务管理

pub mod config;
pub mod error;
pub mod tasks;

pub use config::EngineConfig;
pub use error::{EngineError, ReserveError};
pub use tasks::{BackgroundTasks, TaskKind};
