//! 后台任务管理
//!
//! 统一管理消费者工作者等后台任务的注册、启动和关闭。
//!
//! # 任务类型
//!
//! - [`TaskKind::Warmup`] - 启动预热任务（运行一次）
//! - [`TaskKind::Worker`] - 长期后台工作者（如订单消费者）

use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// 启动预热任务（运行一次）
    Warmup,
    /// 长期后台工作者
    Worker,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Warmup => write!(f, "Warmup"),
            TaskKind::Worker => write!(f, "Worker"),
        }
    }
}

/// 已注册的后台任务
struct RegisteredTask {
    name: String,
    kind: TaskKind,
    handle: JoinHandle<()>,
}

/// 后台任务管理器
///
/// # 使用示例
///
/// ```ignore
/// let mut tasks = BackgroundTasks::new();
/// let token = tasks.shutdown_token();
/// tasks.spawn("order_consumer:c1".into(), TaskKind::Worker, async move {
///     consumer.run(token).await;
/// });
/// // ...
/// tasks.shutdown().await;
/// ```
pub struct BackgroundTasks {
    tasks: Vec<RegisteredTask>,
    /// 全局取消令牌
    shutdown: CancellationToken,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// 获取取消令牌（用于任务内部监听 shutdown 信号）
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// 注册并启动一个后台任务
    ///
    /// 任务会被包装以捕获 panic，异常退出会记录错误日志。
    pub fn spawn<F>(&mut self, name: String, kind: TaskKind, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let task_name = name.clone();
        let wrapped_future = async move {
            let result: Result<(), Box<dyn std::any::Any + Send>> =
                AssertUnwindSafe(future).catch_unwind().await;
            if let Err(panic_info) = result {
                let panic_msg: String = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                tracing::error!(
                    task = %task_name,
                    kind = %kind,
                    panic = %panic_msg,
                    "Background task panicked! This is a bug that should be reported."
                );
            }
        };

        let handle = tokio::spawn(wrapped_future);
        tracing::debug!(task = %name, kind = %kind, "Registered background task");
        self.tasks.push(RegisteredTask { name, kind, handle });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// 优雅关闭：发出取消信号并等待所有任务退出
    pub async fn shutdown(self) {
        tracing::info!(count = self.tasks.len(), "Shutting down background tasks");
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.handle.await {
                tracing::warn!(task = %task.name, error = %e, "Background task join failed");
            } else {
                tracing::debug!(task = %task.name, "Background task stopped");
            }
        }
        tracing::info!("All background tasks stopped");
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_shutdown_cancels_workers() {
        let mut tasks = BackgroundTasks::new();
        let token = tasks.shutdown_token();
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();

        tasks.spawn("test_worker".into(), TaskKind::Worker, async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(tasks.len(), 1);

        tasks.shutdown().await;
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_poison_shutdown() {
        let mut tasks = BackgroundTasks::new();
        tasks.spawn("panicking".into(), TaskKind::Warmup, async {
            panic!("boom");
        });
        // catch_unwind 包装后 join 仍然成功
        tasks.shutdown().await;
    }
}
