//! SDK 生命周期管理
//!
//! 管理 App 前后台切换，统一触发各模块的状态切换（例如同步轮询的启停）。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{CaselySDKError, Result};

/// 生命周期回调 Hook
///
/// 各模块通过实现此 trait 来响应生命周期变化
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// App 切换到后台时调用
    async fn on_background(&self) -> Result<()>;

    /// App 切换到前台时调用
    async fn on_foreground(&self) -> Result<()>;
}

/// 生命周期管理器
pub struct LifecycleManager {
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    /// 注册生命周期回调 Hook
    pub fn register_hook(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push(hook);
        info!("✅ 生命周期 Hook 已注册: 当前共 {} 个", self.hooks.len());
    }

    /// 通知所有 Hook：App 切换到后台
    ///
    /// 按注册顺序执行，某个 Hook 失败时记录错误并继续，最后返回第一个错误
    pub async fn notify_background(&self) -> Result<()> {
        info!("🔄 通知所有模块：App 切换到后台");
        let mut errors = Vec::new();
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_background().await {
                warn!("⚠️ Hook #{} 后台切换失败: {}", index, e);
                errors.push(e);
            }
        }
        Self::first_error(errors, "后台")
    }

    /// 通知所有 Hook：App 切换到前台
    pub async fn notify_foreground(&self) -> Result<()> {
        info!("🔄 通知所有模块：App 切换到前台");
        let mut errors = Vec::new();
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_foreground().await {
                warn!("⚠️ Hook #{} 前台切换失败: {}", index, e);
                errors.push(e);
            }
        }
        Self::first_error(errors, "前台")
    }

    fn first_error(errors: Vec<CaselySDKError>, phase: &str) -> Result<()> {
        let failed = errors.len();
        match errors.into_iter().next() {
            Some(first) => {
                warn!("⚠️ {} 个模块{}切换失败，但所有模块都已尝试执行", failed, phase);
                Err(first)
            }
            None => {
                info!("✅ 所有模块{}切换完成", phase);
                Ok(())
            }
        }
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingHook {
        name: &'static str,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl LifecycleHook for RecordingHook {
        async fn on_background(&self) -> Result<()> {
            self.log.lock().push(format!("{}:background", self.name));
            if self.fail {
                return Err(CaselySDKError::Other(format!("{} failed", self.name)));
            }
            Ok(())
        }

        async fn on_foreground(&self) -> Result<()> {
            self.log.lock().push(format!("{}:foreground", self.name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_hooks_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = LifecycleManager::new();
        for name in ["a", "b"] {
            manager.register_hook(Arc::new(RecordingHook {
                name,
                fail: false,
                log: log.clone(),
            }));
        }
        assert_eq!(manager.hook_count(), 2);

        manager.notify_foreground().await.unwrap();
        assert_eq!(*log.lock(), vec!["a:foreground", "b:foreground"]);
    }

    #[tokio::test]
    async fn test_failing_hook_does_not_stop_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = LifecycleManager::default();
        manager.register_hook(Arc::new(RecordingHook {
            name: "bad",
            fail: true,
            log: log.clone(),
        }));
        manager.register_hook(Arc::new(RecordingHook {
            name: "good",
            fail: false,
            log: log.clone(),
        }));

        let err = manager.notify_background().await.unwrap_err();
        assert!(err.to_string().contains("bad failed"));
        assert_eq!(*log.lock(), vec!["bad:background", "good:background"]);
    }
}
