//! 同步轮询器 - 定时驱动增量拉取
//!
//! - 启动后先 bootstrap，再进入循环
//! - 每个 tick 检查：未在拉取且距上次拉取已超过 interval 时触发一次拉取
//! - 冷启动后的第一次拉取（last_loaded_at == 0）自动应用
//! - 停止只取消循环与定时器，已发出的拉取不会被中断

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::engine::SyncEngine;
use crate::error::{CaselySDKError, Result};
use crate::lifecycle::LifecycleHook;
use crate::utils::time::now_millis;

/// 轮询配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    /// 两次拉取之间的最小间隔
    pub interval: Duration,
    /// 检查周期
    pub tick: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(10_000),
            tick: Duration::from_millis(1_000),
        }
    }
}

impl PollerConfig {
    pub fn from_millis(interval_ms: u64, tick_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            tick: Duration::from_millis(tick_ms),
        }
    }
}

struct RunningLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// 同步轮询器
pub struct SyncPoller {
    engine: Arc<SyncEngine>,
    config: PollerConfig,
    running: Mutex<Option<RunningLoop>>,
}

impl SyncPoller {
    pub fn new(engine: Arc<SyncEngine>, config: PollerConfig) -> Self {
        Self {
            engine,
            config,
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> PollerConfig {
        self.config
    }

    /// 启动轮询；已在运行时返回 false
    pub fn start(&self) -> Result<bool> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| CaselySDKError::NotInitialized(format!("轮询需要 tokio 运行时: {}", e)))?;

        let mut running = self.running.lock();
        if running.as_ref().map_or(false, |r| !r.handle.is_finished()) {
            return Ok(false);
        }

        let token = CancellationToken::new();
        let handle = runtime.spawn(run_loop(
            Arc::clone(&self.engine),
            self.config,
            token.clone(),
        ));
        *running = Some(RunningLoop { token, handle });
        info!(
            "▶️ 同步轮询已启动 (interval={:?}, tick={:?})",
            self.config.interval, self.config.tick
        );
        Ok(true)
    }

    /// 停止轮询；未运行时返回 false
    pub fn stop(&self) -> bool {
        match self.running.lock().take() {
            Some(running) => {
                running.token.cancel();
                info!("⏹️ 同步轮询已停止");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map_or(false, |r| !r.handle.is_finished())
    }
}

impl Drop for SyncPoller {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.token.cancel();
        }
    }
}

async fn run_loop(engine: Arc<SyncEngine>, config: PollerConfig, token: CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => return,
        _ = engine.bootstrap() => {}
    }

    let interval_ms = i64::try_from(config.interval.as_millis()).unwrap_or(i64::MAX);
    loop {
        let state = engine.state();
        if !state.is_loading && now_millis().saturating_sub(state.last_loaded_at) >= interval_ms {
            // 冷启动后的第一次拉取直接应用，之后使用持久化的默认值
            let auto_apply = (state.last_loaded_at == 0).then_some(true);
            debug!("轮询触发增量拉取 (auto_apply={:?})", auto_apply);
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine.load_changes(auto_apply).await;
            });
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(config.tick) => {}
        }
    }
    debug!("轮询循环已退出");
}

#[async_trait]
impl LifecycleHook for SyncPoller {
    async fn on_background(&self) -> Result<()> {
        self.stop();
        Ok(())
    }

    async fn on_foreground(&self) -> Result<()> {
        self.start()?;
        Ok(())
    }
}
