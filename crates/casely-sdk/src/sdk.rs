//! Casely SDK 入口 - 配置与组件装配
//!
//! 初始化顺序：存储（快照库 + 偏好 KV）→ 远端数据源 → 状态容器 / 事件 →
//! 同步引擎 → 乐观更新 → 轮询 → 生命周期。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, warn};

use crate::entity::{EntityId, RefreshPolicy};
use crate::error::{CaselySDKError, Result};
use crate::events::{EventManager, SyncEvent};
use crate::lifecycle::LifecycleManager;
use crate::remote::{ContractMutation, HttpRemoteSource, MutationAck, RemoteSource};
use crate::storage::{KvStore, SnapshotStore, SqliteSnapshotStore, DEFAULT_RETENTION_DAYS};
use crate::sync::{
    ApplyFilter, ApplyOutcome, LoadOutcome, OptimisticMutator, PollerConfig, StateContainer,
    SubscriptionId, SyncEngine, SyncPoller, SyncState,
};
use crate::version::version_line;

/// 快照数据库文件名
const SNAPSHOT_DB_FILE: &str = "snapshots.db";

/// HTTP 客户端配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒）
    pub request_timeout_secs: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(10),
            request_timeout_secs: Some(30),
        }
    }
}

/// Casely SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaselyConfig {
    /// 数据存储目录
    pub data_dir: PathBuf,
    /// 服务端 API 基础 URL，例如 https://casely.example.com
    pub api_base_url: String,
    /// 两次增量拉取之间的最小间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 轮询检查周期（毫秒）
    pub poll_tick_ms: u64,
    /// 快照保留天数
    pub retention_days: i64,
    pub http_client_config: HttpClientConfig,
    /// 事件广播缓冲大小
    pub event_buffer_size: usize,
    /// 调试模式
    pub debug_mode: bool,
}

impl Default for CaselyConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            api_base_url: "http://localhost:8080".to_string(),
            poll_interval_ms: 10_000,
            poll_tick_ms: 1_000,
            retention_days: DEFAULT_RETENTION_DAYS,
            http_client_config: HttpClientConfig::default(),
            event_buffer_size: 256,
            debug_mode: false,
        }
    }
}

impl CaselyConfig {
    pub fn builder() -> CaselyConfigBuilder {
        CaselyConfigBuilder::new()
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig::from_millis(self.poll_interval_ms, self.poll_tick_ms)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(CaselySDKError::Config("数据目录不能为空".to_string()));
        }
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://")) {
            return Err(CaselySDKError::Config(format!(
                "API 地址必须以 http:// 或 https:// 开头: {}",
                self.api_base_url
            )));
        }
        if self.poll_tick_ms == 0 {
            return Err(CaselySDKError::Config("轮询检查周期不能为0".to_string()));
        }
        if self.retention_days <= 0 {
            return Err(CaselySDKError::Config("快照保留天数必须大于0".to_string()));
        }
        if self.event_buffer_size == 0 {
            return Err(CaselySDKError::Config("事件缓冲大小不能为0".to_string()));
        }
        Ok(())
    }
}

/// 获取默认数据目录 ~/.casely/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".casely")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        // Windows
        home_dir.join(".casely")
    } else {
        PathBuf::from("./casely_data")
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct CaselyConfigBuilder {
    config: CaselyConfig,
}

impl CaselyConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn api_base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.api_base_url = url.into();
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn poll_tick_ms(mut self, ms: u64) -> Self {
        self.config.poll_tick_ms = ms;
        self
    }

    pub fn retention_days(mut self, days: i64) -> Self {
        self.config.retention_days = days;
        self
    }

    pub fn http_client_config(mut self, http: HttpClientConfig) -> Self {
        self.config.http_client_config = http;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> CaselyConfig {
        self.config
    }
}

/// Casely SDK 主入口
pub struct CaselySDK {
    config: CaselyConfig,
    state: Arc<StateContainer>,
    events: Arc<EventManager>,
    engine: Arc<SyncEngine>,
    mutator: OptimisticMutator,
    poller: Arc<SyncPoller>,
    lifecycle: RwLock<LifecycleManager>,
    kv: Option<KvStore>,
    shut_down: AtomicBool,
}

impl CaselySDK {
    /// 按配置初始化全部组件
    pub async fn initialize(config: CaselyConfig) -> Result<Arc<Self>> {
        info!("正在初始化 CaselySDK... ({})", version_line());
        config.validate()?;

        std::fs::create_dir_all(&config.data_dir)?;

        // === 第1层：存储 ===
        let db_path = config.data_dir.join(SNAPSHOT_DB_FILE);
        let snapshots = SqliteSnapshotStore::open(&db_path)?.with_retention_days(config.retention_days);
        let kv = KvStore::new(&config.data_dir).await?;

        // === 第2层：远端数据源 ===
        let remote = HttpRemoteSource::new(&config.http_client_config, config.api_base_url.clone())?;

        let sdk = Self::with_components(config, Arc::new(remote), Arc::new(snapshots), Some(kv));
        info!("✅ CaselySDK 初始化完成");
        Ok(sdk)
    }

    /// 使用外部提供的远端数据源与存储装配 SDK
    pub fn with_components(
        config: CaselyConfig,
        remote: Arc<dyn RemoteSource>,
        snapshots: Arc<dyn SnapshotStore>,
        kv: Option<KvStore>,
    ) -> Arc<Self> {
        if config.debug_mode {
            info!("🐛 调试模式: {:?}", config);
        }

        // === 第3层：状态与事件 ===
        let state = Arc::new(StateContainer::default());
        let events = Arc::new(EventManager::new(config.event_buffer_size));

        // === 第4层：同步引擎、乐观更新、轮询 ===
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&state),
            Arc::clone(&remote),
            snapshots,
            Arc::clone(&events),
            kv.clone(),
        ));
        let mutator = OptimisticMutator::new(Arc::clone(&state), remote, Arc::clone(&events));
        let poller = Arc::new(SyncPoller::new(Arc::clone(&engine), config.poller_config()));

        // === 第5层：生命周期 ===
        let mut lifecycle = LifecycleManager::new();
        lifecycle.register_hook(poller.clone());

        Arc::new(Self {
            config,
            state,
            events,
            engine,
            mutator,
            poller,
            lifecycle: RwLock::new(lifecycle),
            kv,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &CaselyConfig {
        &self.config
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(CaselySDKError::NotInitialized("SDK 已关闭".to_string()));
        }
        Ok(())
    }

    // ========== 同步 ==========

    /// 从最新快照恢复；重复调用无副作用
    pub async fn bootstrap(&self) {
        self.engine.bootstrap().await
    }

    /// 拉取增量到 pending；auto_apply 为 None 时使用持久化的默认值
    pub async fn load_changes(&self, auto_apply: Option<bool>) -> LoadOutcome {
        self.engine.load_changes(auto_apply).await
    }

    /// 将 pending 应用到基础缓存，filter 为 None 时全部应用
    pub fn apply_pending(&self, filter: Option<ApplyFilter>) -> ApplyOutcome {
        self.engine.apply_pending(filter)
    }

    /// 设置并持久化自动应用默认值
    pub async fn set_auto_apply(&self, enabled: bool) -> Result<()> {
        self.engine.set_auto_apply(enabled).await
    }

    // ========== 乐观更新 ==========

    pub async fn set_field(&self, id: EntityId, mutation: ContractMutation) -> Result<MutationAck> {
        self.ensure_running()?;
        self.mutator.set_field(id, mutation).await
    }

    pub async fn set_refresh_policy(&self, id: EntityId, policy: RefreshPolicy) -> Result<MutationAck> {
        self.ensure_running()?;
        self.mutator.set_refresh_policy(id, policy).await
    }

    pub async fn add_label(&self, id: EntityId, label_id: EntityId) -> Result<MutationAck> {
        self.ensure_running()?;
        self.mutator.add_label(id, label_id).await
    }

    pub async fn remove_label(&self, id: EntityId, label_id: EntityId) -> Result<MutationAck> {
        self.ensure_running()?;
        self.mutator.remove_label(id, label_id).await
    }

    // ========== 状态与事件 ==========

    /// 当前状态快照
    pub fn state(&self) -> Arc<SyncState> {
        self.state.get()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&Arc<SyncState>) + Send + Sync + 'static,
    {
        self.state.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state.unsubscribe(id)
    }

    pub fn watch(&self) -> watch::Receiver<Arc<SyncState>> {
        self.state.watch()
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    // ========== 轮询与生命周期 ==========

    /// 启动轮询；已在运行时返回 false
    pub fn start_polling(&self) -> Result<bool> {
        self.ensure_running()?;
        self.poller.start()
    }

    pub fn stop_polling(&self) -> bool {
        self.poller.stop()
    }

    pub fn is_polling(&self) -> bool {
        self.poller.is_running()
    }

    /// App 切换到后台
    pub async fn notify_background(&self) -> Result<()> {
        self.lifecycle.read().await.notify_background().await
    }

    /// App 切换到前台
    pub async fn notify_foreground(&self) -> Result<()> {
        self.ensure_running()?;
        self.lifecycle.read().await.notify_foreground().await
    }

    /// 关闭 SDK：停止轮询并刷盘偏好存储
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("SDK 已经关闭");
            return Ok(());
        }
        info!("正在关闭 CaselySDK...");
        self.poller.stop();
        if let Some(kv) = &self.kv {
            if let Err(e) = kv.flush().await {
                warn!("偏好存储刷盘失败: {}", e);
                return Err(e);
            }
        }
        info!("CaselySDK 关闭完成");
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}
