//! Casely SDK - 合同与标签的本地同步缓存
//!
//! 本 SDK 提供：
//! - 🗂️ 带游标的实体缓存：增量合并、tombstone 处理、pending 应用
//! - 💾 SQLite 快照：启动恢复、按天保留与清理
//! - 🔄 增量同步引擎与定时轮询
//! - ✏️ 乐观更新：本地先改，服务端失败回滚
//! - 📣 状态订阅与事件广播
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use casely_sdk::{CaselyConfig, CaselySDK};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CaselyConfig::builder()
//!         .data_dir("/path/to/data")
//!         .api_base_url("https://casely.example.com")
//!         .build();
//!
//!     let sdk = CaselySDK::initialize(config).await?;
//!     sdk.start_polling()?;
//!
//!     // 有新数据时由用户决定是否应用
//!     if !sdk.state().pending.is_empty() {
//!         sdk.apply_pending(None);
//!     }
//!
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod entity;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod remote;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod utils;
pub mod version;

pub use cache::EntityCache;
pub use entity::{
    Contract, ContractStatus, DeltaResponse, EntityId, Label, Person, RawRow, RefreshPolicy, Reviewer,
    SyncEntity, Timestamp,
};
pub use error::{CaselySDKError, Result};
pub use events::{EventManager, EventStats, SyncEvent};
pub use lifecycle::{LifecycleHook, LifecycleManager};
pub use remote::{ContractMutation, HttpRemoteSource, MutationAck, RemoteSource};
pub use sdk::{CaselyConfig, CaselyConfigBuilder, CaselySDK, HttpClientConfig};
pub use storage::{KvStore, Snapshot, SnapshotMeta, SnapshotStore, SqliteSnapshotStore};
pub use sync::{
    ApplyFilter, ApplyOutcome, EntityKind, LoadOutcome, OptimisticMutator, PendingChanges, PollerConfig,
    StateContainer, SubscriptionId, SyncEngine, SyncPoller, SyncState,
};
pub use version::{version_line, SDK_VERSION};
