//! 本地持久化
//!
//! - `snapshot`: SQLite 快照库（refinery 管理 schema）
//! - `kv`: sled 偏好设置

pub mod kv;
pub mod migrate;
pub mod snapshot;

pub use kv::KvStore;
pub use snapshot::{
    select_survivors, SaveOutcome, Snapshot, SnapshotDraft, SnapshotMeta, SnapshotStore,
    SqliteSnapshotStore, DEFAULT_RETENTION_DAYS,
};
