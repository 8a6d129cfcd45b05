//! 快照存储 - 将基础缓存（合同 + 标签）持久化到 SQLite
//!
//! - `snapshot_meta` 只存游标与时间戳，列表/比较无需读取大字段
//! - `snapshot_data` 存两类缓存的 JSON，与 meta 同 id，同一事务写入/删除
//! - meta 中记录数据的 SHA-256，数据缺失或校验不一致时视为没有快照

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::cache::EntityCache;
use crate::entity::{Contract, Label, Timestamp};
use crate::error::{CaselySDKError, Result};
use crate::storage::migrate::init_db;
use crate::utils::time::{utc_day, DAY_MILLIS};

/// 默认保留天数
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// 快照元数据
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// 自增 id，越大越新
    pub id: i64,
    /// 保存时间（毫秒）
    pub timestamp: Timestamp,
    pub contract_last_updated: Timestamp,
    pub label_last_updated: Timestamp,
}

/// 完整快照
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub contracts: Arc<EntityCache<Contract>>,
    pub labels: Arc<EntityCache<Label>>,
}

/// 待保存的快照（id 由存储分配）
#[derive(Debug, Clone)]
pub struct SnapshotDraft {
    pub timestamp: Timestamp,
    pub contracts: Arc<EntityCache<Contract>>,
    pub labels: Arc<EntityCache<Label>>,
}

impl SnapshotDraft {
    /// 两类游标都不超过 `meta`：与最新快照相同，或是晚到的旧数据
    fn is_not_newer_than(&self, meta: &SnapshotMeta) -> bool {
        self.contracts.last_updated() <= meta.contract_last_updated
            && self.labels.last_updated() <= meta.label_last_updated
    }
}

/// 保存结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// 写入了新快照
    Written(SnapshotMeta),
    /// 游标不比最新快照新，未写入；携带最新快照的元数据
    Unchanged(SnapshotMeta),
}

impl SaveOutcome {
    pub fn meta(&self) -> SnapshotMeta {
        match self {
            SaveOutcome::Written(meta) | SaveOutcome::Unchanged(meta) => *meta,
        }
    }

    pub fn is_written(&self) -> bool {
        matches!(self, SaveOutcome::Written(_))
    }
}

/// 快照存储
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// 保存快照；游标不比最新快照新时跳过写入
    async fn save(&self, draft: SnapshotDraft) -> Result<SaveOutcome>;

    /// 最新（id 最大）的快照
    async fn load_latest(&self) -> Result<Option<Snapshot>>;

    async fn load_latest_meta(&self) -> Result<Option<SnapshotMeta>>;

    /// 全部元数据，按时间升序
    async fn list_metas(&self) -> Result<Vec<SnapshotMeta>>;

    async fn load_by_id(&self, id: i64) -> Result<Option<Snapshot>>;

    /// 按保留策略清理，返回删除数量
    async fn cleanup(&self, now: Timestamp) -> Result<usize>;
}

/// 计算清理后需要保留的快照 id
///
/// - 不超过 1 个快照时全部保留
/// - 时间戳最大的快照总是保留
/// - 保留窗口内每个 UTC 自然日只保留当天最新的一个
/// - 其余全部删除
pub fn select_survivors(metas: &[SnapshotMeta], now: Timestamp, retention_days: i64) -> HashSet<i64> {
    if metas.len() <= 1 {
        return metas.iter().map(|m| m.id).collect();
    }

    let newer = |a: &SnapshotMeta, b: &SnapshotMeta| (a.timestamp, a.id) > (b.timestamp, b.id);

    let mut survivors = HashSet::new();
    if let Some(latest) = metas.iter().reduce(|a, b| if newer(a, b) { a } else { b }) {
        survivors.insert(latest.id);
    }

    let window = retention_days.saturating_mul(DAY_MILLIS);
    let mut per_day: HashMap<NaiveDate, &SnapshotMeta> = HashMap::new();
    for meta in metas {
        if now.saturating_sub(meta.timestamp) > window {
            continue;
        }
        let Some(day) = utc_day(meta.timestamp) else {
            continue;
        };
        per_day
            .entry(day)
            .and_modify(|kept| {
                if newer(meta, *kept) {
                    *kept = meta;
                }
            })
            .or_insert(meta);
    }
    survivors.extend(per_day.values().map(|m| m.id));
    survivors
}

fn payload_digest(contracts_json: &str, labels_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contracts_json.as_bytes());
    hasher.update([0u8]);
    hasher.update(labels_json.as_bytes());
    hex::encode(hasher.finalize())
}

fn meta_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotMeta> {
    Ok(SnapshotMeta {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        contract_last_updated: row.get(2)?,
        label_last_updated: row.get(3)?,
    })
}

const META_COLUMNS: &str = "id, timestamp, contract_last_updated, label_last_updated";

fn latest_meta(conn: &Connection) -> Result<Option<SnapshotMeta>> {
    let meta = conn
        .query_row(
            &format!("SELECT {} FROM snapshot_meta ORDER BY id DESC LIMIT 1", META_COLUMNS),
            [],
            meta_from_row,
        )
        .optional()?;
    Ok(meta)
}

fn load_snapshot(conn: &Connection, meta: SnapshotMeta) -> Result<Option<Snapshot>> {
    let row = conn
        .query_row(
            "SELECT m.data_sha256, d.contracts_json, d.labels_json
             FROM snapshot_meta m JOIN snapshot_data d ON d.id = m.id
             WHERE m.id = ?1",
            params![meta.id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;

    let Some((digest, contracts_json, labels_json)) = row else {
        warn!("快照 {} 缺少数据部分，视为不存在", meta.id);
        return Ok(None);
    };

    if payload_digest(&contracts_json, &labels_json) != digest {
        warn!("快照 {} 数据校验失败，视为不存在", meta.id);
        return Ok(None);
    }

    let contracts: EntityCache<Contract> = serde_json::from_str(&contracts_json)
        .map_err(|e| CaselySDKError::Serialization(format!("解析快照合同数据失败: {}", e)))?;
    let labels: EntityCache<Label> = serde_json::from_str(&labels_json)
        .map_err(|e| CaselySDKError::Serialization(format!("解析快照标签数据失败: {}", e)))?;

    Ok(Some(Snapshot {
        meta,
        contracts: Arc::new(contracts),
        labels: Arc::new(labels),
    }))
}

/// 基于 SQLite 的快照存储
pub struct SqliteSnapshotStore {
    conn: Arc<Mutex<Connection>>,
    retention_days: i64,
}

impl SqliteSnapshotStore {
    /// 打开（或创建）快照库并执行 migration
    pub fn open(path: &Path) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        init_db(&mut conn)?;
        info!("快照库已打开: {}", path.display());
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        init_db(&mut conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }

    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention_days = days;
        self
    }

    pub fn retention_days(&self) -> i64 {
        self.retention_days
    }

    /// 在阻塞线程池上执行数据库操作
    async fn with_conn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| CaselySDKError::Other(format!("快照库任务异常退出: {}", e)))?
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn save(&self, draft: SnapshotDraft) -> Result<SaveOutcome> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            if let Some(latest) = latest_meta(&tx)? {
                if draft.is_not_newer_than(&latest) {
                    debug!("快照游标不比最新快照新，跳过保存 (latest id={})", latest.id);
                    return Ok(SaveOutcome::Unchanged(latest));
                }
            }

            let contracts_json = serde_json::to_string(draft.contracts.as_ref())?;
            let labels_json = serde_json::to_string(draft.labels.as_ref())?;
            let digest = payload_digest(&contracts_json, &labels_json);

            tx.execute(
                "INSERT INTO snapshot_meta (timestamp, contract_last_updated, label_last_updated, data_sha256)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    draft.timestamp,
                    draft.contracts.last_updated(),
                    draft.labels.last_updated(),
                    digest
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO snapshot_data (id, contracts_json, labels_json) VALUES (?1, ?2, ?3)",
                params![id, contracts_json, labels_json],
            )?;
            tx.commit()?;

            let meta = SnapshotMeta {
                id,
                timestamp: draft.timestamp,
                contract_last_updated: draft.contracts.last_updated(),
                label_last_updated: draft.labels.last_updated(),
            };
            info!(
                "💾 快照已保存: id={}, contracts={}, labels={}",
                id,
                draft.contracts.count(),
                draft.labels.count()
            );
            Ok(SaveOutcome::Written(meta))
        })
        .await
    }

    async fn load_latest(&self) -> Result<Option<Snapshot>> {
        self.with_conn(|conn| match latest_meta(conn)? {
            Some(meta) => load_snapshot(conn, meta),
            None => Ok(None),
        })
        .await
    }

    async fn load_latest_meta(&self) -> Result<Option<SnapshotMeta>> {
        self.with_conn(|conn| latest_meta(conn)).await
    }

    async fn list_metas(&self) -> Result<Vec<SnapshotMeta>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM snapshot_meta ORDER BY timestamp ASC, id ASC",
                META_COLUMNS
            ))?;
            let metas = stmt
                .query_map([], meta_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(metas)
        })
        .await
    }

    async fn load_by_id(&self, id: i64) -> Result<Option<Snapshot>> {
        self.with_conn(move |conn| {
            let meta = conn
                .query_row(
                    &format!("SELECT {} FROM snapshot_meta WHERE id = ?1", META_COLUMNS),
                    params![id],
                    meta_from_row,
                )
                .optional()?;
            match meta {
                Some(meta) => load_snapshot(conn, meta),
                None => Ok(None),
            }
        })
        .await
    }

    async fn cleanup(&self, now: Timestamp) -> Result<usize> {
        let retention_days = self.retention_days;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let metas = {
                let mut stmt = tx.prepare(&format!("SELECT {} FROM snapshot_meta", META_COLUMNS))?;
                let metas = stmt
                    .query_map([], meta_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                metas
            };
            if metas.len() <= 1 {
                return Ok(0);
            }

            let survivors = select_survivors(&metas, now, retention_days);
            let mut deleted = 0;
            for meta in metas.iter().filter(|m| !survivors.contains(&m.id)) {
                tx.execute("DELETE FROM snapshot_data WHERE id = ?1", params![meta.id])?;
                deleted += tx.execute("DELETE FROM snapshot_meta WHERE id = ?1", params![meta.id])?;
            }
            tx.commit()?;

            if deleted > 0 {
                info!("🧹 快照清理完成: 删除 {} 个，保留 {} 个", deleted, survivors.len());
            }
            Ok(deleted)
        })
        .await
    }
}
