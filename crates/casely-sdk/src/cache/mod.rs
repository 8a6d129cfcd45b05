//! 实体缓存 - 按 id 索引的单类实体容器，附带同步游标
//!
//! 缓存以 `Arc<EntityCache<T>>` 共享，任何修改都产生新对象；
//! 没有实际变化时原样返回同一个 `Arc`，上层用 `Arc::ptr_eq` 判断是否需要更新状态。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::entity::{DeltaResponse, EntityId, RawRow, SyncEntity, Timestamp};
use crate::error::Result;

/// 单类实体缓存
///
/// - `count` 恒等于 `id_map` 大小
/// - `last_updated` 单调不减，是拉取增量时使用的游标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "CacheWire<T>")]
#[serde(bound(deserialize = "T: serde::de::DeserializeOwned"))]
pub struct EntityCache<T> {
    last_updated: Timestamp,
    id_map: HashMap<EntityId, T>,
    count: usize,
}

#[derive(Deserialize)]
struct CacheWire<T> {
    #[serde(default)]
    last_updated: Timestamp,
    #[serde(default = "HashMap::new")]
    id_map: HashMap<EntityId, T>,
}

impl<T> From<CacheWire<T>> for EntityCache<T> {
    fn from(wire: CacheWire<T>) -> Self {
        Self {
            last_updated: wire.last_updated,
            count: wire.id_map.len(),
            id_map: wire.id_map,
        }
    }
}

impl<T> Default for EntityCache<T> {
    fn default() -> Self {
        Self {
            last_updated: 0,
            id_map: HashMap::new(),
            count: 0,
        }
    }
}

impl<T: SyncEntity> EntityCache<T> {
    pub fn empty() -> Self {
        Self::default()
    }

    /// 空缓存，但游标从 `last_updated` 开始（冷启动后的 pending 缓存）
    pub fn with_cursor(last_updated: Timestamp) -> Self {
        Self {
            last_updated,
            ..Self::default()
        }
    }

    pub fn from_entities<I>(last_updated: Timestamp, entities: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        let id_map: HashMap<EntityId, T> = entities.into_iter().map(|e| (e.id(), e)).collect();
        Self {
            last_updated,
            count: id_map.len(),
            id_map,
        }
    }

    pub fn last_updated(&self) -> Timestamp {
        self.last_updated
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, id: EntityId) -> Option<&T> {
        self.id_map.get(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.id_map.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.id_map.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.id_map.keys().copied()
    }

    /// 修改单个实体的字段，返回新缓存；实体不存在时返回 None。
    /// 游标与数量不变。
    pub fn with_updated<F>(&self, id: EntityId, update: F) -> Option<Self>
    where
        F: FnOnce(&mut T),
    {
        let mut entity = self.id_map.get(&id)?.clone();
        update(&mut entity);
        let mut id_map = self.id_map.clone();
        id_map.insert(id, entity);
        Some(Self {
            last_updated: self.last_updated,
            count: id_map.len(),
            id_map,
        })
    }
}

/// 将一次增量响应合并进缓存
///
/// `max_updated_at` 不超过当前游标时原样返回 `current`。
/// `keep_tombstones` 为 false 时已删除行直接从缓存移除；pending 缓存需要保留 tombstone，
/// 以便之后把删除应用到基础缓存。
/// 任一行转换失败则整体失败，游标不会越过未能解析的行。
pub fn merge_delta<T, F>(
    current: &Arc<EntityCache<T>>,
    delta: &DeltaResponse,
    to_entity: F,
    keep_tombstones: bool,
) -> Result<Arc<EntityCache<T>>>
where
    T: SyncEntity,
    F: Fn(&RawRow) -> Result<T>,
{
    if delta.max_updated_at <= current.last_updated {
        return Ok(Arc::clone(current));
    }

    let mut id_map = current.id_map.clone();
    for row in &delta.items {
        if !keep_tombstones && row.is_deleted() {
            id_map.remove(&row.id);
            continue;
        }
        id_map.insert(row.id, to_entity(row)?);
    }

    Ok(Arc::new(EntityCache {
        last_updated: delta.max_updated_at,
        count: id_map.len(),
        id_map,
    }))
}

/// 将 pending 中的实体提升到基础缓存
///
/// 返回 `(new_base, new_pending)`。`ids` 为 None 时应用全部 pending。
/// 只有 pending 被完全清空时基础缓存的游标才前进到
/// `max(base.last_updated, pending.last_updated)`；部分应用不推进游标。
/// pending 的游标保持不变。
pub fn apply_pending<T: SyncEntity>(
    base: &Arc<EntityCache<T>>,
    pending: &Arc<EntityCache<T>>,
    ids: Option<&HashSet<EntityId>>,
) -> (Arc<EntityCache<T>>, Arc<EntityCache<T>>) {
    if pending.count == 0 {
        return (Arc::clone(base), Arc::clone(pending));
    }

    let selected: Vec<EntityId> = pending
        .id_map
        .keys()
        .copied()
        .filter(|id| ids.map_or(true, |wanted| wanted.contains(id)))
        .collect();
    if selected.is_empty() {
        return (Arc::clone(base), Arc::clone(pending));
    }

    let mut base_map = base.id_map.clone();
    let mut pending_map = pending.id_map.clone();
    for id in selected {
        if let Some(entity) = pending_map.remove(&id) {
            if entity.is_tombstone() {
                base_map.remove(&id);
            } else {
                base_map.insert(id, entity);
            }
        }
    }

    let base_last_updated = if pending_map.is_empty() {
        base.last_updated.max(pending.last_updated)
    } else {
        base.last_updated
    };

    let new_base = EntityCache {
        last_updated: base_last_updated,
        count: base_map.len(),
        id_map: base_map,
    };
    let new_pending = EntityCache {
        last_updated: pending.last_updated,
        count: pending_map.len(),
        id_map: pending_map,
    };
    (Arc::new(new_base), Arc::new(new_pending))
}
