//! 同步实体模型
//!
//! 所有同步记录都有服务端分配的 `id`、单调递增的 `updated_at`（毫秒）
//! 和可空的 `deleted_at`（非空即 tombstone）。

mod contract;
mod label;

pub use contract::{Contract, ContractStatus, Person, RefreshPolicy, Reviewer};
pub use label::Label;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::sync::EntityKind;

/// 服务端分配的实体 ID
pub type EntityId = u64;

/// 毫秒时间戳
pub type Timestamp = i64;

/// 可同步实体
pub trait SyncEntity:
    Clone + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: EntityKind;

    fn id(&self) -> EntityId;

    fn updated_at(&self) -> Timestamp;

    fn deleted_at(&self) -> Option<Timestamp>;

    fn is_tombstone(&self) -> bool {
        self.deleted_at().is_some()
    }

    /// 从服务端原始行构造实体
    fn from_row(row: &RawRow) -> Result<Self>;
}

/// 服务端原始行：`{id, updated_at, deleted_at, ...其余字段}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    pub id: EntityId,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub deleted_at: Option<Timestamp>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RawRow {
    pub fn new(id: EntityId, updated_at: Timestamp, deleted_at: Option<Timestamp>) -> Self {
        Self {
            id,
            updated_at,
            deleted_at,
            fields: Map::new(),
        }
    }

    /// 附加业务字段（测试与模拟数据常用）
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// 还原为完整 JSON 对象
    pub fn to_value(&self) -> Value {
        let mut obj = self.fields.clone();
        obj.insert("id".to_string(), Value::from(self.id));
        obj.insert("updated_at".to_string(), Value::from(self.updated_at));
        obj.insert(
            "deleted_at".to_string(),
            self.deleted_at.map(Value::from).unwrap_or(Value::Null),
        );
        Value::Object(obj)
    }
}

/// 增量拉取响应：`updated_at > since` 的全部行与本次响应的最大 updated_at
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaResponse {
    #[serde(default)]
    pub items: Vec<RawRow>,
    pub max_updated_at: Timestamp,
}

impl DeltaResponse {
    pub fn new(items: Vec<RawRow>, max_updated_at: Timestamp) -> Self {
        Self {
            items,
            max_updated_at,
        }
    }

    /// 空响应：游标原样返回
    pub fn empty(since: Timestamp) -> Self {
        Self::new(Vec::new(), since)
    }
}
