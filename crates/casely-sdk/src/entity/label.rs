use serde::{Deserialize, Serialize};

use super::{EntityId, RawRow, SyncEntity, Timestamp};
use crate::error::{CaselySDKError, Result};
use crate::sync::EntityKind;

/// 合同标签
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub id: EntityId,
    pub name: String,
    pub color: String,
    /// 排序权重，越小越靠前
    pub order_rank: i64,
    pub updated_at: Timestamp,
    pub deleted_at: Option<Timestamp>,
}

impl SyncEntity for Label {
    const KIND: EntityKind = EntityKind::Label;

    fn id(&self) -> EntityId {
        self.id
    }

    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    fn deleted_at(&self) -> Option<Timestamp> {
        self.deleted_at
    }

    fn from_row(row: &RawRow) -> Result<Self> {
        let name = row
            .field("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CaselySDKError::InvalidData(format!("标签 {} 缺少 name", row.id)))?;

        Ok(Label {
            id: row.id,
            name: name.to_string(),
            color: row
                .field("color")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            order_rank: row.field("order_rank").and_then(|v| v.as_i64()).unwrap_or(0),
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}
