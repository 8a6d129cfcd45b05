//! 远端数据源 - 同步引擎只依赖这里的 trait，具体传输可替换
//!
//! - `fetch_delta`: 拉取某类实体 `updated_at > since` 的增量
//! - `mutate_contract`: 提交单个合同字段修改

mod http;

pub use http::HttpRemoteSource;

use async_trait::async_trait;
use serde_json::Value;

use crate::entity::{Contract, DeltaResponse, EntityId, RefreshPolicy, Timestamp};
use crate::error::Result;
use crate::sync::EntityKind;

/// 合同字段修改
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractMutation {
    SetRefreshPolicy(RefreshPolicy),
    AddLabel(EntityId),
    RemoveLabel(EntityId),
}

impl ContractMutation {
    /// 受影响的字段名（日志/事件用）
    pub fn field(&self) -> &'static str {
        match self {
            ContractMutation::SetRefreshPolicy(_) => "refresh_policy",
            ContractMutation::AddLabel(_) | ContractMutation::RemoveLabel(_) => "labels",
        }
    }

    /// 在本地实体上执行修改
    pub fn apply_to(&self, contract: &mut Contract) {
        match *self {
            ContractMutation::SetRefreshPolicy(policy) => contract.refresh_policy = policy,
            ContractMutation::AddLabel(label_id) => {
                if !contract.labels.contains(&label_id) {
                    contract.labels.push(label_id);
                }
            }
            ContractMutation::RemoveLabel(label_id) => contract.labels.retain(|id| *id != label_id),
        }
    }
}

/// 服务端对修改的确认
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MutationAck {
    pub status: Option<String>,
    /// 服务端记录的修改时间
    pub updated_at: Option<Timestamp>,
    /// 原始响应体（无响应体时为 Null）
    pub body: Value,
}

impl MutationAck {
    pub fn from_body(body: Value) -> Self {
        Self {
            status: body.get("status").and_then(|v| v.as_str()).map(|s| s.to_string()),
            updated_at: body
                .get("updatedAt")
                .or_else(|| body.get("updated_at"))
                .and_then(|v| v.as_i64()),
            body,
        }
    }
}

/// 远端数据源
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch_delta(&self, kind: EntityKind, since: Timestamp) -> Result<DeltaResponse>;

    async fn mutate_contract(&self, id: EntityId, mutation: &ContractMutation) -> Result<MutationAck>;
}
