//! 乐观更新 - 先改本地，再提交服务端，失败回滚
//!
//! 本地修改在网络请求之前同步完成。回滚只恢复被修改的那个字段，
//! 期间由 apply_pending 带来的其它字段变化会保留。
//! 同一合同的并发修改不加锁，以最后完成的请求为准。

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::state::StateContainer;
use crate::entity::{Contract, EntityId, RefreshPolicy};
use crate::error::Result;
use crate::events::{EventManager, SyncEvent};
use crate::remote::{ContractMutation, MutationAck, RemoteSource};
use crate::utils::time::now_millis;

/// 修改前的字段值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PreviousValue {
    RefreshPolicy(RefreshPolicy),
    LabelPresence { label_id: EntityId, present: bool },
}

impl PreviousValue {
    fn capture(contract: &Contract, mutation: &ContractMutation) -> Self {
        match *mutation {
            ContractMutation::SetRefreshPolicy(_) => PreviousValue::RefreshPolicy(contract.refresh_policy),
            ContractMutation::AddLabel(label_id) | ContractMutation::RemoveLabel(label_id) => {
                PreviousValue::LabelPresence {
                    label_id,
                    present: contract.has_label(label_id),
                }
            }
        }
    }

    fn restore(&self, contract: &mut Contract) {
        match *self {
            PreviousValue::RefreshPolicy(policy) => contract.refresh_policy = policy,
            PreviousValue::LabelPresence { label_id, present } => {
                if present {
                    if !contract.has_label(label_id) {
                        contract.labels.push(label_id);
                    }
                } else {
                    contract.labels.retain(|id| *id != label_id);
                }
            }
        }
    }
}

/// 乐观更新器
pub struct OptimisticMutator {
    state: Arc<StateContainer>,
    remote: Arc<dyn RemoteSource>,
    events: Arc<EventManager>,
}

impl OptimisticMutator {
    pub fn new(state: Arc<StateContainer>, remote: Arc<dyn RemoteSource>, events: Arc<EventManager>) -> Self {
        Self { state, remote, events }
    }

    /// 修改基础缓存中合同的一个字段并提交服务端
    ///
    /// 合同不在本地缓存时不做本地修改，仍然提交服务端；失败时也无需回滚。
    pub async fn set_field(&self, id: EntityId, mutation: ContractMutation) -> Result<MutationAck> {
        let previous = self.state.update(|s| {
            let Some(contract) = s.contracts.get(id) else {
                return (None, None);
            };
            let previous = PreviousValue::capture(contract, &mutation);
            match s.contracts.with_updated(id, |c| mutation.apply_to(c)) {
                Some(updated) => {
                    let mut next = s.clone();
                    next.contracts = Arc::new(updated);
                    (Some(next), Some(previous))
                }
                None => (None, None),
            }
        });
        if previous.is_none() {
            debug!("合同 {} 不在本地缓存，直接提交 {}", id, mutation.field());
        }

        match self.remote.mutate_contract(id, &mutation).await {
            Ok(ack) => {
                info!("✅ 合同 {} 的 {} 修改已提交", id, mutation.field());
                self.events
                    .emit(SyncEvent::MutationCommitted {
                        contract_id: id,
                        field: mutation.field().to_string(),
                        timestamp: now_millis(),
                    })
                    .await;
                Ok(ack)
            }
            Err(e) => {
                warn!("⚠️ 合同 {} 的 {} 修改失败，回滚: {}", id, mutation.field(), e);
                if let Some(previous) = previous {
                    self.rollback(id, previous);
                }
                self.events
                    .emit(SyncEvent::MutationRolledBack {
                        contract_id: id,
                        field: mutation.field().to_string(),
                        error: e.to_string(),
                        timestamp: now_millis(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    fn rollback(&self, id: EntityId, previous: PreviousValue) {
        self.state.update(|s| match s.contracts.with_updated(id, |c| previous.restore(c)) {
            Some(restored) => {
                let mut next = s.clone();
                next.contracts = Arc::new(restored);
                (Some(next), ())
            }
            // 期间被删除，没有可恢复的对象
            None => (None, ()),
        })
    }

    pub async fn set_refresh_policy(&self, id: EntityId, policy: RefreshPolicy) -> Result<MutationAck> {
        self.set_field(id, ContractMutation::SetRefreshPolicy(policy)).await
    }

    pub async fn add_label(&self, id: EntityId, label_id: EntityId) -> Result<MutationAck> {
        self.set_field(id, ContractMutation::AddLabel(label_id)).await
    }

    pub async fn remove_label(&self, id: EntityId, label_id: EntityId) -> Result<MutationAck> {
        self.set_field(id, ContractMutation::RemoveLabel(label_id)).await
    }
}
