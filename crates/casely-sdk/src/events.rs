//! 事件系统 - 同步过程中的离散事件广播
//!
//! 功能包括：
//! - 启动恢复、增量拉取、应用 pending 事件
//! - 快照保存/失败事件
//! - 乐观更新提交/回滚事件
//! - 广播订阅与按类型注册的监听器

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::entity::{EntityId, Timestamp};
use crate::utils::time::now_millis;

/// 同步事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 启动恢复完成
    Bootstrapped {
        snapshot_id: Option<i64>,
        contracts: usize,
        labels: usize,
        timestamp: Timestamp,
    },
    /// 增量拉取完成
    ChangesLoaded {
        pending_contracts: usize,
        pending_labels: usize,
        timestamp: Timestamp,
    },
    /// 增量拉取失败（pending 保持不变）
    LoadFailed { error: String, timestamp: Timestamp },
    /// pending 已应用到基础缓存
    PendingApplied {
        contracts: usize,
        labels: usize,
        remaining: usize,
        timestamp: Timestamp,
    },
    /// 快照已保存
    SnapshotSaved {
        snapshot_id: i64,
        written: bool,
        deleted: usize,
        timestamp: Timestamp,
    },
    /// 快照保存或清理失败（内存状态不受影响）
    SnapshotFailed { error: String, timestamp: Timestamp },
    /// 乐观更新已被服务端确认
    MutationCommitted {
        contract_id: EntityId,
        field: String,
        timestamp: Timestamp,
    },
    /// 乐观更新失败并已回滚
    MutationRolledBack {
        contract_id: EntityId,
        field: String,
        error: String,
        timestamp: Timestamp,
    },
}

impl SyncEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::Bootstrapped { .. } => "bootstrapped",
            SyncEvent::ChangesLoaded { .. } => "changes_loaded",
            SyncEvent::LoadFailed { .. } => "load_failed",
            SyncEvent::PendingApplied { .. } => "pending_applied",
            SyncEvent::SnapshotSaved { .. } => "snapshot_saved",
            SyncEvent::SnapshotFailed { .. } => "snapshot_failed",
            SyncEvent::MutationCommitted { .. } => "mutation_committed",
            SyncEvent::MutationRolledBack { .. } => "mutation_rolled_back",
        }
    }

    /// 获取事件时间戳
    pub fn timestamp(&self) -> Timestamp {
        match self {
            SyncEvent::Bootstrapped { timestamp, .. }
            | SyncEvent::ChangesLoaded { timestamp, .. }
            | SyncEvent::LoadFailed { timestamp, .. }
            | SyncEvent::PendingApplied { timestamp, .. }
            | SyncEvent::SnapshotSaved { timestamp, .. }
            | SyncEvent::SnapshotFailed { timestamp, .. }
            | SyncEvent::MutationCommitted { timestamp, .. }
            | SyncEvent::MutationRolledBack { timestamp, .. } => *timestamp,
        }
    }

    /// 相关合同 ID（仅乐观更新事件）
    pub fn contract_id(&self) -> Option<EntityId> {
        match self {
            SyncEvent::MutationCommitted { contract_id, .. }
            | SyncEvent::MutationRolledBack { contract_id, .. } => Some(*contract_id),
            _ => None,
        }
    }

    pub fn load_failed(error: impl ToString) -> Self {
        SyncEvent::LoadFailed {
            error: error.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn snapshot_failed(error: impl ToString) -> Self {
        SyncEvent::SnapshotFailed {
            error: error.to_string(),
            timestamp: now_millis(),
        }
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<Timestamp>,
}

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    listeners: Arc<tokio::sync::RwLock<HashMap<String, Vec<EventListener>>>>,
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));

        Self {
            sender,
            listeners: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 会失败，属正常场景
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let listeners = self.listeners.read().await;
        if let Some(event_listeners) = listeners.get(event.event_type()) {
            for listener in event_listeners {
                listener(&event);
            }
        }
        if let Some(general_listeners) = listeners.get("*") {
            for listener in general_listeners {
                listener(&event);
            }
        }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 添加事件监听器；`event_type` 为 "*" 时接收全部事件
    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(event_type.to_string())
            .or_default()
            .push(Box::new(listener));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener for event type: {}", event_type);
    }

    pub async fn clear_listeners(&self) {
        let mut listeners = self.listeners.write().await;
        listeners.clear();

        let mut stats = self.stats.write().await;
        stats.listener_count = 0;
    }

    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    /// 获取活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
