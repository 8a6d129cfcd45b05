//! 同步引擎 - 启动恢复、增量拉取、pending 应用与快照持久化
//!
//! 状态机：idle → loading → idle；applying 是同步的状态转换。
//! 挂起点只有远端请求与快照存储访问，期间不持有状态锁。

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::state::{PendingChanges, StateContainer, SyncState};
use super::EntityKind;
use crate::cache::{apply_pending, merge_delta};
use crate::entity::{Contract, EntityId, Label, SyncEntity};
use crate::error::Result;
use crate::events::{EventManager, SyncEvent};
use crate::remote::RemoteSource;
use crate::storage::kv::keys;
use crate::storage::{KvStore, SnapshotDraft, SnapshotStore};
use crate::utils::time::now_millis;

/// 只应用部分 pending 时的 id 过滤；某一类为 None 表示该类全部应用
#[derive(Debug, Clone, Default)]
pub struct ApplyFilter {
    pub contract_ids: Option<HashSet<EntityId>>,
    pub label_ids: Option<HashSet<EntityId>>,
}

impl ApplyFilter {
    pub fn contracts<I: IntoIterator<Item = EntityId>>(ids: I) -> Self {
        Self {
            contract_ids: Some(ids.into_iter().collect()),
            label_ids: None,
        }
    }

    pub fn labels<I: IntoIterator<Item = EntityId>>(ids: I) -> Self {
        Self {
            contract_ids: None,
            label_ids: Some(ids.into_iter().collect()),
        }
    }
}

/// 一次拉取的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// 已有拉取在进行，本次被丢弃
    Skipped,
    /// 服务端没有新数据
    Unchanged,
    Loaded {
        pending_contracts: usize,
        pending_labels: usize,
        auto_applied: bool,
    },
    /// 拉取或解析失败，pending 保持不变
    Failed(String),
}

/// 一次应用的结果
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub contracts_applied: usize,
    pub labels_applied: usize,
    pub remaining: usize,
    /// 事件通知与快照持久化的后台任务
    pub background: Option<JoinHandle<()>>,
}

impl ApplyOutcome {
    pub fn is_noop(&self) -> bool {
        self.contracts_applied == 0 && self.labels_applied == 0
    }

    /// 等待后台任务结束（测试与关闭流程使用）
    pub async fn wait(self) {
        if let Some(handle) = self.background {
            if let Err(e) = handle.await {
                warn!("快照后台任务异常结束: {}", e);
            }
        }
    }
}

/// 拉取结束（包括被取消）时清除 loading 并记录拉取时间
struct LoadingGuard<'a> {
    state: &'a StateContainer,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.state.set(|s| {
            s.is_loading = false;
            s.last_loaded_at = now_millis();
        });
    }
}

/// 同步引擎
pub struct SyncEngine {
    state: Arc<StateContainer>,
    remote: Arc<dyn RemoteSource>,
    snapshots: Arc<dyn SnapshotStore>,
    events: Arc<EventManager>,
    kv: Option<KvStore>,
    bootstrap_lock: AsyncMutex<()>,
    /// 快照保存与清理按顺序执行
    persist_lock: Arc<AsyncMutex<()>>,
}

impl SyncEngine {
    pub fn new(
        state: Arc<StateContainer>,
        remote: Arc<dyn RemoteSource>,
        snapshots: Arc<dyn SnapshotStore>,
        events: Arc<EventManager>,
        kv: Option<KvStore>,
    ) -> Self {
        Self {
            state,
            remote,
            snapshots,
            events,
            kv,
            bootstrap_lock: AsyncMutex::new(()),
            persist_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn state(&self) -> Arc<SyncState> {
        self.state.get()
    }

    pub fn state_container(&self) -> &Arc<StateContainer> {
        &self.state
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    /// 从最新快照恢复基础缓存；多次调用只执行一次
    ///
    /// 快照读取失败只记录警告并把 `last_loaded_at` 置 0，启动总会完成。
    pub async fn bootstrap(&self) {
        let _guard = self.bootstrap_lock.lock().await;
        if self.state.get().bootstrapped {
            return;
        }

        info!("🔄 同步引擎启动恢复...");
        match self.snapshots.load_latest().await {
            Ok(Some(snapshot)) => {
                info!(
                    "✅ 已从快照 {} 恢复: contracts={}, labels={}",
                    snapshot.meta.id,
                    snapshot.contracts.count(),
                    snapshot.labels.count()
                );
                self.state.set(|s| {
                    s.pending = PendingChanges::with_cursors(
                        snapshot.contracts.last_updated(),
                        snapshot.labels.last_updated(),
                    );
                    s.contracts = Arc::clone(&snapshot.contracts);
                    s.labels = Arc::clone(&snapshot.labels);
                    s.last_loaded_at = snapshot.meta.timestamp;
                    s.current_snapshot = Some(snapshot.meta);
                });
            }
            Ok(None) => {
                info!("本地没有快照，从空缓存开始");
            }
            Err(e) => {
                warn!("⚠️ 加载快照失败，将重新全量拉取: {}", e);
                self.state.set(|s| s.last_loaded_at = 0);
            }
        }

        let auto_apply = self.load_auto_apply_preference().await;
        self.state.set(|s| {
            if let Some(enabled) = auto_apply {
                s.auto_apply_changes = enabled;
            }
            s.bootstrapped = true;
        });

        let state = self.state.get();
        self.events
            .emit(SyncEvent::Bootstrapped {
                snapshot_id: state.current_snapshot.map(|m| m.id),
                contracts: state.contracts.count(),
                labels: state.labels.count(),
                timestamp: now_millis(),
            })
            .await;
    }

    async fn load_auto_apply_preference(&self) -> Option<bool> {
        let kv = self.kv.as_ref()?;
        match kv.get::<_, bool>(keys::AUTO_APPLY_CHANGES).await {
            Ok(value) => value,
            Err(e) => {
                warn!("读取 auto_apply 设置失败: {}", e);
                None
            }
        }
    }

    /// 修改并持久化“拉取后自动应用”的默认值
    pub async fn set_auto_apply(&self, enabled: bool) -> Result<()> {
        self.state.set(|s| s.auto_apply_changes = enabled);
        if let Some(kv) = &self.kv {
            kv.set(keys::AUTO_APPLY_CHANGES, &enabled).await?;
        }
        info!("auto_apply_changes = {}", enabled);
        Ok(())
    }

    /// 拉取两类实体的增量到 pending
    ///
    /// 已在拉取时直接返回 `Skipped`。`auto_apply` 为 None 时使用持久化的默认值。
    /// 无论成功与否，结束时都会清除 loading 并把 `last_loaded_at` 设为当前时间。
    pub async fn load_changes(&self, auto_apply: Option<bool>) -> LoadOutcome {
        let started = self.state.update(|s| {
            if s.is_loading {
                return (None, false);
            }
            let mut next = s.clone();
            next.is_loading = true;
            (Some(next), true)
        });
        if !started {
            debug!("已有增量拉取在进行，跳过");
            return LoadOutcome::Skipped;
        }

        // 调用方中途丢弃 future 时也要复位
        let _loading = LoadingGuard { state: self.state.as_ref() };
        self.fetch_and_merge(auto_apply).await
    }

    async fn fetch_and_merge(&self, auto_apply: Option<bool>) -> LoadOutcome {
        let state = self.state.get();
        let auto_apply = auto_apply.unwrap_or(state.auto_apply_changes);
        let contract_since = state.pending.contracts.last_updated();
        let label_since = state.pending.labels.last_updated();
        drop(state);

        debug!(
            "拉取增量: contracts since {}, labels since {}",
            contract_since, label_since
        );
        let fetched = futures::try_join!(
            self.remote.fetch_delta(EntityKind::Contract, contract_since),
            self.remote.fetch_delta(EntityKind::Label, label_since),
        );
        let (contract_delta, label_delta) = match fetched {
            Ok(deltas) => deltas,
            Err(e) => {
                warn!("⚠️ 拉取增量失败: {}", e);
                self.events.emit(SyncEvent::load_failed(&e)).await;
                return LoadOutcome::Failed(e.to_string());
            }
        };

        // 合并到当前 pending（而不是拉取前的副本）
        let merged = self.state.update(|s| {
            let contracts = match merge_delta(&s.pending.contracts, &contract_delta, Contract::from_row, true) {
                Ok(cache) => cache,
                Err(e) => return (None, Err(e)),
            };
            let labels = match merge_delta(&s.pending.labels, &label_delta, Label::from_row, true) {
                Ok(cache) => cache,
                Err(e) => return (None, Err(e)),
            };
            if Arc::ptr_eq(&contracts, &s.pending.contracts) && Arc::ptr_eq(&labels, &s.pending.labels) {
                return (None, Ok(false));
            }
            let mut next = s.clone();
            next.pending = PendingChanges::new(contracts, labels);
            (Some(next), Ok(true))
        });

        let changed = match merged {
            Ok(changed) => changed,
            Err(e) => {
                error!("❌ 合并增量失败，pending 保持不变: {}", e);
                self.events.emit(SyncEvent::load_failed(&e)).await;
                return LoadOutcome::Failed(e.to_string());
            }
        };

        let pending = self.state.get().pending.clone();
        if changed {
            info!(
                "📥 增量已拉取: pending contracts={}, labels={}",
                pending.contracts.count(),
                pending.labels.count()
            );
            self.events
                .emit(SyncEvent::ChangesLoaded {
                    pending_contracts: pending.contracts.count(),
                    pending_labels: pending.labels.count(),
                    timestamp: now_millis(),
                })
                .await;
        }

        let mut auto_applied = false;
        if auto_apply && !pending.is_empty() {
            let outcome = self.apply_pending(None);
            auto_applied = !outcome.is_noop();
        }

        if changed {
            LoadOutcome::Loaded {
                pending_contracts: pending.contracts.count(),
                pending_labels: pending.labels.count(),
                auto_applied,
            }
        } else {
            LoadOutcome::Unchanged
        }
    }

    /// 将 pending 提升到基础缓存
    ///
    /// 同步完成状态转换。pending 全部应用且游标非 0 时，在后台保存快照并清理旧快照；
    /// 持久化失败只记录日志，不回滚内存状态。
    pub fn apply_pending(&self, filter: Option<ApplyFilter>) -> ApplyOutcome {
        let filter = filter.unwrap_or_default();

        let applied = self.state.update(|s| {
            let (contracts, pending_contracts) = apply_pending(
                &s.contracts,
                &s.pending.contracts,
                filter.contract_ids.as_ref(),
            );
            let (labels, pending_labels) =
                apply_pending(&s.labels, &s.pending.labels, filter.label_ids.as_ref());

            if Arc::ptr_eq(&contracts, &s.contracts)
                && Arc::ptr_eq(&labels, &s.labels)
                && Arc::ptr_eq(&pending_contracts, &s.pending.contracts)
                && Arc::ptr_eq(&pending_labels, &s.pending.labels)
            {
                return (None, None);
            }

            let contracts_applied = s.pending.contracts.count() - pending_contracts.count();
            let labels_applied = s.pending.labels.count() - pending_labels.count();

            let mut next = s.clone();
            next.contracts = contracts;
            next.labels = labels;
            next.pending = PendingChanges::new(pending_contracts, pending_labels);

            let draft = (next.pending.is_empty() && next.pending.last_updated != 0).then(|| SnapshotDraft {
                timestamp: now_millis(),
                contracts: Arc::clone(&next.contracts),
                labels: Arc::clone(&next.labels),
            });
            let remaining = next.pending.count();
            (Some(next), Some((contracts_applied, labels_applied, remaining, draft)))
        });

        let Some((contracts_applied, labels_applied, remaining, draft)) = applied else {
            debug!("没有可应用的 pending");
            return ApplyOutcome::default();
        };

        info!(
            "✅ pending 已应用: contracts={}, labels={}, 剩余={}",
            contracts_applied, labels_applied, remaining
        );

        let applied_event = SyncEvent::PendingApplied {
            contracts: contracts_applied,
            labels: labels_applied,
            remaining,
            timestamp: now_millis(),
        };
        let events = Arc::clone(&self.events);
        let snapshots = Arc::clone(&self.snapshots);
        let state = Arc::clone(&self.state);
        let persist_lock = Arc::clone(&self.persist_lock);

        let background = match tokio::runtime::Handle::try_current() {
            Ok(handle) => Some(handle.spawn(async move {
                events.emit(applied_event).await;
                if let Some(draft) = draft {
                    persist_snapshot(persist_lock, snapshots, state, events, draft).await;
                }
            })),
            Err(_) => {
                warn!("当前不在 tokio 运行时中，跳过事件通知与快照保存");
                None
            }
        };

        ApplyOutcome {
            contracts_applied,
            labels_applied,
            remaining,
            background,
        }
    }
}

/// 保存快照并按保留策略清理；失败只记录日志与事件
///
/// 多次全量应用产生的后台任务在 `persist_lock` 上排队。晚到的旧草稿由存储跳过，
/// `current_snapshot` 只会指向最新快照。
async fn persist_snapshot(
    persist_lock: Arc<AsyncMutex<()>>,
    snapshots: Arc<dyn SnapshotStore>,
    state: Arc<StateContainer>,
    events: Arc<EventManager>,
    draft: SnapshotDraft,
) {
    let _guard = persist_lock.lock().await;
    let outcome = match snapshots.save(draft).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("❌ 保存快照失败: {}", e);
            events.emit(SyncEvent::snapshot_failed(&e)).await;
            return;
        }
    };

    let deleted = match snapshots.cleanup(now_millis()).await {
        Ok(deleted) => deleted,
        Err(e) => {
            warn!("⚠️ 清理旧快照失败: {}", e);
            events.emit(SyncEvent::snapshot_failed(&e)).await;
            0
        }
    };

    let meta = outcome.meta();
    state.set(|s| s.current_snapshot = Some(meta));
    events
        .emit(SyncEvent::SnapshotSaved {
            snapshot_id: meta.id,
            written: outcome.is_written(),
            deleted,
            timestamp: now_millis(),
        })
        .await;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::EntityCache;
    use crate::entity::{DeltaResponse, RawRow, Timestamp};
    use crate::error::CaselySDKError;
    use crate::remote::{ContractMutation, MutationAck};
    use crate::storage::{SaveOutcome, Snapshot, SnapshotMeta, SqliteSnapshotStore};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use tokio::sync::Semaphore;

    /// 按脚本返回结果的远端数据源
    #[derive(Default)]
    pub(crate) struct MockRemote {
        pub contracts: Mutex<VecDeque<Result<DeltaResponse>>>,
        pub labels: Mutex<VecDeque<Result<DeltaResponse>>>,
        pub mutations: Mutex<VecDeque<Result<MutationAck>>>,
        pub fetch_calls: Mutex<Vec<(EntityKind, Timestamp)>>,
        pub mutation_calls: Mutex<Vec<(EntityId, ContractMutation)>>,
        /// 设置后每次拉取都要先拿到一个许可
        pub gate: Option<Arc<Semaphore>>,
    }

    impl MockRemote {
        pub fn gated(gate: Arc<Semaphore>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::default()
            }
        }

        pub fn push_contracts(&self, delta: Result<DeltaResponse>) {
            self.contracts.lock().push_back(delta);
        }

        pub fn push_labels(&self, delta: Result<DeltaResponse>) {
            self.labels.lock().push_back(delta);
        }

        pub fn push_mutation(&self, ack: Result<MutationAck>) {
            self.mutations.lock().push_back(ack);
        }

        pub fn fetch_count(&self) -> usize {
            self.fetch_calls.lock().len()
        }
    }

    #[async_trait]
    impl RemoteSource for MockRemote {
        async fn fetch_delta(&self, kind: EntityKind, since: Timestamp) -> Result<DeltaResponse> {
            self.fetch_calls.lock().push((kind, since));
            if let Some(gate) = &self.gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            let queue = match kind {
                EntityKind::Contract => &self.contracts,
                EntityKind::Label => &self.labels,
            };
            let next = queue.lock().pop_front();
            next.unwrap_or_else(|| Ok(DeltaResponse::empty(since)))
        }

        async fn mutate_contract(&self, id: EntityId, mutation: &ContractMutation) -> Result<MutationAck> {
            self.mutation_calls.lock().push((id, *mutation));
            let next = self.mutations.lock().pop_front();
            next.unwrap_or_else(|| Ok(MutationAck::default()))
        }
    }

    /// 所有操作都失败的快照存储
    pub(crate) struct FailingSnapshotStore;

    #[async_trait]
    impl SnapshotStore for FailingSnapshotStore {
        async fn save(&self, _draft: SnapshotDraft) -> Result<SaveOutcome> {
            Err(CaselySDKError::Database("disk full".to_string()))
        }

        async fn load_latest(&self) -> Result<Option<Snapshot>> {
            Err(CaselySDKError::Database("corrupt".to_string()))
        }

        async fn load_latest_meta(&self) -> Result<Option<SnapshotMeta>> {
            Err(CaselySDKError::Database("corrupt".to_string()))
        }

        async fn list_metas(&self) -> Result<Vec<SnapshotMeta>> {
            Ok(Vec::new())
        }

        async fn load_by_id(&self, _id: i64) -> Result<Option<Snapshot>> {
            Ok(None)
        }

        async fn cleanup(&self, _now: Timestamp) -> Result<usize> {
            Err(CaselySDKError::Database("disk full".to_string()))
        }
    }

    pub(crate) fn contract_row(id: EntityId, updated_at: Timestamp, deleted_at: Option<Timestamp>) -> RawRow {
        RawRow::new(id, updated_at, deleted_at)
            .with_field("detail", json!({"name": format!("contract-{}", id)}))
            .with_field("refresh_policy", json!(0))
    }

    pub(crate) fn label_row(id: EntityId, updated_at: Timestamp, deleted_at: Option<Timestamp>) -> RawRow {
        RawRow::new(id, updated_at, deleted_at).with_field("name", json!(format!("label-{}", id)))
    }

    pub(crate) fn engine_with(remote: Arc<MockRemote>, snapshots: Arc<dyn SnapshotStore>) -> SyncEngine {
        SyncEngine::new(
            Arc::new(StateContainer::default()),
            remote,
            snapshots,
            Arc::new(EventManager::new(64)),
            None,
        )
    }

    fn memory_store() -> Arc<SqliteSnapshotStore> {
        Arc::new(SqliteSnapshotStore::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_bootstrap_without_snapshot() {
        let engine = engine_with(Arc::new(MockRemote::default()), memory_store());
        engine.bootstrap().await;
        let state = engine.state();
        assert!(state.bootstrapped);
        assert_eq!(state.last_loaded_at, 0);
        assert!(state.current_snapshot.is_none());
    }

    #[tokio::test]
    async fn test_bootstrap_storage_failure_still_completes() {
        let engine = engine_with(Arc::new(MockRemote::default()), Arc::new(FailingSnapshotStore));
        engine.state_container().set(|s| s.last_loaded_at = 999);
        engine.bootstrap().await;
        let state = engine.state();
        assert!(state.bootstrapped);
        assert_eq!(state.last_loaded_at, 0);
    }

    #[tokio::test]
    async fn test_bootstrap_restores_snapshot_and_cursors() {
        let store = memory_store();
        let contracts = crate::cache::EntityCache::from_entities(
            300,
            vec![Contract::from_row(&contract_row(1, 300, None)).unwrap()],
        );
        let labels = crate::cache::EntityCache::from_entities(
            200,
            vec![Label::from_row(&label_row(9, 200, None)).unwrap()],
        );
        let saved = store
            .save(SnapshotDraft {
                timestamp: 5_000,
                contracts: Arc::new(contracts),
                labels: Arc::new(labels),
            })
            .await
            .unwrap()
            .meta();

        let remote = Arc::new(MockRemote::default());
        let engine = engine_with(remote.clone(), store);
        engine.bootstrap().await;
        engine.bootstrap().await;

        let state = engine.state();
        assert_eq!(state.contracts.count(), 1);
        assert_eq!(state.labels.count(), 1);
        assert_eq!(state.last_loaded_at, 5_000);
        assert_eq!(state.current_snapshot, Some(saved));
        assert_eq!(state.pending.contracts.last_updated(), 300);
        assert_eq!(state.pending.labels.last_updated(), 200);
        assert!(state.pending.is_empty());

        // 下一次拉取从快照游标开始
        engine.load_changes(None).await;
        let calls = remote.fetch_calls.lock().clone();
        assert!(calls.contains(&(EntityKind::Contract, 300)));
        assert!(calls.contains(&(EntityKind::Label, 200)));
    }

    #[tokio::test]
    async fn test_load_changes_fills_pending_without_auto_apply() {
        let remote = Arc::new(MockRemote::default());
        remote.push_contracts(Ok(DeltaResponse::new(
            vec![contract_row(1, 100, None), contract_row(2, 150, Some(150))],
            150,
        )));
        remote.push_labels(Ok(DeltaResponse::new(vec![label_row(7, 90, None)], 90)));
        let engine = engine_with(remote.clone(), memory_store());
        engine.bootstrap().await;

        let outcome = engine.load_changes(Some(false)).await;
        assert_eq!(
            outcome,
            LoadOutcome::Loaded {
                pending_contracts: 2,
                pending_labels: 1,
                auto_applied: false
            }
        );

        let state = engine.state();
        assert!(!state.is_loading);
        assert!(state.last_loaded_at > 0);
        assert_eq!(state.contracts.count(), 0);
        assert_eq!(state.pending.count(), 3);
        assert_eq!(state.pending.last_updated, 150);
        // pending 保留 tombstone
        assert!(state.pending.contracts.get(2).unwrap().is_tombstone());

        // 再拉一次，没有新数据
        assert_eq!(engine.load_changes(Some(false)).await, LoadOutcome::Unchanged);
        let calls = remote.fetch_calls.lock().clone();
        assert!(calls.contains(&(EntityKind::Contract, 150)));
        assert!(calls.contains(&(EntityKind::Label, 90)));
    }

    #[tokio::test]
    async fn test_load_changes_auto_apply_persists_snapshot() {
        let remote = Arc::new(MockRemote::default());
        remote.push_contracts(Ok(DeltaResponse::new(vec![contract_row(1, 100, None)], 100)));
        remote.push_labels(Ok(DeltaResponse::new(vec![label_row(7, 90, None)], 90)));
        let store = memory_store();
        let engine = engine_with(remote, store.clone());
        engine.bootstrap().await;

        let mut events = engine.events().subscribe();
        let outcome = engine.load_changes(Some(true)).await;
        assert!(matches!(outcome, LoadOutcome::Loaded { auto_applied: true, .. }));

        let state = engine.state();
        assert_eq!(state.contracts.count(), 1);
        assert_eq!(state.labels.count(), 1);
        assert_eq!(state.contracts.last_updated(), 100);
        assert!(state.pending.is_empty());

        let saved = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if let Ok(SyncEvent::SnapshotSaved { snapshot_id, .. }) = events.recv().await {
                    return snapshot_id;
                }
            }
        })
        .await
        .unwrap();

        let snap = store.load_latest().await.unwrap().unwrap();
        assert_eq!(snap.meta.id, saved);
        assert_eq!(snap.contracts.count(), 1);
        assert_eq!(engine.state().current_snapshot.map(|m| m.id), Some(saved));
    }

    #[tokio::test]
    async fn test_load_changes_uses_persisted_default() {
        let remote = Arc::new(MockRemote::default());
        remote.push_labels(Ok(DeltaResponse::new(vec![label_row(7, 90, None)], 90)));
        let engine = engine_with(remote, memory_store());
        engine.bootstrap().await;
        engine.set_auto_apply(true).await.unwrap();

        let outcome = engine.load_changes(None).await;
        assert!(matches!(outcome, LoadOutcome::Loaded { auto_applied: true, .. }));
        assert_eq!(engine.state().labels.count(), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_pending_and_updates_last_loaded() {
        let remote = Arc::new(MockRemote::default());
        remote.push_contracts(Ok(DeltaResponse::new(vec![contract_row(1, 100, None)], 100)));
        remote.push_labels(Err(CaselySDKError::Transport("offline".to_string())));
        let engine = engine_with(remote, memory_store());
        engine.bootstrap().await;

        let outcome = engine.load_changes(Some(false)).await;
        assert!(matches!(outcome, LoadOutcome::Failed(_)));
        let state = engine.state();
        assert!(!state.is_loading);
        assert!(state.last_loaded_at > 0);
        // 两类都不写入
        assert!(state.pending.is_empty());
        assert_eq!(state.pending.contracts.last_updated(), 0);
    }

    #[tokio::test]
    async fn test_unparseable_row_fails_load() {
        let remote = Arc::new(MockRemote::default());
        remote.push_contracts(Ok(DeltaResponse::new(vec![RawRow::new(1, 100, None)], 100)));
        let engine = engine_with(remote, memory_store());

        let outcome = engine.load_changes(Some(false)).await;
        assert!(matches!(outcome, LoadOutcome::Failed(_)));
        assert_eq!(engine.state().pending.contracts.last_updated(), 0);
    }

    #[tokio::test]
    async fn test_overlapping_load_is_skipped() {
        let gate = Arc::new(Semaphore::new(0));
        let remote = Arc::new(MockRemote::gated(gate.clone()));
        let engine = Arc::new(engine_with(remote.clone(), memory_store()));

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.load_changes(None).await })
        };
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !engine.state().is_loading {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(engine.load_changes(None).await, LoadOutcome::Skipped);

        gate.add_permits(2);
        assert_eq!(first.await.unwrap(), LoadOutcome::Unchanged);
        assert_eq!(remote.fetch_count(), 2);
        assert!(!engine.state().is_loading);
    }

    #[tokio::test]
    async fn test_cancelled_load_resets_loading() {
        let gate = Arc::new(Semaphore::new(0));
        let remote = Arc::new(MockRemote::gated(gate.clone()));
        let engine = engine_with(remote.clone(), memory_store());

        let cancelled =
            tokio::time::timeout(std::time::Duration::from_millis(50), engine.load_changes(None)).await;
        assert!(cancelled.is_err());

        let state = engine.state();
        assert!(!state.is_loading);
        assert!(state.last_loaded_at > 0);

        gate.add_permits(2);
        assert_eq!(engine.load_changes(None).await, LoadOutcome::Unchanged);
        assert!(!engine.state().is_loading);
    }

    #[tokio::test]
    async fn test_out_of_order_persists_keep_newest_snapshot() {
        let store: Arc<dyn SnapshotStore> = memory_store();
        let state = Arc::new(StateContainer::default());
        let events = Arc::new(EventManager::new(16));
        let lock = Arc::new(AsyncMutex::new(()));
        let draft = |cursor: Timestamp| SnapshotDraft {
            timestamp: now_millis(),
            contracts: Arc::new(EntityCache::from_entities(
                cursor,
                vec![Contract::from_row(&contract_row(1, cursor, None)).unwrap()],
            )),
            labels: Arc::new(EntityCache::with_cursor(0)),
        };

        persist_snapshot(lock.clone(), store.clone(), state.clone(), events.clone(), draft(200)).await;
        persist_snapshot(lock.clone(), store.clone(), state.clone(), events.clone(), draft(100)).await;

        let latest = store.load_latest_meta().await.unwrap().unwrap();
        assert_eq!(latest.contract_last_updated, 200);
        assert_eq!(store.list_metas().await.unwrap().len(), 1);
        assert_eq!(state.get().current_snapshot, Some(latest));

        // 并发保存同样只留下最新游标
        futures::join!(
            persist_snapshot(lock.clone(), store.clone(), state.clone(), events.clone(), draft(300)),
            persist_snapshot(lock.clone(), store.clone(), state.clone(), events.clone(), draft(250)),
        );
        let latest = store.load_latest_meta().await.unwrap().unwrap();
        assert_eq!(latest.contract_last_updated, 300);
        assert_eq!(state.get().current_snapshot, Some(latest));
    }

    #[tokio::test]
    async fn test_apply_pending_partial_then_full() {
        let remote = Arc::new(MockRemote::default());
        remote.push_contracts(Ok(DeltaResponse::new(
            vec![contract_row(1, 100, None), contract_row(2, 200, None)],
            200,
        )));
        let store = memory_store();
        let engine = engine_with(remote, store.clone());
        engine.bootstrap().await;
        engine.load_changes(Some(false)).await;

        let partial = engine.apply_pending(Some(ApplyFilter::contracts([1])));
        assert_eq!(partial.contracts_applied, 1);
        assert_eq!(partial.remaining, 1);
        partial.wait().await;
        let state = engine.state();
        assert_eq!(state.contracts.count(), 1);
        assert_eq!(state.contracts.last_updated(), 0);
        assert!(store.load_latest_meta().await.unwrap().is_none());

        let full = engine.apply_pending(None);
        assert_eq!(full.contracts_applied, 1);
        assert_eq!(full.remaining, 0);
        full.wait().await;
        let state = engine.state();
        assert_eq!(state.contracts.count(), 2);
        assert_eq!(state.contracts.last_updated(), 200);
        let meta = store.load_latest_meta().await.unwrap().unwrap();
        assert_eq!(meta.contract_last_updated, 200);
        assert_eq!(state.current_snapshot, Some(meta));
    }

    #[tokio::test]
    async fn test_apply_pending_tombstone_removes_from_base() {
        let remote = Arc::new(MockRemote::default());
        remote.push_contracts(Ok(DeltaResponse::new(vec![contract_row(1, 100, None)], 100)));
        remote.push_contracts(Ok(DeltaResponse::new(vec![contract_row(1, 200, Some(200))], 200)));
        let engine = engine_with(remote, memory_store());
        engine.bootstrap().await;

        engine.load_changes(Some(true)).await;
        assert_eq!(engine.state().contracts.count(), 1);
        engine.load_changes(Some(true)).await;
        let state = engine.state();
        assert_eq!(state.contracts.count(), 0);
        assert_eq!(state.contracts.last_updated(), 200);
    }

    #[tokio::test]
    async fn test_apply_pending_noop_when_empty() {
        let engine = engine_with(Arc::new(MockRemote::default()), memory_store());
        let before = engine.state();
        let outcome = engine.apply_pending(None);
        assert!(outcome.is_noop());
        assert!(outcome.background.is_none());
        assert!(Arc::ptr_eq(&before, &engine.state()));
    }

    #[tokio::test]
    async fn test_snapshot_failure_does_not_roll_back_state() {
        let remote = Arc::new(MockRemote::default());
        remote.push_labels(Ok(DeltaResponse::new(vec![label_row(3, 50, None)], 50)));
        let engine = engine_with(remote, Arc::new(FailingSnapshotStore));
        engine.bootstrap().await;
        let mut events = engine.events().subscribe();

        engine.load_changes(Some(false)).await;
        engine.apply_pending(None).wait().await;

        let state = engine.state();
        assert_eq!(state.labels.count(), 1);
        assert!(state.current_snapshot.is_none());

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if event.event_type() == "snapshot_failed" {
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_auto_apply_preference_roundtrip_through_kv() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let kv = KvStore::new(temp_dir.path()).await.unwrap();
        let store: Arc<dyn SnapshotStore> = memory_store();

        let engine = SyncEngine::new(
            Arc::new(StateContainer::default()),
            Arc::new(MockRemote::default()),
            store.clone(),
            Arc::new(EventManager::new(8)),
            Some(kv.clone()),
        );
        engine.set_auto_apply(true).await.unwrap();

        let restarted = SyncEngine::new(
            Arc::new(StateContainer::default()),
            Arc::new(MockRemote::default()),
            store,
            Arc::new(EventManager::new(8)),
            Some(kv),
        );
        assert!(!restarted.state().auto_apply_changes);
        restarted.bootstrap().await;
        assert!(restarted.state().auto_apply_changes);
    }
}
