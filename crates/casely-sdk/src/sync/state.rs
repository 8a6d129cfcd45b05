//! 同步状态容器
//!
//! 状态整体以 `Arc<SyncState>` 不可变快照对外提供；所有状态转换都在同一把写锁内完成，
//! 转换之间不会交错。订阅者在写锁释放后按提交顺序收到新快照。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tokio::sync::watch;

use crate::cache::EntityCache;
use crate::entity::{Contract, Label, Timestamp};
use crate::storage::SnapshotMeta;

/// 已拉取但尚未应用的增量。保留 tombstone。
#[derive(Debug, Clone, Default)]
pub struct PendingChanges {
    pub contracts: Arc<EntityCache<Contract>>,
    pub labels: Arc<EntityCache<Label>>,
    /// 两类游标的最大值
    pub last_updated: Timestamp,
}

impl PendingChanges {
    pub fn new(contracts: Arc<EntityCache<Contract>>, labels: Arc<EntityCache<Label>>) -> Self {
        let last_updated = contracts.last_updated().max(labels.last_updated());
        Self {
            contracts,
            labels,
            last_updated,
        }
    }

    /// 空 pending，游标从给定位置开始
    pub fn with_cursors(contract_cursor: Timestamp, label_cursor: Timestamp) -> Self {
        Self::new(
            Arc::new(EntityCache::with_cursor(contract_cursor)),
            Arc::new(EntityCache::with_cursor(label_cursor)),
        )
    }

    pub fn count(&self) -> usize {
        self.contracts.count() + self.labels.count()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

/// 同步引擎状态
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    pub bootstrapped: bool,
    pub is_loading: bool,
    /// 最近一次拉取结束（或恢复的快照保存）时间；0 表示冷启动
    pub last_loaded_at: Timestamp,
    pub contracts: Arc<EntityCache<Contract>>,
    pub labels: Arc<EntityCache<Label>>,
    pub pending: PendingChanges,
    /// 拉取后是否自动应用（持久化的默认值）
    pub auto_apply_changes: bool,
    /// 最近加载或保存的快照
    pub current_snapshot: Option<SnapshotMeta>,
}

/// 订阅句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type StateListener = Arc<dyn Fn(&Arc<SyncState>) + Send + Sync>;

/// 状态容器：创建一次，注入到引擎、乐观更新器和调用方
pub struct StateContainer {
    state: RwLock<Arc<SyncState>>,
    listeners: Mutex<Vec<(SubscriptionId, StateListener)>>,
    next_id: AtomicU64,
    watch_tx: watch::Sender<Arc<SyncState>>,
    /// 从提交到通知完成期间持有，保证监听器按提交顺序收到状态。
    /// 可重入：监听器内部可以再次修改状态。
    notify_lock: ReentrantMutex<()>,
}

impl StateContainer {
    pub fn new(initial: SyncState) -> Self {
        let initial = Arc::new(initial);
        let (watch_tx, _) = watch::channel(Arc::clone(&initial));
        Self {
            state: RwLock::new(initial),
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            watch_tx,
            notify_lock: ReentrantMutex::new(()),
        }
    }

    /// 当前状态快照
    pub fn get(&self) -> Arc<SyncState> {
        Arc::clone(&self.state.read())
    }

    /// 在写锁内由旧状态计算新状态。
    /// 闭包返回 `(None, r)` 表示没有变化，此时不通知订阅者。
    pub fn update<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&SyncState) -> (Option<SyncState>, R),
    {
        // 先于写锁获取，通知期间其它线程不能提交新状态
        let _notify = self.notify_lock.lock();
        let (next, result) = {
            let mut guard = self.state.write();
            let (next, result) = f(&guard);
            let next = next.map(|state| {
                let next = Arc::new(state);
                *guard = Arc::clone(&next);
                self.watch_tx.send_replace(Arc::clone(&next));
                next
            });
            (next, result)
        };

        if let Some(next) = next {
            self.notify(&next);
        }
        result
    }

    /// 总是产生新状态的修改
    pub fn set<F>(&self, f: F)
    where
        F: FnOnce(&mut SyncState),
    {
        self.update(|current| {
            let mut next = current.clone();
            f(&mut next);
            (Some(next), ())
        })
    }

    /// 注册监听器，每次状态变化后同步调用。
    ///
    /// 监听器按提交顺序收到状态；在监听器内修改状态时，新状态会立即嵌套通知。
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&Arc<SyncState>) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// 返回是否确实移除了订阅
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(sid, _)| *sid != id);
        listeners.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// 以 watch channel 观察状态（异步调用方使用）
    pub fn watch(&self) -> watch::Receiver<Arc<SyncState>> {
        self.watch_tx.subscribe()
    }

    fn notify(&self, state: &Arc<SyncState>) {
        // 复制一份再调用，监听器内部可以安全地订阅/退订
        let listeners: Vec<StateListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(state);
        }
    }
}

impl Default for StateContainer {
    fn default() -> Self {
        Self::new(SyncState::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_update_without_change_does_not_notify() {
        let container = StateContainer::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        container.subscribe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        let before = container.get();
        let value = container.update(|_| (None, 7));
        assert_eq!(value, 7);
        assert!(Arc::ptr_eq(&before, &container.get()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        container.set(|s| s.is_loading = true);
        assert!(container.get().is_loading);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let container = StateContainer::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let id = container.subscribe(move |state| {
            assert!(state.bootstrapped);
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(container.subscriber_count(), 1);

        container.set(|s| s.bootstrapped = true);
        assert!(container.unsubscribe(id));
        assert!(!container.unsubscribe(id));
        container.set(|s| s.last_loaded_at = 5);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listeners_see_commits_in_order() {
        let container = Arc::new(StateContainer::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        container.subscribe(move |state| seen_clone.lock().push(state.last_loaded_at));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let container = container.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        container.set(|s| s.last_loaded_at += 1);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let seen = seen.lock();
        assert_eq!(seen.len(), 800);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(container.get().last_loaded_at, 800);
    }

    #[test]
    fn test_listener_can_update_state() {
        let container = Arc::new(StateContainer::default());
        let inner = container.clone();
        container.subscribe(move |state| {
            if state.bootstrapped && !state.is_loading {
                inner.set(|s| s.is_loading = true);
            }
        });

        container.set(|s| s.bootstrapped = true);
        assert!(container.get().is_loading);
    }

    #[tokio::test]
    async fn test_watch_receives_latest_state() {
        let container = StateContainer::default();
        let mut rx = container.watch();
        container.set(|s| s.last_loaded_at = 42);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().last_loaded_at, 42);
    }

    #[test]
    fn test_pending_changes_aggregate_cursor() {
        let pending = PendingChanges::with_cursors(100, 250);
        assert_eq!(pending.last_updated, 250);
        assert!(pending.is_empty());
    }
}
