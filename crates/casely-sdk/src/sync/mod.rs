//! 增量同步：实体类型、状态容器、同步引擎、乐观更新与轮询

mod entity_kind;
pub mod engine;
pub mod mutator;
pub mod poller;
pub mod state;

pub use engine::{ApplyFilter, ApplyOutcome, LoadOutcome, SyncEngine};
pub use entity_kind::EntityKind;
pub use mutator::OptimisticMutator;
pub use poller::{PollerConfig, SyncPoller};
pub use state::{PendingChanges, StateContainer, StateListener, SubscriptionId, SyncState};
