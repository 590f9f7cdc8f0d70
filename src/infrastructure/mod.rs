pub mod cache;
pub mod event_sink;
pub mod lock;
pub mod store;

pub use cache::{MemoryCache, StateCache};
pub use event_sink::{BroadcastEventSink, EventSink};
pub use lock::{LockGuard, LockService, MemoryLockService};
pub use store::{MemoryStore, WorkStore};
