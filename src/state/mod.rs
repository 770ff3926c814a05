//! Run state persisted between orchestrator processes.
//!
//! A crashed or interrupted run can be rehydrated from its record: the graph
//! snapshot and the table of live worker handles are enough to resume polling
//! instead of dispatching again.

mod record;
mod store;

pub use record::{RunId, RunPhase, RunRecord};
pub use store::{RunLock, RunStore};
