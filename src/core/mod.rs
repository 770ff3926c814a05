//! Core domain models: tasks and the dependency graph that orders them.

pub mod graph;
pub mod task;

pub use graph::{GraphSummary, SharedGraph, TaskGraph};
pub use task::{Task, TaskId, TaskStatus};
