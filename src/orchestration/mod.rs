//! Orchestration layer for baton.
//!
//! Workers are reached through the [`WorkerRuntime`] capability and driven by
//! the [`Dispatcher`]; the [`HealthMonitor`] watches their output and
//! escalates stalls; the [`GatePipeline`] checks the settled run and the
//! [`Finalizer`] publishes it. [`Orchestrator`] composes all of them into the
//! run loop.

pub mod dispatcher;
pub mod finalizer;
pub mod gates;
pub mod health;
pub mod orchestrator;
pub mod worker;

pub use dispatcher::{DispatchConfig, Dispatcher};
pub use finalizer::{CascadeReport, FinalizeOutcome, Finalizer, LogTracker, Tracker};
pub use gates::{CommandOutput, GateCommands, GatePipeline, GateReport, GateResult, ShellGates};
pub use health::{HealthAction, HealthConfig, HealthMonitor, HealthReport, HealthStatus};
pub use orchestrator::{Orchestrator, RunReport, RunSettings, RunStatus};
pub use worker::{
    Invocation, TerminalStatus, TmuxRuntime, WorkerHandle, WorkerPoll, WorkerRequest,
    WorkerRuntime,
};
