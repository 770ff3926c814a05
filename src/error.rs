use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Tmux error: {0}")]
    Tmux(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Plan parse error in {path}: {message}")]
    PlanParse { path: String, message: String },

    #[error("Cannot resolve plan '{reference}': {reason}")]
    Resolution { reference: String, reason: String },

    #[error("Adding task {task} would create a dependency cycle")]
    Cycle { task: String },

    #[error("Task {0} already exists in the graph")]
    DuplicateTask(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Illegal transition for task {task}: {from} -> {to}")]
    IllegalTransition {
        task: String,
        from: String,
        to: String,
    },

    #[error("Environment already exists for plan '{0}'")]
    EnvironmentExists(String),

    #[error("Dispatch failed for task {task}: {message}")]
    Dispatch { task: String, message: String },

    #[error("Worker for task {task} silent for {silent_secs}s")]
    StallTimeout { task: String, silent_secs: i64 },

    #[error("Gate '{gate}' failed: {summary}")]
    GateFailure { gate: String, summary: String },

    #[error("Finalization failed: {0}")]
    Finalization(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Exit code for the CLI: 1 for gate failures, 2 for resolution and
    /// validation problems, 3 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::GateFailure { .. } => 1,
            Error::Resolution { .. }
            | Error::Cycle { .. }
            | Error::DuplicateTask(_)
            | Error::Validation(_)
            | Error::PlanParse { .. } => 2,
            _ => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
