pub mod config;
pub mod core;
pub mod docs;
pub mod error;
pub mod git;
pub mod log;
pub mod orchestration;
pub mod plan;
pub mod state;
pub mod tmux;
pub mod util;
pub mod vcs;
pub mod workspace;

pub use error::{Error, Result};
pub use plan::Plan;
