//! Structured logging for baton runs.
//!
//! Log levels:
//! - ERROR: Failures that halt a run (environment, publish, fatal transitions)
//! - WARN: Recoverable conditions (worker warnings, best-effort steps failing)
//! - INFO: Run lifecycle (dispatch, completion, gate results, finalization)
//! - DEBUG: Poll ticks, git operations, command lines
//! - TRACE: Raw worker output snapshots
//!
//! Everything is written to `~/.baton/baton.log`; warnings and errors are also
//! echoed to stderr. Debug mode is enabled with `--debug` or `BATON_DEBUG=1`,
//! and `BATON_LOG` accepts a full `EnvFilter` directive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

pub const LOG_ENV: &str = "BATON_LOG";
pub const DEBUG_ENV: &str = "BATON_DEBUG";

/// Initialize logging with default (info) verbosity.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .compact()
        .with_target(false)
        .with_filter(LevelFilter::WARN);

    let file_layer = dirs::home_dir().and_then(|home| {
        let dir = home.join(".baton");
        std::fs::create_dir_all(&dir).ok()?;
        let appender = tracing_appender::rolling::never(dir, "baton.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        FILE_GUARD.set(guard).ok()?;
        Some(fmt::layer().with_writer(writer).with_ansi(false))
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "baton=debug,info"
    } else {
        "baton=info,warn"
    }
}
