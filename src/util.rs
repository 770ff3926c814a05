//! Shared utility functions.

use std::time::Duration;

use tokio::task::spawn_blocking;
use tokio::time::timeout;

use crate::{Error, Result};

/// Maximum number of characters kept from captured command output.
pub const OUTPUT_TAIL_CHARS: usize = 4000;

/// Run a blocking closure (git2, filesystem walks) on the blocking pool.
///
/// ```
/// # tokio_test::block_on(async {
/// let n = baton::util::blocking(|| Ok(2 + 2)).await?;
/// assert_eq!(n, 4);
/// # Ok::<(), baton::Error>(())
/// # }).unwrap();
/// ```
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

pub async fn blocking_with_timeout<F, T>(duration: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match timeout(duration, spawn_blocking(f)).await {
        Ok(Ok(inner)) => inner,
        Ok(Err(join_err)) => Err(Error::TaskJoin(join_err.to_string())),
        Err(_) => Err(Error::Timeout(duration)),
    }
}

/// Reduce a name to `[A-Za-z0-9_-]`, replacing everything else with `-`.
///
/// Used for slugs, branch suffixes and tmux session names.
pub fn sanitize_name(s: &str) -> String {
    let sanitized: String = s
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    sanitized.trim_matches('-').to_string()
}

/// Keep the last `max_chars` characters of captured output.
pub fn tail(output: &str, max_chars: usize) -> String {
    let count = output.chars().count();
    if count <= max_chars {
        return output.to_string();
    }
    output.chars().skip(count - max_chars).collect()
}

pub fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.' || c == '/')
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
