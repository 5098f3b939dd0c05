//! Asynchronous utilities for use with Tokio.
//!
//! Everything that talks to an external binary funnels through here, so the
//! "did the child process actually succeed" logic lives in exactly one place.

use std::process::Output;

use crate::prelude::*;

/// A boxed future, for use in trait objects and stored state.
pub type BoxedFuture<T> = futures::future::BoxFuture<'static, T>;

/// A boxed stream, for use in trait objects and stored state.
pub type BoxedStream<T> = futures::stream::BoxStream<'static, T>;

/// Report any command failures, including a bounded slice of stderr.
pub fn check_for_command_failure(
    command_name: &str,
    output: &Output,
) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr_tail = tail_lines(&stderr, 8);
    if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {}: {}",
            command_name,
            exit_code,
            stderr_tail
        ))
    } else {
        // Not all platforms have exit codes.
        Err(anyhow!("{} failed: {}", command_name, stderr_tail))
    }
}

/// Keep only the last `n` lines of a string, for error messages and logs.
pub fn tail_lines(s: &str, n: usize) -> String {
    let lines = s.lines().collect::<Vec<_>>();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        // Propagate any panics from the blocking task.
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_lines_keeps_only_the_tail() {
        let s = "a\nb\nc\nd";
        assert_eq!(tail_lines(s, 2), "c\nd");
        assert_eq!(tail_lines(s, 10), s);
    }
}
