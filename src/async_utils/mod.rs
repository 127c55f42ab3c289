//! Asynchronous utilities for use with Tokio.
//!
//! Some of this stuff is frankly Rust magic, but it enables everything else we
//! do. We pay the complexity tax here to establish the async queue-based
//! architecture of everything else we do.

use std::pin::Pin;

use futures::{Future, Stream};
use tokio::task::JoinHandle;

use crate::prelude::*;

pub mod work;

/// A boxed future, for use in trait objects and work queues.
pub type BoxedFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A boxed stream, for use as the currency of all producer→consumer hops.
pub type BoxedStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// A handle to a background worker task.
///
/// Several components own a background task (queue drainers, sweepers). We
/// hand back a `JoinWorker` so the owner can wait for a clean shutdown, and
/// so components without a worker can return [`JoinWorker::noop`].
pub struct JoinWorker {
    handle: Option<JoinHandle<Result<()>>>,
}

impl JoinWorker {
    /// Wrap a spawned task.
    pub fn from_handle(handle: JoinHandle<Result<()>>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// A worker that has nothing to do.
    pub fn noop() -> Self {
        Self { handle: None }
    }

    /// Ask the task to stop by aborting it. Sweeper loops hold no state that
    /// needs a graceful handshake.
    pub fn abort(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }

    /// Wait for the worker to finish.
    pub async fn join(self) -> Result<()> {
        match self.handle {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(err) if err.is_cancelled() => Ok(()),
                Err(err) => Err(anyhow!("worker task panicked: {err}")),
            },
            None => Ok(()),
        }
    }
}

/// Report any command failures.
pub fn check_for_command_failure(
    command_name: &str,
    status: std::process::ExitStatus,
) -> Result<()> {
    if status.success() {
        Ok(())
    } else if let Some(exit_code) = status.code() {
        Err(anyhow!("{} failed with exit code {}", command_name, exit_code))
    } else {
        // Not all platforms have exit codes.
        Err(anyhow!("{} failed", command_name))
    }
}
