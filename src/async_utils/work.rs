//! Async item processing with backpressure.
//!
//! The key concepts here are borrowed from ["Queues Don't Fix
//! Overload"](https://ferd.ca/queues-don-t-fix-overload.html). In order to
//! prevent overflow, we limit the number of work items that may be "in flight"
//! at any one time, and once that limit is reached, trying to submit more items
//! for processing will block until one of the in-flight items is completed.
//!
//! Note that this is a strictly "in process" queue meant for closely-related
//! subtasks of a larger task. It does not attempt to handle priorities or
//! starvation, so it is not appropriate for servers handling requests from
//! multiple unrelated clients.

use std::sync::Arc;

use futures::{
    FutureExt, SinkExt as _, StreamExt,
    channel::{mpsc, oneshot},
};

use super::{BoxedFuture, BoxedStream, JoinWorker};
use crate::prelude::*;

/// Work items are processed by a [`WorkQueue`]. They contain an input, and a
/// one-shot channel on which to return the result.
#[derive(Debug)]
pub struct WorkItem<Input, Output> {
    /// The input to the work item.
    pub input: Input,

    /// The one-shot channel on which to return the result.
    pub tx: oneshot::Sender<Result<Output>>,
}

/// An async work function.
pub type WorkFn<Input, Output> =
    Arc<dyn Fn(Input) -> BoxedFuture<Result<Output>> + Send + Sync + 'static>;

/// A handle to a [`WorkQueue`].
///
/// This is basically just a wrapper around a [`mpsc::Sender`]. It can be
/// cloned cheaply and passed around.
pub struct WorkQueueHandle<Input, Output> {
    /// Our sender.
    tx: mpsc::Sender<WorkItem<Input, Output>>,
}

impl<Input, Output> WorkQueueHandle<Input, Output>
where
    Input: Send + 'static,
    Output: Send + 'static,
{
    /// Process an input and wait for the output.
    ///
    /// This should normally only block if our processing capacity has been
    /// maxed out.
    pub async fn process_blocking(&self, input: Input) -> Result<Output> {
        let (tx, rx) = oneshot::channel();
        let item = WorkItem { input, tx };
        // We need a mutable copy of `tx` to send the item, so we clone it.
        let mut sender = self.tx.clone();
        sender.send(item).await.context("failed to send work item")?;
        match rx.await.context("failed to receive work item result") {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(err),
            Err(err) => Err(err),
        }
    }

    /// Process a stream of inputs, returning a stream of futures that will
    /// yield outputs. Typically used with [`futures::StreamExt::buffered`] or
    /// [`futures::StreamExt::buffer_unordered`] to resolve the futures,
    /// yielding a stream of outputs.
    ///
    /// You can use pretty much whatever concurrency you find appropriate when
    /// calling `buffered` or `buffer_unordered`, but the underlying
    /// concurrency limit on the [`WorkQueue`] will still be enforced normally.
    pub fn process_stream(
        &self,
        input: BoxedStream<Input>,
    ) -> BoxedStream<BoxedFuture<Result<Output>>> {
        let handle = self.clone();
        input
            .map(move |input| {
                let handle = handle.clone();
                async move { handle.process_blocking(input).await }.boxed()
            })
            .boxed()
    }
}

// Override `Clone` so that `Input` and `Output` are not required to be `Clone`.
impl<Input, Output> Clone for WorkQueueHandle<Input, Output> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// A bounded queue that processes work items in parallel.
///
/// We maintain backpressure by limiting the number of work items queued, and
/// the number currently being processed.
pub struct WorkQueue<Input, Output> {
    /// Queue for submitting work items.
    tx: mpsc::Sender<WorkItem<Input, Output>>,
}

impl<Input, Output> WorkQueue<Input, Output>
where
    Input: Send + 'static,
    Output: Send + 'static,
{
    /// Create a new work queue with the given concurrency limit.
    ///
    /// Note that up to `concurrency_limit` work may be waiting at any one
    /// time, and another `concurrency_limit` work items may be in progress.
    /// This means that the total number of work items in the system at any
    /// time may be up to `2 * concurrency_limit`.
    pub fn new(
        concurrency_limit: usize,
        work_fn: WorkFn<Input, Output>,
    ) -> (Self, JoinWorker) {
        let (tx, rx) = mpsc::channel(concurrency_limit);
        let worker = tokio::spawn(async move {
            rx.for_each_concurrent(
                concurrency_limit,
                |item: WorkItem<Input, Output>| async {
                    let result = work_fn(item.input).await;
                    if let Err(_unsent) = item.tx.send(result) {
                        debug!(
                            "failed to send work item result because receiver was dropped"
                        );
                    }
                },
            )
            .await;
            Ok(())
        });
        (Self { tx }, JoinWorker::from_handle(worker))
    }

    /// Get a handle for submitting items to the work queue.
    pub fn handle(&self) -> WorkQueueHandle<Input, Output> {
        WorkQueueHandle {
            tx: self.tx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt as _;

    use super::*;

    #[tokio::test]
    async fn work_queue_processes_items_and_preserves_errors() {
        let work_fn: WorkFn<u32, u32> = Arc::new(|n: u32| {
            async move {
                if n == 13 {
                    Err(anyhow!("unlucky"))
                } else {
                    Ok(n * 2)
                }
            }
            .boxed()
        });
        let (queue, worker) = WorkQueue::new(2, work_fn);
        let handle = queue.handle();

        assert_eq!(handle.process_blocking(21).await.unwrap(), 42);
        assert!(handle.process_blocking(13).await.is_err());

        drop(queue);
        drop(handle);
        worker.join().await.unwrap();
    }
}
