//! Bounded, cooperative, first-error-cancelling fan-out (C4).
//!
//! A single producer task feeds a bounded item list to `worker_count`
//! concurrent workers over a shared task queue; each worker applies a
//! per-task timeout and reports one [`TaskOutcome`] per task it pulls,
//! except for the benign [`TaskOutcome::Skipped`] sentinel. This crate only
//! provides the mechanism -- deciding when an outcome is job-fatal, firing
//! the cancellation token, and compensating rollback are the job
//! coordinator's job (C6), since only it knows which outcomes require
//! cleanup.

use std::sync::Arc;

use async_trait::async_trait;
use errors::ErrorMetadata;
use tokio::sync::{
    mpsc,
    Mutex,
};
use tokio_util::sync::CancellationToken;

mod metrics;

/// Implemented once per job kind (today: entry extraction) and shared across
/// all of that job's workers.
#[async_trait]
pub trait PoolTask: Send + Sync + 'static {
    type Item: Send + 'static;
    type Success: Send + 'static;

    async fn process(&self, item: Self::Item) -> TaskOutcome<Self::Success>;
}

/// What a worker reports for one task. `Skipped` is the benign sentinel from
/// §4.4: the worker moves on to the next task without emitting a failure or
/// tripping cancellation.
pub enum TaskOutcome<S> {
    Success(S),
    Skipped,
    Failed(anyhow::Error),
}

impl<S> TaskOutcome<S> {
    pub fn is_failed(&self) -> bool {
        matches!(self, TaskOutcome::Failed(_))
    }
}

/// Spawns the producer and `worker_count` workers, returning the channel the
/// caller drains for results. The channel closes once every worker has
/// exited (either having drained the task queue, or having stopped after a
/// failed task), which the caller observes via `recv()` returning `None` --
/// that's the "coordinator keeps draining until all workers have signalled
/// completion" rule from §4.4.
pub fn spawn<T: PoolTask>(
    task: Arc<T>,
    items: Vec<T::Item>,
    worker_count: usize,
    per_task_timeout: Option<std::time::Duration>,
    cancel: CancellationToken,
) -> mpsc::Receiver<TaskOutcome<T::Success>> {
    let worker_count = worker_count.max(1);
    let (item_tx, item_rx) = mpsc::channel::<T::Item>(worker_count);
    let (result_tx, result_rx) = mpsc::channel(worker_count * 2);
    metrics::set_worker_count(worker_count);

    let producer_cancel = cancel.clone();
    tokio::spawn(async move {
        for item in items {
            if producer_cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                biased;
                _ = producer_cancel.cancelled() => break,
                send_result = item_tx.send(item) => {
                    if send_result.is_err() {
                        break;
                    }
                },
            }
        }
        // Dropping `item_tx` here signals "no more tasks" to every worker.
    });

    let item_rx = Arc::new(Mutex::new(item_rx));
    for _ in 0..worker_count {
        let task = task.clone();
        let item_rx = item_rx.clone();
        let result_tx = result_tx.clone();
        let worker_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                if worker_cancel.is_cancelled() {
                    break;
                }
                let item = {
                    let mut rx = item_rx.lock().await;
                    rx.recv().await
                };
                let Some(item) = item else { break };

                let outcome = match per_task_timeout {
                    Some(d) => match tokio::time::timeout(d, task.process(item)).await {
                        Ok(outcome) => outcome,
                        Err(_) => TaskOutcome::Failed(anyhow::Error::new(ErrorMetadata::extract_error(
                            format!("entry upload timed out after {d:?}"),
                        ))),
                    },
                    None => task.process(item).await,
                };

                let is_failure = outcome.is_failed();
                if is_failure {
                    metrics::log_task_failed();
                } else {
                    metrics::log_task_completed();
                }
                if result_tx.send(outcome).await.is_err() {
                    break;
                }
                if is_failure {
                    // §4.4: a worker terminates itself after a non-benign failure.
                    break;
                }
            }
        });
    }

    result_rx
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{
            AtomicUsize,
            Ordering,
        },
        time::Duration,
    };

    use super::*;

    struct Echo {
        started: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PoolTask for Echo {
        type Item = u32;
        type Success = u32;

        async fn process(&self, item: Self::Item) -> TaskOutcome<Self::Success> {
            self.started.fetch_add(1, Ordering::SeqCst);
            if item == 3 {
                TaskOutcome::Failed(anyhow::anyhow!("boom"))
            } else if item == 99 {
                TaskOutcome::Skipped
            } else {
                TaskOutcome::Success(item)
            }
        }
    }

    #[tokio::test]
    async fn all_successes_are_drained() {
        let task = Arc::new(Echo {
            started: Arc::new(AtomicUsize::new(0)),
        });
        let mut rx = spawn(task, vec![1, 2, 4, 5], 2, None, CancellationToken::new());
        let mut got = Vec::new();
        while let Some(outcome) = rx.recv().await {
            match outcome {
                TaskOutcome::Success(v) => got.push(v),
                _ => panic!("unexpected outcome"),
            }
        }
        got.sort();
        assert_eq!(got, vec![1, 2, 4, 5]);
    }

    #[tokio::test]
    async fn skip_does_not_emit_a_result() {
        let task = Arc::new(Echo {
            started: Arc::new(AtomicUsize::new(0)),
        });
        let mut rx = spawn(task, vec![99, 1], 1, None, CancellationToken::new());
        let mut results = Vec::new();
        while let Some(outcome) = rx.recv().await {
            results.push(matches!(outcome, TaskOutcome::Success(_)));
        }
        assert_eq!(results, vec![true]);
    }

    #[tokio::test]
    async fn failure_cancels_producer_but_drains_fully() {
        let task = Arc::new(Echo {
            started: Arc::new(AtomicUsize::new(0)),
        });
        let cancel = CancellationToken::new();
        let mut rx = spawn(task, vec![1, 2, 3, 4, 5], 1, None, cancel.clone());
        let mut saw_failure = false;
        let mut successes = 0;
        while let Some(outcome) = rx.recv().await {
            match outcome {
                TaskOutcome::Failed(_) => {
                    saw_failure = true;
                    cancel.cancel();
                },
                TaskOutcome::Success(_) => successes += 1,
                TaskOutcome::Skipped => {},
            }
        }
        assert!(saw_failure);
        // With a single worker consuming in order, items 1 and 2 succeed
        // before the failing item 3 stops that worker.
        assert_eq!(successes, 2);
    }

    #[tokio::test]
    async fn per_task_timeout_reports_a_distinguishable_failure() {
        struct Slow;
        #[async_trait]
        impl PoolTask for Slow {
            type Item = ();
            type Success = ();

            async fn process(&self, _item: ()) -> TaskOutcome<()> {
                tokio::time::sleep(Duration::from_secs(10)).await;
                TaskOutcome::Success(())
            }
        }
        let mut rx = spawn(
            Arc::new(Slow),
            vec![()],
            1,
            Some(Duration::from_millis(10)),
            CancellationToken::new(),
        );
        let outcome = rx.recv().await.expect("one outcome");
        match outcome {
            TaskOutcome::Failed(e) => assert!(e.to_string().contains("timed out")),
            _ => panic!("expected timeout failure"),
        }
    }
}
