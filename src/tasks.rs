//! Task Runner: a fan-out queue of deferred, delayable units of work.
//!
//! Grounded on `tasks.py`: a single bounded `trio.open_memory_channel(50)`
//! drained by one loop that `start_soon`s a fresh nursery task per dequeued
//! item, so a failing task never blocks or kills the queue. The tokio
//! analogue here is an `mpsc::channel(50)` drained by a loop that
//! `tokio::spawn`s a worker per task.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, info};

/// One deferred unit of work. Implementors may enqueue further tasks from
/// within `execute` by holding a clone of the [`TaskSender`] they were given
/// at construction time.
#[async_trait]
pub trait Task: Send + Sync + fmt::Debug {
    /// Approximate delay, in seconds, before this task should run.
    fn delay(&self) -> u64 {
        0
    }

    /// Process-bring-up tasks set this so a failure aborts startup instead
    /// of being merely logged.
    fn re_raise_exceptions(&self) -> bool {
        false
    }

    async fn execute(self: Box<Self>) -> Result<(), String>;
}

pub type TaskSender = mpsc::Sender<Box<dyn Task>>;

/// Handle to the running task queue. Clone and pass to anything that needs
/// to enqueue work; dropping every clone (and the runner's own receiver)
/// ends the drain loop.
#[derive(Clone)]
pub struct TaskRunner {
    sender: TaskSender,
}

impl TaskRunner {
    const CHANNEL_CAPACITY: usize = 50;

    /// Builds a runner and spawns its drain loop. Returns the runner handle;
    /// the drain loop itself runs for the lifetime of the process.
    pub fn spawn() -> Self {
        let (sender, receiver) = mpsc::channel(Self::CHANNEL_CAPACITY);
        tokio::spawn(Self::drain_loop(receiver));
        Self { sender }
    }

    pub fn sender(&self) -> TaskSender {
        self.sender.clone()
    }

    pub async fn enqueue(&self, task: Box<dyn Task>) {
        if self.sender.send(task).await.is_err() {
            error!("task runner receiver dropped; task queue is shut down");
        }
    }

    async fn drain_loop(mut receiver: mpsc::Receiver<Box<dyn Task>>) {
        while let Some(task) = receiver.recv().await {
            info!(task = ?task, "dequeued task");
            tokio::spawn(Self::run_one(task));
        }
    }

    async fn run_one(task: Box<dyn Task>) {
        let delay = task.delay();
        if delay > 0 {
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }

        let re_raise = task.re_raise_exceptions();
        let label = format!("{task:?}");
        if let Err(reason) = task.execute().await {
            error!(task = %label, %reason, "task execution failed");
            if re_raise {
                panic!("task '{label}' failed during process bring-up: {reason}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct CountingTask {
        counter: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Task for CountingTask {
        async fn execute(self: Box<Self>) -> Result<(), String> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err("boom".to_string());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn a_failing_task_does_not_stop_the_queue() {
        let runner = TaskRunner::spawn();
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            runner
                .enqueue(Box::new(CountingTask { counter: counter.clone(), fail: i == 2 }))
                .await;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }
}
