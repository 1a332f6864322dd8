//! Generic periodic task runner.
//!
//! A [`Scheduler`] owns at most one background task. `start` spawns it and runs
//! the task immediately, then once per interval. `stop` cancels the shared
//! token and waits for the background task to exit, so no task execution is in
//! flight once it returns.

use std::{future::Future, panic::AssertUnwindSafe, pin::Pin, sync::Arc, time::Duration};

use futures_util::FutureExt;
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>;

/// The periodic unit of work. Receives a token that is cancelled when the
/// scheduler stops; long-running tasks should check it between steps.
pub type Task = Arc<dyn Fn(CancellationToken) -> TaskFuture + Send + Sync>;

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    name: &'static str,
    period: Duration,
    task: Task,
    state: Mutex<Option<Running>>,
}

impl Scheduler {
    pub fn new(name: &'static str, period: Duration, task: Task) -> Self {
        Self {
            name,
            period,
            task,
            state: Mutex::new(None),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Starts the background loop. Does nothing if it is already running.
    ///
    /// Returns whether a new loop was spawned.
    pub async fn start(&self) -> bool {
        let mut state = self.state.lock().await;

        if let Some(running) = state.as_ref() {
            if !running.handle.is_finished() {
                return false;
            }
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.name,
            self.period,
            self.task.clone(),
            cancel.clone(),
        ));

        *state = Some(Running { cancel, handle });

        tracing::info!(scheduler = self.name, period = ?self.period, "Scheduler started");

        true
    }

    /// Stops the background loop and waits for it to exit. Does nothing if it
    /// is not running.
    ///
    /// Returns whether a running loop was stopped.
    pub async fn stop(&self) -> bool {
        let mut state = self.state.lock().await;

        let Some(running) = state.take() else {
            return false;
        };

        running.cancel.cancel();

        if let Err(e) = running.handle.await {
            tracing::error!(scheduler = self.name, error = %e, "Scheduler loop did not exit cleanly");
        }

        tracing::info!(scheduler = self.name, "Scheduler stopped");

        true
    }

    pub async fn is_running(&self) -> bool {
        self.state
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }
}

async fn run_loop(name: &'static str, period: Duration, task: Task, cancel: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            // The first tick completes immediately.
            _ = ticker.tick() => {
                match AssertUnwindSafe(task(cancel.clone())).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::error!(scheduler = name, error = %e, "Failed to execute task");
                    }
                    Err(_) => {
                        tracing::error!(scheduler = name, "Task panicked");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use super::*;

    fn counting_task(counter: Arc<AtomicU32>) -> Task {
        Arc::new(move |_cancel: CancellationToken| -> TaskFuture {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_start_stop() {
        let executions = Arc::new(AtomicU32::new(0));
        let scheduler = Scheduler::new(
            "test",
            Duration::from_millis(10),
            counting_task(executions.clone()),
        );

        assert!(scheduler.start().await);
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert!(scheduler.stop().await);

        let after_stop = executions.load(Ordering::SeqCst);
        assert!(after_stop >= 2, "expected at least 2 executions, got {after_stop}");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(executions.load(Ordering::SeqCst), after_stop);
        assert!(!scheduler.is_running().await);
    }

    #[tokio::test]
    async fn test_task_is_executed_immediately() {
        let executions = Arc::new(AtomicU32::new(0));
        let scheduler = Scheduler::new(
            "test",
            Duration::from_secs(3600),
            counting_task(executions.clone()),
        );

        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(executions.load(Ordering::SeqCst), 1);

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_idempotent_start() {
        let executions = Arc::new(AtomicU32::new(0));
        let scheduler = Scheduler::new(
            "test",
            Duration::from_secs(3600),
            counting_task(executions.clone()),
        );

        assert!(scheduler.start().await);
        assert!(!scheduler.start().await);
        assert!(scheduler.is_running().await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.stop().await;

        // A second loop would have run the task a second time.
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idempotent_stop() {
        let scheduler = Scheduler::new(
            "test",
            Duration::from_millis(10),
            counting_task(Arc::new(AtomicU32::new(0))),
        );

        assert!(!scheduler.stop().await);

        scheduler.start().await;
        assert!(scheduler.stop().await);
        assert!(!scheduler.stop().await);
    }

    #[tokio::test]
    async fn test_task_errors_do_not_stop_the_loop() {
        let executions = Arc::new(AtomicU32::new(0));
        let task: Task = {
            let executions = executions.clone();
            Arc::new(move |_cancel: CancellationToken| -> TaskFuture {
                let executions = executions.clone();
                Box::pin(async move {
                    if executions.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("first run blows up");
                    }
                    Err(Error::invalid_parameter("task error"))
                })
            })
        };
        let scheduler = Scheduler::new("test", Duration::from_millis(10), task);

        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(45)).await;
        assert!(scheduler.is_running().await);
        scheduler.stop().await;

        assert!(executions.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_task() {
        let started = Arc::new(tokio::sync::Notify::new());
        let finished = Arc::new(AtomicBool::new(false));

        let task: Task = {
            let started = started.clone();
            let finished = finished.clone();
            Arc::new(move |cancel: CancellationToken| -> TaskFuture {
                let started = started.clone();
                let finished = finished.clone();
                Box::pin(async move {
                    started.notify_one();
                    cancel.cancelled().await;
                    // Simulate finishing the current item after cancellation.
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    finished.store(true, Ordering::SeqCst);
                    Ok(())
                })
            })
        };
        let scheduler = Scheduler::new("test", Duration::from_secs(3600), task);

        scheduler.start().await;
        started.notified().await;

        scheduler.stop().await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_multiple_start_stop_cycles() {
        let executions = Arc::new(AtomicU32::new(0));
        let scheduler = Scheduler::new(
            "test",
            Duration::from_secs(3600),
            counting_task(executions.clone()),
        );

        for cycle in 1..=3 {
            assert!(scheduler.start().await);
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(scheduler.stop().await);
            assert_eq!(executions.load(Ordering::SeqCst), cycle);
        }
    }
}
