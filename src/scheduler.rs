//! Recurring task driver
//!
//! Each registered task runs on its own interval in a spawned loop. A task
//! body never overlaps another invocation of the same task. A failed
//! summarize run gets exactly one delayed retry. `stop()` flips a shutdown
//! flag that every loop and pending retry observes; bodies already running
//! finish on their own.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex as TaskLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;

/// A unit of recurring work
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduledTask {
    Harvest,
    Summarize,
    Post,
}

impl ScheduledTask {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Harvest => "harvest",
            Self::Summarize => "summarize",
            Self::Post => "post",
        }
    }

    /// Whether a failure schedules one delayed retry
    fn retries_once(&self) -> bool {
        matches!(self, Self::Summarize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Clone)]
struct TaskEntry {
    task: ScheduledTask,
    job: Arc<dyn Job>,
    interval: Duration,
    lock: Arc<TaskLock<()>>,
}

struct Runtime {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub struct Scheduler {
    tasks: Vec<TaskEntry>,
    retry_delay: Duration,
    run_on_start: bool,
    state: Mutex<SchedulerState>,
    runtime: Mutex<Option<Runtime>>,
}

impl Scheduler {
    pub fn new(retry_delay: Duration, run_on_start: bool) -> Self {
        Self {
            tasks: Vec::new(),
            retry_delay,
            run_on_start,
            state: Mutex::new(SchedulerState::Idle),
            runtime: Mutex::new(None),
        }
    }

    /// The three pipeline tasks on their configured cadences
    pub fn from_config(
        config: &SchedulerConfig,
        harvest: Arc<dyn Job>,
        summarize: Arc<dyn Job>,
        post: Arc<dyn Job>,
    ) -> Self {
        let mut scheduler = Self::new(config.summarize_retry_delay(), config.run_on_start);
        scheduler.register(
            ScheduledTask::Harvest,
            harvest,
            Duration::from_secs(config.harvest_interval_seconds),
        );
        scheduler.register(
            ScheduledTask::Summarize,
            summarize,
            Duration::from_secs(config.summarize_interval_seconds),
        );
        scheduler.register(
            ScheduledTask::Post,
            post,
            Duration::from_secs(config.post_interval_seconds),
        );
        scheduler
    }

    pub fn register(&mut self, task: ScheduledTask, job: Arc<dyn Job>, interval: Duration) {
        self.tasks.push(TaskEntry {
            task,
            job,
            interval,
            lock: Arc::new(TaskLock::new(())),
        });
    }

    pub fn state(&self) -> SchedulerState {
        self.state.lock().map(|s| *s).unwrap_or(SchedulerState::Stopped)
    }

    pub fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    /// Spawn one loop per task; a no-op when already running
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let (Ok(mut state), Ok(mut runtime)) = (self.state.lock(), self.runtime.lock()) else {
            error!("Scheduler state lock poisoned; not starting");
            return;
        };
        if *state == SchedulerState::Running {
            debug!("Scheduler already running");
            return;
        }

        let (shutdown, _) = watch::channel(false);
        let handles = self
            .tasks
            .iter()
            .map(|entry| {
                let entry = entry.clone();
                let shutdown_rx = shutdown.subscribe();
                let retry_delay = self.retry_delay;
                let run_on_start = self.run_on_start;
                tokio::spawn(run_loop(entry, shutdown_rx, retry_delay, run_on_start))
            })
            .collect();

        *runtime = Some(Runtime { shutdown, handles });
        *state = SchedulerState::Running;
        info!("Scheduler started with {} tasks", self.tasks.len());
    }

    /// Stop issuing new invocations; a no-op when not running
    pub fn stop(&self) {
        let (Ok(mut state), Ok(runtime)) = (self.state.lock(), self.runtime.lock()) else {
            error!("Scheduler state lock poisoned; cannot stop cleanly");
            return;
        };
        if *state != SchedulerState::Running {
            return;
        }
        if let Some(runtime) = runtime.as_ref() {
            runtime.shutdown.send_replace(true);
        }
        *state = SchedulerState::Stopped;
        info!("Scheduler stopped");
    }

    /// Wait for every task loop to exit after `stop()`
    pub async fn join(&self) {
        let handles = match self.runtime.lock() {
            Ok(mut runtime) => runtime
                .as_mut()
                .map(|r| std::mem::take(&mut r.handles))
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Scheduler task ended abnormally: {}", e);
            }
        }
    }
}

async fn run_loop(entry: TaskEntry, mut shutdown: watch::Receiver<bool>, retry_delay: Duration, run_on_start: bool) {
    let period = entry.interval.max(Duration::from_millis(1));
    let first = if run_on_start {
        Instant::now()
    } else {
        Instant::now() + period
    };
    let mut ticker = tokio::time::interval_at(first, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        let Ok(guard) = entry.lock.clone().try_lock_owned() else {
            warn!("Task '{}' still running; skipping this tick", entry.task.name());
            continue;
        };

        let succeeded = invoke(&entry).await;
        drop(guard);

        if !succeeded && entry.task.retries_once() {
            tokio::spawn(retry_once(entry.clone(), shutdown.clone(), retry_delay));
        }
    }
    debug!("Task loop '{}' exited", entry.task.name());
}

async fn invoke(entry: &TaskEntry) -> bool {
    let started = Instant::now();
    info!("Running task '{}'", entry.task.name());
    match entry.job.run().await {
        Ok(()) => {
            info!("Task '{}' finished in {:?}", entry.task.name(), started.elapsed());
            true
        }
        Err(e) => {
            error!("Task '{}' failed: {:#}", entry.task.name(), e);
            false
        }
    }
}

async fn retry_once(entry: TaskEntry, mut shutdown: watch::Receiver<bool>, delay: Duration) {
    info!("Retrying task '{}' in {:?}", entry.task.name(), delay);
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = shutdown.changed() => return,
    }
    if *shutdown.borrow() {
        return;
    }

    let _guard = entry.lock.lock().await;
    if *shutdown.borrow() {
        return;
    }
    if !invoke(&entry).await {
        warn!("Retry of task '{}' failed; waiting for the next interval", entry.task.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingJob {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail: bool,
        work: Duration,
    }

    #[async_trait]
    impl Job for CountingJob {
        async fn run(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.work.is_zero() {
                tokio::time::sleep(self.work).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("job failed");
            }
            Ok(())
        }
    }

    fn calls(job: &CountingJob) -> usize {
        job.calls.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_runs_on_cadence_until_stopped() {
        let job = Arc::new(CountingJob::default());
        let mut scheduler = Scheduler::new(Duration::from_secs(60), true);
        scheduler.register(ScheduledTask::Harvest, job.clone(), Duration::from_millis(20));

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(110)).await;
        scheduler.stop();
        scheduler.join().await;

        let after_stop = calls(&job);
        assert!(after_stop >= 2, "ran {} times", after_stop);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(calls(&job), after_stop);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let job = Arc::new(CountingJob::default());
        let mut scheduler = Scheduler::new(Duration::from_secs(60), true);
        scheduler.register(ScheduledTask::Post, job.clone(), Duration::from_secs(3600));

        scheduler.stop();
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        scheduler.start();
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls(&job), 1, "a second start must not spawn more loops");

        scheduler.stop();
        scheduler.stop();
        scheduler.join().await;
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_no_initial_run_without_run_on_start() {
        let job = Arc::new(CountingJob::default());
        let mut scheduler = Scheduler::new(Duration::from_secs(60), false);
        scheduler.register(ScheduledTask::Harvest, job.clone(), Duration::from_secs(3600));

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.stop();
        scheduler.join().await;
        assert_eq!(calls(&job), 0);
    }

    #[tokio::test]
    async fn test_failed_summarize_retries_exactly_once() {
        let job = Arc::new(CountingJob {
            fail: true,
            ..CountingJob::default()
        });
        let mut scheduler = Scheduler::new(Duration::from_millis(20), true);
        scheduler.register(ScheduledTask::Summarize, job.clone(), Duration::from_secs(3600));

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.stop();
        scheduler.join().await;
        assert_eq!(calls(&job), 2);
    }

    #[tokio::test]
    async fn test_failed_harvest_is_not_retried() {
        let job = Arc::new(CountingJob {
            fail: true,
            ..CountingJob::default()
        });
        let mut scheduler = Scheduler::new(Duration::from_millis(10), true);
        scheduler.register(ScheduledTask::Harvest, job.clone(), Duration::from_secs(3600));

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop();
        scheduler.join().await;
        assert_eq!(calls(&job), 1);
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_retry() {
        let job = Arc::new(CountingJob {
            fail: true,
            ..CountingJob::default()
        });
        let mut scheduler = Scheduler::new(Duration::from_millis(300), true);
        scheduler.register(ScheduledTask::Summarize, job.clone(), Duration::from_secs(3600));

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.stop();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(calls(&job), 1);
    }

    #[tokio::test]
    async fn test_same_task_never_overlaps() {
        let job = Arc::new(CountingJob {
            work: Duration::from_millis(40),
            fail: true,
            ..CountingJob::default()
        });
        let mut scheduler = Scheduler::new(Duration::from_millis(5), true);
        scheduler.register(ScheduledTask::Summarize, job.clone(), Duration::from_millis(10));

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(250)).await;
        scheduler.stop();
        scheduler.join().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(calls(&job) >= 2);
        assert_eq!(job.max_in_flight.load(Ordering::SeqCst), 1);
    }
}
