//! Recurring execution of one collection routine.
//!
//! An [`AsyncJob`] decouples a collection routine from the cadence of the
//! check that owns it. The check calls [`AsyncJob::run_job_loop`] on every
//! invocation; the job either runs the routine inline (`run_sync`) or makes
//! sure a loop is running on the shared [`WorkerPool`]. The loop keeps
//! running the routine under the job's rate limit and minimum interval until
//! it is cancelled or the check stops calling it.
//!
//! ```text
//!   Idle ──run_job_loop──▶ Running ──cancel()──────────▶ Stopped(Cancelled)
//!                            │  ▲
//!              no check runs │  │ run_job_loop
//!                            ▼  │
//!                     Stopped(Inactive)
//! ```
//!
//! Routine failures never leave the loop: expected errors are logged as
//! warnings, unexpected errors and panics as errors, each with its own
//! diagnostic counter.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::cache::RateLimitingTtlCache;
use crate::cancel::CancellationToken;
use crate::config::JobConfig;
use crate::diagnostics::MetricsSink;
use crate::error::{ConfigError, SchedulerError};
use crate::limiter::ConstantRateLimiter;
use crate::pool::WorkerPool;

/// A collection routine driven by an [`AsyncJob`].
pub trait JobRoutine: Send + 'static {
    type Error: std::error::Error + Send + 'static;

    /// Performs one collection, including all I/O and metric submission.
    fn run(&mut self, ctx: &RunContext) -> Result<(), Self::Error>;

    /// Whether `err` is a known, transient failure of the monitored system.
    fn is_expected(&self, _err: &Self::Error) -> bool {
        false
    }

    /// Called exactly once when a job loop terminates.
    fn shutdown(&mut self) {}
}

/// Per-run information handed to a routine.
#[derive(Debug, Clone)]
pub struct RunContext {
    tags: Vec<String>,
    cancel: CancellationToken,
}

impl RunContext {
    /// The check's tags plus `job:<name>`.
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// True once the job has been cancelled; long routines may bail out early.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Why a job loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    Inactive,
}

/// Lifecycle state of an [`AsyncJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
    Stopped(StopReason),
}

enum RunOutcome {
    Ok,
    Expected(String),
    Unexpected(String),
    Panicked,
}

struct Status {
    state: JobState,
    cancel: CancellationToken,
    tags: Vec<String>,
    last_check_run: Instant,
    last_run_start: Option<Instant>,
    run_in_progress: bool,
}

struct Shared<R> {
    config: JobConfig,
    sink: Arc<dyn MetricsSink>,
    routine: Mutex<R>,
    status: Mutex<Status>,
    stopped: Condvar,
    limiter: ConstantRateLimiter,
    sync_limiter: Mutex<ConstantRateLimiter>,
    missed_collection: RateLimitingTtlCache<()>,
}

/// Scheduler for one collection routine.
///
/// Dropping the job cancels its loop.
pub struct AsyncJob<R: JobRoutine> {
    shared: Arc<Shared<R>>,
    pool: Option<Arc<WorkerPool>>,
}

impl<R: JobRoutine> AsyncJob<R> {
    /// Creates an idle job. Fails on invalid configuration.
    pub fn new(
        config: JobConfig,
        routine: R,
        sink: Arc<dyn MetricsSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let limiter = ConstantRateLimiter::new(config.rate_limit)?;
        let missed_collection = RateLimitingTtlCache::new(1, config.missed_collection_cooldown())?;
        let tags = vec![format!("job:{}", config.job_name)];
        Ok(Self {
            shared: Arc::new(Shared {
                sync_limiter: Mutex::new(limiter.clone()),
                limiter,
                missed_collection,
                sink,
                routine: Mutex::new(routine),
                status: Mutex::new(Status {
                    state: JobState::Idle,
                    cancel: CancellationToken::new(),
                    tags,
                    last_check_run: Instant::now(),
                    last_run_start: None,
                    run_in_progress: false,
                }),
                stopped: Condvar::new(),
                config,
            }),
            pool: None,
        })
    }

    /// Runs the loop on `pool` instead of the process-wide pool.
    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn config(&self) -> &JobConfig {
        &self.shared.config
    }

    pub fn state(&self) -> JobState {
        self.shared.status().state
    }

    /// Signals that the owning check ran, and makes sure the routine runs.
    ///
    /// Disabled jobs do nothing. Synchronous jobs run the routine inline if
    /// the rate limit allows it. Otherwise a loop is started on the pool
    /// unless one is already running; a cancelled job stays stopped.
    pub fn run_job_loop(&self, tags: &[String]) -> Result<(), SchedulerError> {
        let config = &self.shared.config;
        if !config.enabled {
            debug!(job = %config.job_name, "job disabled, not running");
            return Ok(());
        }

        let job_tags: Vec<String> = tags
            .iter()
            .cloned()
            .chain(std::iter::once(format!("job:{}", config.job_name)))
            .collect();

        if config.run_sync {
            {
                let mut status = self.shared.status();
                if status.state == JobState::Stopped(StopReason::Cancelled) {
                    return Ok(());
                }
                status.last_check_run = Instant::now();
                status.tags = job_tags;
            }
            self.shared.run_sync();
            return Ok(());
        }

        let pool = match &self.pool {
            Some(pool) => Arc::clone(pool),
            None => WorkerPool::global()?,
        };

        let previous = {
            let mut status = self.shared.status();
            let now = Instant::now();
            status.last_check_run = now;
            status.tags = job_tags;
            let previous = status.state;
            match previous {
                JobState::Running => {
                    let missed = self.shared.missed_collection_elapsed(&status, now);
                    drop(status);
                    if let Some(elapsed) = missed {
                        self.shared.report_missed_collection(elapsed);
                    }
                    return Ok(());
                }
                JobState::Stopped(StopReason::Cancelled) => {
                    debug!(job = %config.job_name, "job cancelled, not restarting");
                    return Ok(());
                }
                JobState::Idle | JobState::Stopped(StopReason::Inactive) => {}
            }
            status.state = JobState::Running;
            status.cancel = CancellationToken::new();
            previous
        };

        let shared = Arc::clone(&self.shared);
        if let Err(e) = pool.submit(move || shared.job_loop()) {
            self.shared.status().state = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Requests the loop to stop. Idempotent and safe from any thread.
    ///
    /// An in-flight run is not interrupted; the loop stops before the next one.
    pub fn cancel(&self) {
        let mut status = self.shared.status();
        status.cancel.cancel();
        match status.state {
            JobState::Running => {}
            JobState::Idle | JobState::Stopped(_) => {
                status.state = JobState::Stopped(StopReason::Cancelled);
                self.shared.stopped.notify_all();
            }
        }
    }

    /// Blocks until the job is not running, for at most `timeout`.
    ///
    /// Returns `false` if the loop was still running when the timeout expired.
    pub fn wait(&self, timeout: Duration) -> bool {
        let status = self.shared.status();
        let (status, _) = self
            .shared
            .stopped
            .wait_timeout_while(status, timeout, |s| s.state == JobState::Running)
            .unwrap_or_else(PoisonError::into_inner);
        status.state != JobState::Running
    }
}

impl<R: JobRoutine> Drop for AsyncJob<R> {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl<R: JobRoutine> Shared<R> {
    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn metric(&self, event: &str) -> String {
        format!("{}.async_job.{}", self.config.metric_prefix, event)
    }

    fn job_loop(&self) {
        let (cancel, tags) = {
            let status = self.status();
            (status.cancel.clone(), status.tags.clone())
        };
        let timeout = self.config.inactivity_timeout();
        let floor = self.config.min_collection_interval();
        let mut limiter = self.limiter.clone();
        limiter.update_last_time();
        info!(job = %self.config.job_name, tags = ?tags, "starting job loop");

        let reason = loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }

            let now = Instant::now();
            let (last_check_run, last_run_start) = {
                let status = self.status();
                (status.last_check_run, status.last_run_start)
            };
            if now.saturating_duration_since(last_check_run) > timeout {
                break StopReason::Inactive;
            }
            if let Some(start) = last_run_start {
                let since = now.saturating_duration_since(start);
                if since < floor {
                    if cancel.wait_timeout(floor - since) {
                        break StopReason::Cancelled;
                    }
                    continue;
                }
            }

            self.run_once(&cancel);

            if limiter.sleep_or_cancel(&cancel) {
                break StopReason::Cancelled;
            }
        };

        self.shutdown_routine();

        // `cancel()` only flips the token while the state is Running, so the
        // final reason is decided under the status lock.
        let mut status = self.status();
        let reason = if cancel.is_cancelled() {
            StopReason::Cancelled
        } else {
            reason
        };
        let tags = status.tags.clone();
        match reason {
            StopReason::Cancelled => {
                info!(job = %self.config.job_name, "job loop cancelled");
                self.sink.count(&self.metric("cancel"), 1.0, &tags);
            }
            StopReason::Inactive => {
                info!(
                    job = %self.config.job_name,
                    timeout_ms = timeout.as_millis() as u64,
                    "job loop stopping due to check inactivity"
                );
                self.sink.count(&self.metric("inactive_stop"), 1.0, &tags);
            }
        }

        status.state = JobState::Stopped(reason);
        status.last_run_start = None;
        status.run_in_progress = false;
        self.stopped.notify_all();
    }

    fn run_sync(&self) {
        let now = Instant::now();
        if let Some(start) = self.status().last_run_start
            && now.saturating_duration_since(start) < self.config.min_collection_interval()
        {
            debug!(job = %self.config.job_name, "below minimum collection interval, skipping run");
            return;
        }
        {
            let mut limiter = self.sync_limiter.lock().unwrap_or_else(PoisonError::into_inner);
            if !limiter.shall_execute() {
                debug!(job = %self.config.job_name, "rate limited, skipping run");
                return;
            }
            limiter.update_last_time();
        }
        let cancel = self.status().cancel.clone();
        self.run_once(&cancel);
    }

    fn run_once(&self, cancel: &CancellationToken) {
        let ctx = {
            let mut status = self.status();
            status.last_run_start = Some(Instant::now());
            status.run_in_progress = true;
            RunContext {
                tags: status.tags.clone(),
                cancel: cancel.clone(),
            }
        };

        let started = Instant::now();
        let outcome = {
            let mut routine = self.routine.lock().unwrap_or_else(PoisonError::into_inner);
            catch_unwind(AssertUnwindSafe(|| match routine.run(&ctx) {
                Ok(()) => RunOutcome::Ok,
                Err(e) if routine.is_expected(&e) => RunOutcome::Expected(e.to_string()),
                Err(e) => RunOutcome::Unexpected(e.to_string()),
            }))
            .unwrap_or(RunOutcome::Panicked)
        };
        let elapsed = started.elapsed();
        self.status().run_in_progress = false;

        self.sink.histogram(
            &self.metric("run_time"),
            elapsed.as_secs_f64() * 1000.0,
            ctx.tags(),
        );

        let error_kind = match outcome {
            RunOutcome::Ok => return,
            RunOutcome::Expected(err) => {
                warn!(job = %self.config.job_name, error = %err, "collection failed");
                "expected"
            }
            RunOutcome::Unexpected(err) => {
                error!(job = %self.config.job_name, error = %err, "collection failed unexpectedly");
                "unexpected"
            }
            RunOutcome::Panicked => {
                error!(job = %self.config.job_name, "collection routine panicked");
                "panic"
            }
        };
        let mut tags = ctx.tags().to_vec();
        tags.push(format!("error:{error_kind}"));
        self.sink.count(&self.metric("error"), 1.0, &tags);
    }

    fn shutdown_routine(&self) {
        let mut routine = self.routine.lock().unwrap_or_else(PoisonError::into_inner);
        if catch_unwind(AssertUnwindSafe(|| routine.shutdown())).is_err() {
            error!(job = %self.config.job_name, "shutdown callback panicked");
        }
    }

    /// How long the in-flight run has been going, if that exceeds the
    /// collection interval and the diagnostic is not cooling down.
    fn missed_collection_elapsed(&self, status: &Status, now: Instant) -> Option<Duration> {
        let floor = self.config.min_collection_interval();
        if floor.is_zero() || !status.run_in_progress {
            return None;
        }
        let elapsed = now.saturating_duration_since(status.last_run_start?);
        (elapsed > floor && self.missed_collection.acquire(())).then_some(elapsed)
    }

    fn report_missed_collection(&self, elapsed: Duration) {
        let tags = self.status().tags.clone();
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        warn!(
            job = %self.config.job_name,
            elapsed_ms = elapsed_ms as u64,
            interval_ms = self.config.min_collection_interval().as_millis() as u64,
            "collection is taking longer than the collection interval"
        );
        self.sink.count(&self.metric("missed_collection"), 1.0, &tags);
        self.sink
            .histogram(&self.metric("missed_collection.elapsed_ms"), elapsed_ms, &tags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::MemorySink;
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Debug)]
    enum TestError {
        Transient,
        Broken,
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                TestError::Transient => f.write_str("connection reset"),
                TestError::Broken => f.write_str("unexpected column type"),
            }
        }
    }

    impl std::error::Error for TestError {}

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        /// Cycles through expected error, unexpected error and panic.
        Fail,
    }

    #[derive(Clone, Default)]
    struct Counters {
        runs: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
    }

    impl Counters {
        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }

        fn shutdowns(&self) -> usize {
            self.shutdowns.load(Ordering::SeqCst)
        }
    }

    struct TestRoutine {
        counters: Counters,
        execution_time: Duration,
        shutdown_time: Duration,
        behavior: Behavior,
    }

    impl JobRoutine for TestRoutine {
        type Error = TestError;

        fn run(&mut self, _ctx: &RunContext) -> Result<(), TestError> {
            let n = self.counters.runs.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.execution_time);
            match self.behavior {
                Behavior::Succeed => Ok(()),
                Behavior::Fail => match n % 3 {
                    0 => Err(TestError::Transient),
                    1 => Err(TestError::Broken),
                    _ => panic!("routine blew up"),
                },
            }
        }

        fn is_expected(&self, err: &TestError) -> bool {
            matches!(err, TestError::Transient)
        }

        fn shutdown(&mut self) {
            thread::sleep(self.shutdown_time);
            self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        pool: Arc<WorkerPool>,
        sink: Arc<MemorySink>,
        counters: Counters,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                pool: Arc::new(WorkerPool::new(4).unwrap()),
                sink: Arc::new(MemorySink::new()),
                counters: Counters::default(),
            }
        }

        fn job(&self, config: JobConfig) -> AsyncJob<TestRoutine> {
            self.job_with(config, Duration::ZERO, Behavior::Succeed)
        }

        fn job_with(
            &self,
            config: JobConfig,
            execution_time: Duration,
            behavior: Behavior,
        ) -> AsyncJob<TestRoutine> {
            let routine = TestRoutine {
                counters: self.counters.clone(),
                execution_time,
                shutdown_time: Duration::ZERO,
                behavior,
            };
            AsyncJob::new(config, routine, self.sink.clone())
                .unwrap()
                .with_pool(Arc::clone(&self.pool))
        }
    }

    fn config() -> JobConfig {
        JobConfig {
            rate_limit: 10.0,
            min_collection_interval_secs: 0.0,
            inactivity_timeout_secs: Some(30.0),
            ..JobConfig::new("test-job", "dd.test-dbms")
        }
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn rejects_invalid_config() {
        let f = Fixture::new();
        let routine = TestRoutine {
            counters: f.counters.clone(),
            execution_time: Duration::ZERO,
            shutdown_time: Duration::ZERO,
            behavior: Behavior::Succeed,
        };
        let bad = JobConfig {
            rate_limit: 0.0,
            ..config()
        };
        assert!(AsyncJob::new(bad, routine, f.sink.clone()).is_err());
    }

    #[test]
    fn disabled_job_never_runs() {
        let f = Fixture::new();
        let job = f.job(JobConfig {
            enabled: false,
            ..config()
        });
        job.run_job_loop(&[]).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(job.state(), JobState::Idle);
        assert_eq!(f.counters.runs(), 0);
        assert_eq!(f.pool.available(), f.pool.capacity());
    }

    #[test]
    fn run_sync_runs_inline_once() {
        let f = Fixture::new();
        let job = f.job(JobConfig {
            run_sync: true,
            ..config()
        });
        job.run_job_loop(&[]).unwrap();
        assert_eq!(f.counters.runs(), 1);
        assert_eq!(job.state(), JobState::Idle);
        assert_eq!(f.pool.available(), f.pool.capacity());
    }

    #[test]
    fn run_sync_is_rate_limited() {
        let f = Fixture::new();
        let job = f.job(JobConfig {
            run_sync: true,
            ..config()
        });
        job.run_job_loop(&[]).unwrap();
        job.run_job_loop(&[]).unwrap();
        assert_eq!(f.counters.runs(), 1);
        thread::sleep(Duration::from_millis(120));
        job.run_job_loop(&[]).unwrap();
        assert_eq!(f.counters.runs(), 2);
    }

    #[test]
    fn run_sync_slow_jobs_are_not_throttled() {
        let f = Fixture::new();
        let job = f.job_with(
            JobConfig {
                run_sync: true,
                rate_limit: 5.0,
                ..config()
            },
            Duration::from_millis(250),
            Behavior::Succeed,
        );
        job.run_job_loop(&[]).unwrap();
        job.run_job_loop(&[]).unwrap();
        assert_eq!(f.counters.runs(), 2);
    }

    #[test]
    fn cancel_stops_loop_and_calls_shutdown_once() {
        let f = Fixture::new();
        let job = f.job(config());
        job.run_job_loop(&["hello:there".to_string()]).unwrap();
        assert_eq!(job.state(), JobState::Running);
        thread::sleep(Duration::from_millis(50));

        job.cancel();
        assert!(job.wait(WAIT));
        assert_eq!(job.state(), JobState::Stopped(StopReason::Cancelled));
        assert_eq!(f.counters.shutdowns(), 1);

        let cancels = f.sink.named("dd.test-dbms.async_job.cancel");
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0].tags, ["hello:there", "job:test-job"]);
    }

    #[test]
    fn concurrent_cancel_is_idempotent() {
        let f = Fixture::new();
        let job = Arc::new(f.job(config()));
        job.run_job_loop(&[]).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let job = Arc::clone(&job);
                thread::spawn(move || job.cancel())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(job.wait(WAIT));
        assert_eq!(f.counters.shutdowns(), 1);
        assert_eq!(f.sink.named("dd.test-dbms.async_job.cancel").len(), 1);
    }

    #[test]
    fn cancel_interrupts_long_rate_limit_sleep() {
        let f = Fixture::new();
        let job = f.job(JobConfig {
            rate_limit: 1.0 / 60.0,
            ..config()
        });
        job.run_job_loop(&[]).unwrap();
        thread::sleep(Duration::from_millis(100));

        let start = Instant::now();
        job.cancel();
        assert!(job.wait(WAIT));
        assert!(start.elapsed() < WAIT);
        assert_eq!(f.counters.runs(), 1);
    }

    #[test]
    fn loop_respects_rate_limit() {
        let f = Fixture::new();
        let job = f.job(config());
        job.run_job_loop(&[]).unwrap();
        thread::sleep(Duration::from_millis(900));
        job.cancel();
        assert!(job.wait(WAIT));

        let runs = f.counters.runs();
        assert!((5..=10).contains(&runs), "runs={runs}");
        assert_eq!(
            f.sink.named("dd.test-dbms.async_job.run_time").len(),
            runs
        );
    }

    #[test]
    fn loop_respects_min_collection_interval() {
        let f = Fixture::new();
        let job = f.job(JobConfig {
            rate_limit: 100.0,
            min_collection_interval_secs: 0.2,
            ..config()
        });
        job.run_job_loop(&[]).unwrap();
        thread::sleep(Duration::from_millis(500));
        job.cancel();
        assert!(job.wait(WAIT));

        let runs = f.counters.runs();
        assert!((2..=3).contains(&runs), "runs={runs}");
    }

    #[test]
    fn start_is_idempotent_while_running() {
        let f = Fixture::new();
        let job = f.job(config());
        job.run_job_loop(&[]).unwrap();
        job.run_job_loop(&[]).unwrap();
        job.run_job_loop(&[]).unwrap();
        assert_eq!(f.pool.available(), f.pool.capacity() - 1);
        job.cancel();
        assert!(job.wait(WAIT));
    }

    #[test]
    fn inactive_loop_stops_and_restarts_on_next_check_run() {
        let f = Fixture::new();
        let job = f.job(JobConfig {
            inactivity_timeout_secs: Some(0.3),
            ..config()
        });
        job.run_job_loop(&[]).unwrap();
        assert!(job.wait(WAIT));
        assert_eq!(job.state(), JobState::Stopped(StopReason::Inactive));
        assert_eq!(f.counters.shutdowns(), 1);

        let stops = f.sink.named("dd.test-dbms.async_job.inactive_stop");
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].tags, ["job:test-job"]);

        job.run_job_loop(&[]).unwrap();
        assert_eq!(job.state(), JobState::Running);
        job.cancel();
        assert!(job.wait(WAIT));
        assert_eq!(f.counters.shutdowns(), 2);
    }

    #[test]
    fn cancelled_job_is_terminal() {
        let f = Fixture::new();
        let job = f.job(config());
        job.run_job_loop(&[]).unwrap();
        job.cancel();
        assert!(job.wait(WAIT));
        let runs = f.counters.runs();

        job.run_job_loop(&[]).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(job.state(), JobState::Stopped(StopReason::Cancelled));
        assert_eq!(f.counters.runs(), runs);
    }

    #[test]
    fn loop_survives_slow_check_when_timeout_fits_check_interval() {
        let f = Fixture::new();
        let check_interval = Duration::from_millis(300);
        let mut config = JobConfig {
            inactivity_timeout_secs: None,
            ..config()
        };
        // Default would be 2 x 100ms, shorter than the check interval.
        config.fit_check_interval(check_interval);
        let job = f.job(config);

        for _ in 0..3 {
            job.run_job_loop(&[]).unwrap();
            thread::sleep(check_interval);
        }
        assert_eq!(job.state(), JobState::Running);
        assert!(f.sink.named("dd.test-dbms.async_job.inactive_stop").is_empty());
        assert_eq!(f.counters.shutdowns(), 0);

        job.cancel();
        assert!(job.wait(WAIT));
    }

    #[test]
    fn cancel_during_slow_shutdown_is_terminal() {
        let f = Fixture::new();
        let routine = TestRoutine {
            counters: f.counters.clone(),
            execution_time: Duration::ZERO,
            shutdown_time: Duration::from_millis(400),
            behavior: Behavior::Succeed,
        };
        let job = AsyncJob::new(
            JobConfig {
                inactivity_timeout_secs: Some(0.1),
                ..config()
            },
            routine,
            f.sink.clone(),
        )
        .unwrap()
        .with_pool(Arc::clone(&f.pool));

        job.run_job_loop(&[]).unwrap();
        // The loop stops for inactivity after ~100ms and is now in shutdown.
        thread::sleep(Duration::from_millis(300));
        assert_eq!(job.state(), JobState::Running);
        job.cancel();
        assert!(job.wait(WAIT));

        assert_eq!(job.state(), JobState::Stopped(StopReason::Cancelled));
        assert_eq!(f.sink.named("dd.test-dbms.async_job.cancel").len(), 1);
        assert!(f.sink.named("dd.test-dbms.async_job.inactive_stop").is_empty());

        job.run_job_loop(&[]).unwrap();
        assert_eq!(job.state(), JobState::Stopped(StopReason::Cancelled));
        assert_eq!(f.counters.shutdowns(), 1);
    }

    #[test]
    fn cancel_before_start_needs_no_shutdown() {
        let f = Fixture::new();
        let job = f.job(config());
        job.cancel();
        assert!(job.wait(Duration::ZERO));
        assert_eq!(job.state(), JobState::Stopped(StopReason::Cancelled));
        assert_eq!(f.counters.shutdowns(), 0);
    }

    #[test]
    fn routine_failures_do_not_stop_the_loop() {
        let f = Fixture::new();
        let job = f.job_with(config(), Duration::ZERO, Behavior::Fail);
        job.run_job_loop(&[]).unwrap();

        let deadline = Instant::now() + WAIT;
        while f.counters.runs() < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(f.counters.runs() >= 4);
        assert_eq!(job.state(), JobState::Running);
        job.cancel();
        assert!(job.wait(WAIT));

        let errors = f.sink.named("dd.test-dbms.async_job.error");
        let has = |kind: &str| {
            errors
                .iter()
                .any(|s| s.tags.iter().any(|t| t == &format!("error:{kind}")))
        };
        assert!(has("expected"));
        assert!(has("unexpected"));
        assert!(has("panic"));
    }

    #[test]
    fn pool_exhaustion_is_returned_to_caller() {
        let f = Fixture {
            pool: Arc::new(WorkerPool::new(1).unwrap()),
            ..Fixture::new()
        };
        let first = f.job(config());
        let second = f.job(config());
        first.run_job_loop(&[]).unwrap();

        assert!(matches!(
            second.run_job_loop(&[]),
            Err(SchedulerError::PoolExhausted { capacity: 1 })
        ));
        assert_eq!(second.state(), JobState::Idle);

        first.cancel();
        assert!(first.wait(WAIT));
    }

    #[test]
    fn slow_run_reports_missed_collection_once_per_cooldown() {
        let f = Fixture::new();
        let job = f.job_with(
            JobConfig {
                min_collection_interval_secs: 0.1,
                ..config()
            },
            Duration::from_millis(500),
            Behavior::Succeed,
        );
        job.run_job_loop(&[]).unwrap();
        thread::sleep(Duration::from_millis(250));
        job.run_job_loop(&[]).unwrap();
        job.run_job_loop(&[]).unwrap();

        let missed = f.sink.named("dd.test-dbms.async_job.missed_collection");
        assert_eq!(missed.len(), 1);
        let elapsed = f
            .sink
            .named("dd.test-dbms.async_job.missed_collection.elapsed_ms");
        assert!(elapsed[0].value >= 100.0);

        job.cancel();
        assert!(job.wait(WAIT));
    }

    #[test]
    fn dropping_job_cancels_loop() {
        let f = Fixture::new();
        let job = f.job(config());
        job.run_job_loop(&[]).unwrap();
        drop(job);

        let deadline = Instant::now() + WAIT;
        while f.counters.shutdowns() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(f.counters.shutdowns(), 1);
    }
}
