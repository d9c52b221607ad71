use futures::FutureExt;
use serde::{Serialize, Deserialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tokio::time::{error::Elapsed, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cli::config::SchedulerSettings;
use crate::crawler::aggregate::Aggregator;
use crate::crawler::fetcher::PageFetcher;
use crate::crawler::retry::RetryPolicy;
use crate::crawler::task::{FetchError, PageResult, PageTask};
use crate::storage::checkpoint::{Checkpoint, CheckpointEmitter};
use crate::storage::report::ReportContext;
use crate::utils::metrics::{FetchMetrics, RequestTimer};

/// A change of the concurrency limit, with the number of pages done at the time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyChange {
    pub pages_completed: usize,
    pub concurrency: usize,
}

/// Concurrency limit driven by success and failure streaks.
///
/// A full success streak doubles the limit up to the ceiling; a full
/// failure streak halves it down to the floor. Either streak restarts once
/// it reaches its length, whether or not the limit moved.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    current: usize,
    floor: usize,
    ceiling: usize,
    success_streak: u32,
    failure_streak: u32,
    consecutive_successes: u32,
    consecutive_failures: u32,
    history: Vec<ConcurrencyChange>,
}

impl ConcurrencyLimiter {
    pub fn new(settings: &SchedulerSettings) -> Self {
        let floor = settings.initial_concurrency.max(1);
        Self {
            current: floor,
            floor,
            ceiling: settings.max_concurrency.max(floor),
            success_streak: settings.success_streak.max(1),
            failure_streak: settings.failure_streak.max(1),
            consecutive_successes: 0,
            consecutive_failures: 0,
            history: Vec::new(),
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn history(&self) -> &[ConcurrencyChange] {
        &self.history
    }

    /// Returns the new limit if it changed
    pub fn record_success(&mut self, pages_completed: usize) -> Option<usize> {
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;
        if self.consecutive_successes < self.success_streak {
            return None;
        }

        self.consecutive_successes = 0;
        let next = self.current.saturating_mul(2).min(self.ceiling);
        self.change_to(next, pages_completed)
    }

    /// Returns the new limit if it changed
    pub fn record_failure(&mut self, pages_completed: usize) -> Option<usize> {
        self.consecutive_successes = 0;
        self.consecutive_failures += 1;
        if self.consecutive_failures < self.failure_streak {
            return None;
        }

        self.consecutive_failures = 0;
        let next = (self.current / 2).max(self.floor);
        self.change_to(next, pages_completed)
    }

    fn change_to(&mut self, next: usize, pages_completed: usize) -> Option<usize> {
        if next == self.current {
            return None;
        }
        self.current = next;
        self.history.push(ConcurrencyChange { pages_completed, concurrency: next });
        Some(next)
    }
}

/// Counts consecutive stall checks on which the same page was the only one left.
///
/// Only a lone straggler is caught this way; several tasks stalled at once
/// are left to the per-task deadline.
#[derive(Debug, Clone)]
pub struct StallTracker {
    strikes_needed: u32,
    page: Option<u32>,
    strikes: u32,
}

impl StallTracker {
    pub fn new(strikes_needed: u32) -> Self {
        Self {
            strikes_needed: strikes_needed.max(1),
            page: None,
            strikes: 0,
        }
    }

    /// Note a stall check. `sole` is the only in-flight page, if there is
    /// exactly one. Returns true when that page should be cancelled.
    pub fn observe(&mut self, sole: Option<u32>) -> bool {
        let Some(page) = sole else {
            self.reset();
            return false;
        };

        if self.page == Some(page) {
            self.strikes += 1;
        } else {
            self.page = Some(page);
            self.strikes = 1;
        }

        if self.strikes >= self.strikes_needed {
            self.reset();
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.page = None;
        self.strikes = 0;
    }

    pub fn strikes(&self) -> u32 {
        self.strikes
    }
}

/// Final state of a scheduler run
#[derive(Debug, Clone)]
pub struct SchedulerReport {
    pub succeeded: BTreeSet<u32>,
    pub failed: BTreeMap<u32, FetchError>,
    pub batch_size_history: Vec<ConcurrencyChange>,
    pub metrics: FetchMetrics,
    pub interrupted: bool,
}

struct InFlight {
    page_id: u32,
    abort: AbortHandle,
    started: Instant,
}

struct TaskOutcome {
    task_id: Uuid,
    result: PageResult,
    duration_ms: u64,
}

enum LoopEvent {
    Shutdown,
    Joined(Result<Option<Result<TaskOutcome, JoinError>>, Elapsed>),
}

/// Everything the control loop mutates
struct SchedulerState {
    pending: VecDeque<PageTask>,
    in_flight: HashMap<Uuid, InFlight>,
    limiter: ConcurrencyLimiter,
    stall: StallTracker,
    succeeded: BTreeSet<u32>,
    failed: BTreeMap<u32, FetchError>,
    successes: usize,
    completed: usize,
    total_pages: u32,
    metrics: FetchMetrics,
}

impl SchedulerState {
    fn new(tasks: Vec<PageTask>, settings: &SchedulerSettings) -> Self {
        Self {
            total_pages: tasks.len() as u32,
            pending: tasks.into(),
            in_flight: HashMap::new(),
            limiter: ConcurrencyLimiter::new(settings),
            stall: StallTracker::new(settings.stall_strikes),
            succeeded: BTreeSet::new(),
            failed: BTreeMap::new(),
            successes: 0,
            completed: 0,
            metrics: FetchMetrics::new(),
        }
    }

    fn in_flight_pages(&self) -> Vec<u32> {
        let mut pages: Vec<u32> = self.in_flight.values().map(|f| f.page_id).collect();
        pages.sort_unstable();
        pages
    }

    fn record_failure(&mut self, page_id: u32, reason: FetchError, duration_ms: u64) {
        warn!(page = page_id, "Page failed: {}", reason);
        self.metrics.record_page(false, 0, duration_ms);
        self.failed.insert(page_id, reason);
        self.completed += 1;

        if let Some(concurrency) = self.limiter.record_failure(self.completed) {
            info!(concurrency, completed = self.completed, "Lowering concurrency");
        }
    }

    /// Abandon an in-flight task and fail its page
    fn cancel(&mut self, task_id: Uuid, reason: FetchError) {
        if let Some(flight) = self.in_flight.remove(&task_id) {
            flight.abort.abort();
            let elapsed = flight.started.elapsed().as_millis() as u64;
            self.record_failure(flight.page_id, reason, elapsed);
        }
    }

    /// Forced shutdown: nothing left may succeed
    fn abandon_all(&mut self) {
        let ids: Vec<Uuid> = self.in_flight.keys().copied().collect();
        for id in ids {
            if let Some(flight) = self.in_flight.remove(&id) {
                flight.abort.abort();
                self.metrics.record_page(false, 0, flight.started.elapsed().as_millis() as u64);
                self.failed.insert(flight.page_id, FetchError::Cancelled);
            }
        }
        for task in self.pending.drain(..) {
            self.failed.insert(task.page_id, FetchError::Cancelled);
        }
    }

    fn checkpoint(&self, aggregator: &Aggregator) -> Checkpoint {
        Checkpoint {
            traders: aggregator.snapshot(),
            context: ReportContext {
                total_pages: self.total_pages,
                successful_pages: self.succeeded.len(),
                failed_pages: self.failed.keys().copied().collect(),
                date_range: aggregator.date_range(),
                batch_size_history: self.limiter.history().to_vec(),
                interim: true,
            },
        }
    }
}

/// Resolves once shutdown has been requested; never resolves if the sender is gone
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Bounded worker pool whose size follows the recent success/failure streaks
pub struct AdaptiveScheduler {
    fetcher: Arc<dyn PageFetcher>,
    retry: Arc<RetryPolicy>,
    page_load_timeout: Duration,
    settings: SchedulerSettings,
}

impl AdaptiveScheduler {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        retry: Arc<RetryPolicy>,
        page_load_timeout: Duration,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            fetcher,
            retry,
            page_load_timeout,
            settings,
        }
    }

    /// Fetch every task, feeding results into `aggregator`, until all pages
    /// have succeeded or failed or shutdown is requested.
    pub async fn run(
        &self,
        tasks: Vec<PageTask>,
        aggregator: &mut Aggregator,
        checkpoints: &CheckpointEmitter,
        mut shutdown: watch::Receiver<bool>,
    ) -> SchedulerReport {
        let mut state = SchedulerState::new(tasks, &self.settings);
        let mut workers: JoinSet<TaskOutcome> = JoinSet::new();
        let mut interrupted = false;

        info!(
            pages = state.pending.len(),
            concurrency = state.limiter.current(),
            "Scheduler starting"
        );
        self.backfill(&mut state, &mut workers);

        while !state.in_flight.is_empty() {
            let event = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => LoopEvent::Shutdown,
                joined = timeout(self.settings.stall_window(), workers.join_next()) => LoopEvent::Joined(joined),
            };

            match event {
                LoopEvent::Shutdown => {
                    warn!(
                        in_flight = state.in_flight.len(),
                        pending = state.pending.len(),
                        "Shutdown requested, abandoning remaining pages"
                    );
                    state.abandon_all();
                    interrupted = true;
                    break;
                }
                LoopEvent::Joined(Ok(Some(Ok(outcome)))) => {
                    self.complete(&mut state, outcome, aggregator, checkpoints);
                }
                LoopEvent::Joined(Ok(Some(Err(e)))) => {
                    // Aborted tasks land here; their pages are already accounted for
                    if !e.is_cancelled() {
                        error!("Worker task failed: {}", e);
                    }
                }
                LoopEvent::Joined(Ok(None)) => {
                    error!(pages = ?state.in_flight_pages(), "Worker set empty with pages still in flight");
                    let ids: Vec<Uuid> = state.in_flight.keys().copied().collect();
                    for id in ids {
                        state.cancel(id, FetchError::Cancelled);
                    }
                }
                LoopEvent::Joined(Err(_)) => self.on_stall(&mut state),
            }

            self.backfill(&mut state, &mut workers);
        }

        workers.abort_all();

        info!(
            succeeded = state.succeeded.len(),
            failed = state.failed.len(),
            concurrency = state.limiter.current(),
            mean_ms = ?state.metrics.mean_duration_ms(),
            "Scheduler finished"
        );

        SchedulerReport {
            batch_size_history: state.limiter.history().to_vec(),
            succeeded: state.succeeded,
            failed: state.failed,
            metrics: state.metrics,
            interrupted,
        }
    }

    /// Dispatch pending pages until the current limit is reached
    fn backfill(&self, state: &mut SchedulerState, workers: &mut JoinSet<TaskOutcome>) {
        while state.in_flight.len() < state.limiter.current() {
            let Some(task) = state.pending.pop_front() else {
                break;
            };

            let task_id = task.id;
            let page_id = task.page_id;
            let fetcher = self.fetcher.clone();
            let retry = self.retry.clone();
            let page_load_timeout = self.page_load_timeout;

            let abort = workers.spawn(async move {
                let timer = RequestTimer::start();
                let result = AssertUnwindSafe(retry.attempt(&task, fetcher.as_ref(), page_load_timeout))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| PageResult::failure(task.page_id, FetchError::Panicked));

                TaskOutcome {
                    task_id: task.id,
                    result,
                    duration_ms: timer.elapsed_ms(),
                }
            });

            state.in_flight.insert(task_id, InFlight { page_id, abort, started: Instant::now() });
            debug!(page = page_id, in_flight = state.in_flight.len(), "Dispatched page");
        }
    }

    fn complete(
        &self,
        state: &mut SchedulerState,
        outcome: TaskOutcome,
        aggregator: &mut Aggregator,
        checkpoints: &CheckpointEmitter,
    ) {
        if state.in_flight.remove(&outcome.task_id).is_none() {
            debug!(page = outcome.result.page_id(), "Discarding result of abandoned task");
            return;
        }
        state.stall.reset();

        match outcome.result {
            PageResult::Success { page_id, records } => {
                debug!(page = page_id, records = records.len(), "Page succeeded");
                state.metrics.record_page(true, records.len(), outcome.duration_ms);
                aggregator.absorb(records);
                state.succeeded.insert(page_id);
                state.successes += 1;
                state.completed += 1;

                if let Some(concurrency) = state.limiter.record_success(state.completed) {
                    info!(concurrency, completed = state.completed, "Raising concurrency");
                }

                if state.successes % self.settings.checkpoint_every.max(1) == 0 {
                    checkpoints.emit(state.checkpoint(aggregator));
                }
            }
            PageResult::Failure { page_id, reason } => {
                state.record_failure(page_id, reason, outcome.duration_ms);
            }
        }
    }

    /// Nothing finished within the wait window
    fn on_stall(&self, state: &mut SchedulerState) {
        warn!(
            waiting = ?state.in_flight_pages(),
            window_secs = self.settings.stall_window_secs,
            "No page finished within the wait window"
        );

        if let Some(deadline) = self.settings.task_deadline() {
            let expired: Vec<Uuid> = state.in_flight.iter()
                .filter(|(_, flight)| flight.started.elapsed() >= deadline)
                .map(|(id, _)| *id)
                .collect();

            for id in expired {
                if let Some(page) = state.in_flight.get(&id).map(|f| f.page_id) {
                    warn!(page, "Cancelling page past its deadline");
                }
                state.cancel(id, FetchError::Stalled);
            }
        }

        let sole = if state.in_flight.len() == 1 {
            state.in_flight.iter().next().map(|(id, flight)| (*id, flight.page_id))
        } else {
            None
        };

        if state.stall.observe(sole.map(|(_, page)| page)) {
            if let Some((id, page)) = sole {
                warn!(page, strikes = self.settings.stall_strikes, "Cancelling stuck page");
                state.cancel(id, FetchError::Stalled);
            }
        } else if let Some((_, page)) = sole {
            debug!(page, strikes = state.stall.strikes(), "Lone page still waiting");
        }
    }
}
