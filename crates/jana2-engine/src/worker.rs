//! Worker: the pull-based thread loop that drives one or more arrows.
//!
//! Grounded on `JWorker.cc`'s `loop()`: each checkin interval, ask the
//! scheduler for an assignment; if none, idle and try again; if one, fire
//! it repeatedly until it stops returning progress, the checkin window
//! elapses, or the backoff budget is exhausted, then report metrics and
//! check in again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, error, trace};

use jana2_core::JanaError;
use jana2_topology::arrow::ArrowFireResult;
use jana2_topology::metrics::ArrowMetrics;
use jana2_topology::Arrow;

use crate::metrics::PerfSummary;
use crate::scheduler::Scheduler;

/// How a worker extends its wait between retries on an unproductive arrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Add a fixed increment on every failed try.
    Linear,
    /// Double the wait on every failed try.
    Exponential,
}

/// Tunables for one worker's retry loop. In the original engine these are
/// properties of the assigned arrow; here they are collapsed into one
/// engine-wide configuration applied uniformly, since arrows in this
/// crate do not carry per-arrow backoff parameters.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// How long a worker waits with no assignment before checking in again.
    pub checkin_time: Duration,
    /// Initial (and, for `Linear`, per-step) backoff delay.
    pub initial_backoff: Duration,
    /// How to grow the backoff delay across consecutive unproductive tries.
    pub backoff_strategy: BackoffStrategy,
    /// Maximum consecutive unproductive tries before giving up this
    /// checkin interval and asking the scheduler for reassignment.
    pub backoff_tries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            checkin_time: Duration::from_millis(50),
            initial_backoff: Duration::from_micros(50),
            backoff_strategy: BackoffStrategy::Exponential,
            backoff_tries: 4,
        }
    }
}

/// Scales `backoff` by a random factor in `[0.5, 1.0)`, per the Design
/// Notes' "default exponential with a jitter for fairness" — otherwise
/// every worker retrying the same congested arrow wakes up at the exact
/// same instant and re-collides.
fn jittered(backoff: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.5..1.0);
    backoff.mul_f64(factor)
}

/// One worker thread's handle and configuration. Constructed by the
/// supervisor; `run` is the thread body.
pub struct Worker {
    worker_id: usize,
    cpu_id: usize,
    config: WorkerConfig,
    scheduler: Arc<Scheduler>,
    perf: Arc<PerfSummary>,
    running: Arc<AtomicBool>,
    /// First exception raised by this worker, latched for the supervisor
    /// to observe and re-raise on the main thread.
    exception_slot: Arc<parking_lot::Mutex<Option<JanaError>>>,
}

impl Worker {
    /// Build a worker. Does not start a thread; call [`Self::spawn`].
    #[must_use]
    pub fn new(
        worker_id: usize,
        cpu_id: usize,
        config: WorkerConfig,
        scheduler: Arc<Scheduler>,
        perf: Arc<PerfSummary>,
        running: Arc<AtomicBool>,
        exception_slot: Arc<parking_lot::Mutex<Option<JanaError>>>,
    ) -> Self {
        Self {
            worker_id,
            cpu_id,
            config,
            scheduler,
            perf,
            running,
            exception_slot,
        }
    }

    /// Spawn this worker's thread and return its `JoinHandle`. CPU pinning
    /// is not performed here (no portable pinning crate is part of this
    /// corpus's dependency stack); `cpu_id` is recorded for metrics only.
    pub fn spawn(self) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name(format!("jana2-worker-{}", self.worker_id))
            .spawn(move || self.run())
            .expect("failed to spawn worker thread")
    }

    fn run(&self) {
        debug!(worker = self.worker_id, cpu = self.cpu_id, "worker starting");
        self.perf.mark_started();

        let local_metrics = ArrowMetrics::new();
        let mut assignment = None;
        let mut last_result: Option<ArrowFireResult> = None;

        while self.running.load(Ordering::Acquire) {
            trace!(worker = self.worker_id, "checking in");
            let start_time = Instant::now();

            let previous: Option<(&Arc<dyn Arrow>, ArrowFireResult)> = assignment.as_ref().zip(last_result);
            let next = self.scheduler.next_assignment(self.worker_id, previous);
            last_result = None;

            let mut idle_duration = Duration::ZERO;
            let mut retry_duration = Duration::ZERO;
            let mut useful_duration = Duration::ZERO;

            match &next {
                None => {
                    let before_idle = Instant::now();
                    thread::sleep(Duration::from_millis(10));
                    idle_duration = before_idle.elapsed();
                }
                Some(arrow) => {
                    let mut tries = 0u32;
                    let mut backoff = self.config.initial_backoff;

                    loop {
                        let keep_trying = tries <= self.config.backoff_tries
                            && matches!(
                                last_result,
                                None | Some(ArrowFireResult::KeepGoing) | Some(ArrowFireResult::ComeBackLater)
                            )
                            && self.running.load(Ordering::Acquire)
                            && start_time.elapsed() < self.config.checkin_time;
                        if !keep_trying {
                            break;
                        }

                        let before = Instant::now();
                        let fired = arrow.fire(self.scheduler_location(), &local_metrics);
                        match fired {
                            Ok(result) => {
                                useful_duration += before.elapsed();
                                last_result = Some(result);
                                if result == ArrowFireResult::KeepGoing {
                                    tries = 0;
                                    backoff = self.config.initial_backoff;
                                } else {
                                    tries += 1;
                                    if self.config.backoff_tries > 0 {
                                        backoff = match self.config.backoff_strategy {
                                            BackoffStrategy::Linear => backoff + self.config.initial_backoff,
                                            BackoffStrategy::Exponential => backoff * 2,
                                        };
                                        // Jitter the actual sleep (not the stored `backoff`, which
                                        // must keep doubling cleanly) so that workers tied on the
                                        // same arrow don't all wake up in lockstep and re-contend.
                                        let sleep_for = jittered(backoff);
                                        thread::sleep(sleep_for);
                                        retry_duration += sleep_for;
                                    }
                                }
                            }
                            Err(e) => {
                                error!(worker = self.worker_id, arrow = arrow.name(), error = %e, "arrow raised an exception");
                                *self.exception_slot.lock() = Some(e);
                                self.running.store(false, Ordering::Release);
                                break;
                            }
                        }
                    }
                    self.perf.merge_arrow(arrow.name(), &local_metrics);
                }
            }

            self.perf
                .record_worker_interval(self.worker_id, useful_duration, retry_duration + idle_duration);
            assignment = next;
        }

        // Hand the final result back so the scheduler can finalize the
        // last-fired arrow even though this worker is exiting.
        let final_previous: Option<(&Arc<dyn Arrow>, ArrowFireResult)> = assignment.as_ref().zip(last_result);
        self.scheduler.next_assignment(self.worker_id, final_previous);
        debug!(worker = self.worker_id, "worker exiting");
    }

    fn scheduler_location(&self) -> usize {
        // Single-location engine: every worker currently shares location 0.
        // `ProcessorMapping` is consulted by the supervisor when assigning
        // `cpu_id`; per-location pool/queue partitioning beyond one
        // location is not yet exercised by any topology this engine builds.
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_exponential_backoff() {
        let config = WorkerConfig::default();
        assert_eq!(config.backoff_strategy, BackoffStrategy::Exponential);
        assert!(config.backoff_tries > 0);
    }
}
