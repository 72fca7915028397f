//! Supervisor: owns the worker pool's lifecycle and the first-exception
//! latch.
//!
//! Grounded on `JEngine::Run`/`Scale`/`RequestPause`/`RequestStop`: `run`
//! starts the configured number of worker threads and polls until the
//! topology drains, is stopped, times out, or a worker raises; the first
//! exception observed is re-thrown (here: returned) to the caller, and
//! every other exception is swallowed just as the original does.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use jana2_core::{JanaError, JanaResult};
use jana2_topology::Topology;

use crate::metrics::PerfSummary;
use crate::processor_mapping::{AffinityStrategy, LocalityStrategy, ProcessorMapping};
use crate::scheduler::Scheduler;
use crate::signals::{SignalAction, SignalPolicy};
use crate::worker::{Worker, WorkerConfig};

/// Coarse run state, mirroring `JProcessingController`'s state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No workers started yet.
    Idle,
    /// Workers are running.
    Running,
    /// Workers are stopping (either drained or asked to stop).
    Stopping,
    /// All workers have joined.
    Stopped,
}

/// Supervisor construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    /// Number of worker threads to start.
    pub nthreads: usize,
    /// How often `run` polls worker state and prints a status line.
    pub ticker_interval: Duration,
    /// Optional wall-clock budget; `None` disables the timeout check.
    pub timeout: Option<Duration>,
    /// Worker backoff/checkin tuning, applied to every worker.
    pub worker_config: WorkerConfig,
    /// CPU affinity strategy for the processor mapping.
    pub affinity: AffinityStrategy,
    /// Locality strategy for the processor mapping.
    pub locality: LocalityStrategy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            nthreads: 1,
            ticker_interval: Duration::from_millis(1000),
            timeout: None,
            worker_config: WorkerConfig::default(),
            affinity: AffinityStrategy::None,
            locality: LocalityStrategy::Global,
        }
    }
}

/// Owns the scheduler, worker threads, and perf summary for one engine run.
pub struct Supervisor {
    config: SupervisorConfig,
    scheduler: Arc<Scheduler>,
    perf: Arc<PerfSummary>,
    mapping: ProcessorMapping,
    running: Arc<AtomicBool>,
    exception_slot: Arc<Mutex<Option<JanaError>>>,
    signals: Mutex<SignalPolicy>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
    state: Mutex<RunState>,
}

impl Supervisor {
    /// Build a supervisor over `topology` with `config`.
    #[must_use]
    pub fn new(topology: Arc<Topology>, config: SupervisorConfig) -> Self {
        let perf = Arc::new(PerfSummary::new(&topology));
        let scheduler = Arc::new(Scheduler::new(topology));
        let mapping = ProcessorMapping::new(config.nthreads.max(1), config.affinity, config.locality);
        Self {
            config,
            scheduler,
            perf,
            mapping,
            running: Arc::new(AtomicBool::new(false)),
            exception_slot: Arc::new(Mutex::new(None)),
            signals: Mutex::new(SignalPolicy::new()),
            handles: Mutex::new(Vec::new()),
            state: Mutex::new(RunState::Idle),
        }
    }

    /// The scheduler this supervisor drives, for inspection (e.g. arrow
    /// state) without taking ownership.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// The shared performance rollup.
    #[must_use]
    pub fn perf(&self) -> &Arc<PerfSummary> {
        &self.perf
    }

    /// Current run state.
    #[must_use]
    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    /// Start `nthreads` worker threads and poll until the run ends,
    /// returning the first exception any worker raised (if any).
    ///
    /// # Errors
    /// Returns the first [`JanaError`] any worker observed, matching
    /// `JEngine::Run`'s "throw the first exception and ignore the others."
    pub fn run(&self) -> JanaResult<()> {
        self.start()?;
        self.wait_until_stopped()
    }

    /// Start worker threads without blocking. Idempotent: a second call
    /// while already running is a no-op.
    pub fn start(&self) -> JanaResult<()> {
        let mut state = self.state.lock();
        if *state == RunState::Running {
            return Ok(());
        }
        info!(nthreads = self.config.nthreads, "starting workers");
        self.running.store(true, Ordering::Release);
        self.perf.mark_started();

        let mut handles = self.handles.lock();
        for worker_id in 0..self.config.nthreads.max(1) {
            let worker = Worker::new(
                worker_id,
                self.mapping.cpu_id(worker_id),
                self.config.worker_config,
                self.scheduler.clone(),
                self.perf.clone(),
                self.running.clone(),
                self.exception_slot.clone(),
            );
            handles.push(worker.spawn());
        }
        *state = RunState::Running;
        Ok(())
    }

    /// Block until every worker has stopped (drained, asked to stop, timed
    /// out, or excepted), then join all threads.
    ///
    /// # Errors
    /// The first exception a worker raised, if any.
    pub fn wait_until_stopped(&self) -> JanaResult<()> {
        let start = Instant::now();
        loop {
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            if let Some(timeout) = self.config.timeout {
                if start.elapsed() >= timeout {
                    error!("run timed out; stopping");
                    self.request_stop();
                    break;
                }
            }
            if self.exception_slot.lock().is_some() {
                error!("worker exception observed; stopping");
                self.request_stop();
                break;
            }
            std::thread::sleep(self.config.ticker_interval.min(Duration::from_millis(50)));
        }

        self.join();

        let exception = self.exception_slot.lock().take();
        if let Some(e) = exception {
            return Err(e);
        }
        Ok(())
    }

    fn join(&self) {
        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
        *self.state.lock() = RunState::Stopped;
    }

    /// Request a graceful stop; workers finish their current backoff cycle
    /// and exit.
    pub fn request_stop(&self) {
        let mut state = self.state.lock();
        if *state == RunState::Running {
            *state = RunState::Stopping;
        }
        self.running.store(false, Ordering::Release);
    }

    /// Scale the worker pool to `nthreads`. Growing starts new workers;
    /// shrinking is not supported mid-run (matching `JProcessingController`,
    /// which only grows without a restart) and logs a warning instead of
    /// silently ignoring the request.
    pub fn scale(&self, nthreads: usize) {
        let mut handles = self.handles.lock();
        let current = handles.len();
        if nthreads <= current {
            warn!(current, requested = nthreads, "scaling down mid-run is not supported; ignoring");
            return;
        }
        info!(from = current, to = nthreads, "scaling up worker pool");
        for worker_id in current..nthreads {
            let worker = Worker::new(
                worker_id,
                self.mapping.cpu_id(worker_id),
                self.config.worker_config,
                self.scheduler.clone(),
                self.perf.clone(),
                self.running.clone(),
                self.exception_slot.clone(),
            );
            handles.push(worker.spawn());
        }
    }

    /// Feed one interrupt into the 3-strike signal policy and act on it.
    pub fn handle_sigint(&self) -> SignalAction {
        let action = self.signals.lock().handle();
        match action {
            SignalAction::Pause => {
                // No per-arrow pause facility is wired up yet; treated as
                // a status report request rather than a true pause.
                warn!("pause requested (reporting status only)");
            }
            SignalAction::GracefulStop => self.request_stop(),
            SignalAction::ImmediateExit => {
                self.running.store(false, Ordering::Release);
            }
        }
        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jana2_core::{Event, EventLevel};
    use jana2_pool::{Limit, Mailbox, Pool};
    use jana2_topology::arrow::{EmitStatus, Processor, SinkArrow, SourceArrow};
    use jana2_topology::topology::{PortBinding, PortDirection, PortKind, TopologyBuilder};

    struct CountingProcessor {
        count: Arc<std::sync::atomic::AtomicU64>,
    }
    impl Processor for CountingProcessor {
        fn name(&self) -> &str {
            "counter"
        }
        fn process(&self, _event: &Event) -> jana2_core::JanaResult<()> {
            self.count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn build_small_topology(nevents: u64) -> (Arc<Topology>, Arc<std::sync::atomic::AtomicU64>) {
        let pool = Arc::new(Pool::new(1, 8, Limit::Strict, || Event::new(EventLevel::PhysicsEvent), |_: &mut Event| {}));
        let queue: Arc<Mailbox<Arc<Event>>> = Arc::new(Mailbox::new(1, 8));
        let count = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let source = Arc::new(SourceArrow::new(
            "src",
            EventLevel::PhysicsEvent,
            pool.clone(),
            queue.clone(),
            4,
            0,
            Some(nevents),
            |_e: &Event| Ok(EmitStatus::Success),
        ));
        let sink = Arc::new(SinkArrow::terminal(
            "sink",
            queue.clone(),
            vec![Arc::new(CountingProcessor { count: count.clone() })],
            pool.clone(),
        ));

        let mut builder = TopologyBuilder::new();
        builder
            .register(source, vec![PortBinding::new("out", PortDirection::Output, PortKind::Queue, "q")])
            .unwrap();
        builder
            .register(sink, vec![PortBinding::new("in", PortDirection::Input, PortKind::Queue, "q")])
            .unwrap();
        builder.tag_recycle_edge("sink", "src");
        (Arc::new(builder.freeze().unwrap()), count)
    }

    #[test]
    fn run_drains_a_small_topology_to_completion() {
        let (topology, count) = build_small_topology(25);
        let mut config = SupervisorConfig::default();
        config.nthreads = 2;
        config.ticker_interval = Duration::from_millis(5);
        let supervisor = Supervisor::new(topology, config);

        supervisor.run().unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 25);
        assert_eq!(supervisor.state(), RunState::Stopped);
    }

    #[test]
    fn sigint_policy_escalates_through_the_supervisor() {
        let (topology, _count) = build_small_topology(1);
        let supervisor = Supervisor::new(topology, SupervisorConfig::default());
        assert_eq!(supervisor.handle_sigint(), SignalAction::Pause);
        assert_eq!(supervisor.handle_sigint(), SignalAction::GracefulStop);
    }
}
