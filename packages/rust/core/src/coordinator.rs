//! Worker pool coordinator.
//!
//! The pool is an actor: [`WorkerPool`] is a thin handle that sends control
//! messages to a single coordinator task. That task owns the slot table, the
//! FIFO queue, the idle set and the aggregate [`PoolStats`], and mutates them
//! only from its `select!` loop, so no locks are involved.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use folio_shared::{FolioError, JobRequest, JobResult, PoolStats, Result};

use crate::worker::{
    EXIT_OK, RunnerFactory, WorkerCommand, WorkerEvent, WorkerEventKind, WorkerMessage,
    spawn_worker,
};

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Receives pool notifications. Called from the coordinator task, so
/// implementations must not block.
pub trait PoolObserver: Send + Sync {
    fn job_started(&self, request: &JobRequest, slot: usize);
    fn job_progress(&self, id: &str, title: &str, completed: usize, total: usize);
    fn job_finished(&self, result: &JobResult, stats: &PoolStats);
    fn worker_respawned(&self, slot: usize, generation: u64);
}

/// No-op observer for headless/test usage.
pub struct SilentObserver;

impl PoolObserver for SilentObserver {
    fn job_started(&self, _request: &JobRequest, _slot: usize) {}
    fn job_progress(&self, _id: &str, _title: &str, _completed: usize, _total: usize) {}
    fn job_finished(&self, _result: &JobResult, _stats: &PoolStats) {}
    fn worker_respawned(&self, _slot: usize, _generation: u64) {}
}

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

/// Consecutive faults a slot may have before its worker sends `ready` again.
/// Past this the slot stays crashed.
pub const MAX_STARTUP_RESPAWNS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Starting,
    Ready,
    Busy,
    Idle,
    Crashed,
}

struct WorkerSlot {
    id: usize,
    generation: u64,
    phase: WorkerPhase,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    supervisor: Option<JoinHandle<()>>,
    job: Option<JobRequest>,
    /// Replacements in a row that faulted before becoming ready.
    startup_faults: u32,
}

impl WorkerSlot {
    fn spawn(
        id: usize,
        generation: u64,
        factory: &Arc<dyn RunnerFactory>,
        events: &mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        let handle = spawn_worker(id, generation, factory.clone(), events.clone());
        Self {
            id,
            generation,
            phase: WorkerPhase::Starting,
            commands: handle.commands,
            supervisor: Some(handle.supervisor),
            job: None,
            startup_faults: 0,
        }
    }

    fn is_alive(&self) -> bool {
        self.phase != WorkerPhase::Crashed
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

enum Control {
    Enqueue(Vec<JobRequest>),
    WaitUntilDone(oneshot::Sender<PoolStats>),
    Stats(oneshot::Sender<PoolStats>),
    Shutdown(oneshot::Sender<PoolStats>),
}

/// Handle to a running worker pool.
pub struct WorkerPool {
    control: mpsc::UnboundedSender<Control>,
    actor: JoinHandle<()>,
    size: usize,
}

impl WorkerPool {
    /// Spawn `size` workers and wait until each one is ready or has died.
    ///
    /// Fails only when no worker became ready.
    #[instrument(skip_all, fields(size = size))]
    pub async fn start(
        size: usize,
        factory: Arc<dyn RunnerFactory>,
        observer: Arc<dyn PoolObserver>,
    ) -> Result<Self> {
        if size == 0 {
            return Err(FolioError::Pool("pool size must be at least 1".into()));
        }

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut slots: Vec<WorkerSlot> = (0..size)
            .map(|id| WorkerSlot::spawn(id, 0, &factory, &events_tx))
            .collect();

        let mut starting = size;
        while starting > 0 {
            let Some(event) = events_rx.recv().await else {
                break;
            };
            let slot = &mut slots[event.slot];
            match event.kind {
                WorkerEventKind::Message(WorkerMessage::Ready) => {
                    slot.phase = WorkerPhase::Ready;
                    starting -= 1;
                }
                WorkerEventKind::Fault(message) => {
                    error!(slot = slot.id, %message, "worker crashed during startup");
                    slot.phase = WorkerPhase::Crashed;
                    starting -= 1;
                }
                WorkerEventKind::Exited(code) => {
                    warn!(slot = slot.id, code, "worker exited during startup");
                    slot.phase = WorkerPhase::Crashed;
                    starting -= 1;
                }
                WorkerEventKind::Message(other) => {
                    debug!(slot = slot.id, ?other, "ignoring message before ready");
                }
            }
        }

        let ready = slots.iter().filter(|s| s.phase == WorkerPhase::Ready).count();
        if ready == 0 {
            return Err(FolioError::Pool(format!("none of {size} workers became ready")));
        }
        info!(ready, size, "worker pool started");

        let mut coordinator = Coordinator {
            slots,
            idle: VecDeque::new(),
            queue: VecDeque::new(),
            stats: PoolStats::default(),
            waiter: None,
            accepting: true,
            factory,
            events_tx,
            observer,
        };
        for id in 0..size {
            if coordinator.slots[id].phase == WorkerPhase::Ready {
                coordinator.mark_idle(id);
            }
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let actor = tokio::spawn(coordinator.run(control_rx, events_rx));

        Ok(Self {
            control: control_tx,
            actor,
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Append jobs to the FIFO queue and dispatch to idle workers.
    pub fn enqueue(&self, jobs: Vec<JobRequest>) -> Result<()> {
        self.send(Control::Enqueue(jobs))
    }

    /// Resolve once the queue is empty and nothing is in flight.
    ///
    /// Only one wait can be pending: a newer call replaces an older one, and
    /// the older call returns [`FolioError::Pool`].
    pub async fn wait_until_done(&self) -> Result<PoolStats> {
        let (tx, rx) = oneshot::channel();
        self.send(Control::WaitUntilDone(tx))?;
        rx.await
            .map_err(|_| FolioError::Pool("completion wait was superseded or the pool stopped".into()))
    }

    /// Current aggregate counters.
    pub async fn stats(&self) -> Result<PoolStats> {
        let (tx, rx) = oneshot::channel();
        self.send(Control::Stats(tx))?;
        rx.await.map_err(|_| FolioError::Pool("pool stopped".into()))
    }

    /// Stop dispatching, tell every worker to exit, and wait for all of them.
    pub async fn shutdown(self) -> Result<PoolStats> {
        let (tx, rx) = oneshot::channel();
        self.send(Control::Shutdown(tx))?;
        let stats = rx.await.map_err(|_| FolioError::Pool("pool stopped".into()))?;
        if let Err(e) = self.actor.await {
            warn!(error = %e, "coordinator task ended abnormally");
        }
        Ok(stats)
    }

    fn send(&self, control: Control) -> Result<()> {
        self.control
            .send(control)
            .map_err(|_| FolioError::Pool("coordinator is not running".into()))
    }
}

// ---------------------------------------------------------------------------
// Coordinator actor
// ---------------------------------------------------------------------------

struct Coordinator {
    slots: Vec<WorkerSlot>,
    idle: VecDeque<usize>,
    queue: VecDeque<JobRequest>,
    stats: PoolStats,
    waiter: Option<oneshot::Sender<PoolStats>>,
    accepting: bool,
    factory: Arc<dyn RunnerFactory>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    observer: Arc<dyn PoolObserver>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut control: mpsc::UnboundedReceiver<Control>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        loop {
            tokio::select! {
                command = control.recv() => match command {
                    Some(Control::Shutdown(reply)) => {
                        self.shutdown(&mut events).await;
                        let _ = reply.send(self.stats);
                        return;
                    }
                    Some(command) => self.handle_control(command),
                    None => {
                        debug!("pool handle dropped, shutting down");
                        self.shutdown(&mut events).await;
                        return;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }
    }

    fn handle_control(&mut self, command: Control) {
        match command {
            Control::Enqueue(jobs) => {
                debug!(count = jobs.len(), "jobs enqueued");
                self.queue.extend(jobs);
                self.dispatch();
                self.check_done();
            }
            Control::WaitUntilDone(reply) => {
                if self.is_done() {
                    let _ = reply.send(self.stats);
                } else if self.waiter.replace(reply).is_some() {
                    debug!("replacing pending completion wait");
                }
            }
            Control::Stats(reply) => {
                let _ = reply.send(self.stats);
            }
            Control::Shutdown(_) => {}
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        let Some(slot) = self.slots.get(event.slot) else {
            warn!(slot = event.slot, "event from unknown slot");
            return;
        };
        if slot.generation != event.generation {
            debug!(
                slot = event.slot,
                generation = event.generation,
                current = slot.generation,
                "ignoring event from stale worker"
            );
            return;
        }

        match event.kind {
            WorkerEventKind::Message(WorkerMessage::Ready) => {
                debug!(slot = event.slot, generation = event.generation, "worker ready");
                let slot = &mut self.slots[event.slot];
                slot.phase = WorkerPhase::Ready;
                slot.startup_faults = 0;
                self.mark_idle(event.slot);
                self.dispatch();
            }
            WorkerEventKind::Message(WorkerMessage::Progress {
                id,
                title,
                completed,
                total,
            }) => {
                self.observer.job_progress(&id, &title, completed, total);
            }
            WorkerEventKind::Message(WorkerMessage::Result(result)) => {
                self.on_result(event.slot, result);
            }
            WorkerEventKind::Fault(message) => self.on_fault(event.slot, message),
            WorkerEventKind::Exited(code) => self.on_exit(event.slot, code),
        }
        self.check_done();
    }

    fn on_result(&mut self, id: usize, result: JobResult) {
        let slot = &mut self.slots[id];
        if slot.job.take().is_none() {
            warn!(slot = id, job = %result.id, "result from a worker with no job");
            return;
        }

        self.stats.record(&result);
        debug!(slot = id, job = %result.id, outcome = ?result.outcome, "job finished");
        self.observer.job_finished(&result, &self.stats);

        if self.accepting {
            self.mark_idle(id);
            self.dispatch();
        }
    }

    fn on_fault(&mut self, id: usize, message: String) {
        let slot = &mut self.slots[id];
        let was_starting = slot.phase == WorkerPhase::Starting;
        slot.phase = WorkerPhase::Crashed;
        self.idle.retain(|&s| s != id);
        error!(slot = id, generation = slot.generation, %message, "worker fault");

        if let Some(job) = slot.job.take() {
            self.stats.record_fault();
            let result = JobResult::failure(
                &job,
                0,
                FolioError::WorkerFault {
                    slot: id,
                    message: message.clone(),
                },
            );
            self.observer.job_finished(&result, &self.stats);
        }

        let startup_faults = if was_starting {
            self.slots[id].startup_faults + 1
        } else {
            0
        };
        if !self.accepting {
            self.abandon_if_no_workers();
        } else if startup_faults > MAX_STARTUP_RESPAWNS {
            error!(slot = id, startup_faults, "worker keeps faulting during startup, giving up");
            self.abandon_if_no_workers();
        } else {
            self.respawn(id);
            self.slots[id].startup_faults = startup_faults;
        }
    }

    fn on_exit(&mut self, id: usize, code: i32) {
        let slot = &mut self.slots[id];
        if code == EXIT_OK {
            debug!(slot = id, "worker exited");
        } else {
            warn!(slot = id, code, "worker exited unexpectedly");
        }
        if slot.phase == WorkerPhase::Starting {
            slot.phase = WorkerPhase::Crashed;
            self.abandon_if_no_workers();
        }
    }

    fn respawn(&mut self, id: usize) {
        let generation = self.slots[id].generation + 1;
        info!(slot = id, generation, "respawning worker");
        self.slots[id] = WorkerSlot::spawn(id, generation, &self.factory, &self.events_tx);
        self.observer.worker_respawned(id, generation);
    }

    fn mark_idle(&mut self, id: usize) {
        self.slots[id].phase = WorkerPhase::Idle;
        if !self.idle.contains(&id) {
            self.idle.push_back(id);
        }
    }

    /// Pair idle workers with queued jobs in FIFO order.
    fn dispatch(&mut self) {
        if !self.accepting {
            return;
        }
        while !self.queue.is_empty() {
            let Some(id) = self.idle.pop_front() else {
                break;
            };
            let Some(job) = self.queue.pop_front() else {
                break;
            };

            let slot = &mut self.slots[id];
            if slot.commands.send(WorkerCommand::Download(job.clone())).is_err() {
                warn!(slot = id, job = %job.id, "worker unreachable, requeueing job");
                slot.phase = WorkerPhase::Crashed;
                self.queue.push_front(job);
                continue;
            }

            debug!(slot = id, job = %job.id, "job dispatched");
            slot.phase = WorkerPhase::Busy;
            self.observer.job_started(&job, id);
            slot.job = Some(job);
            self.stats.dispatched();
        }
        self.abandon_if_no_workers();
    }

    /// With every slot crashed, queued jobs can never run: fail them.
    fn abandon_if_no_workers(&mut self) {
        if self.queue.is_empty() || self.slots.iter().any(WorkerSlot::is_alive) {
            return;
        }
        error!(queued = self.queue.len(), "no live workers left, failing queued jobs");
        while let Some(job) = self.queue.pop_front() {
            self.stats.failed += 1;
            let result = JobResult::failure(&job, 0, FolioError::Pool("no live workers".into()));
            self.observer.job_finished(&result, &self.stats);
        }
    }

    fn is_done(&self) -> bool {
        self.queue.is_empty() && self.stats.in_flight == 0
    }

    fn check_done(&mut self) {
        if self.is_done() {
            if let Some(waiter) = self.waiter.take() {
                let _ = waiter.send(self.stats);
            }
        }
    }

    /// Stop dispatching, broadcast `exit`, and wait for every worker to end.
    ///
    /// Jobs already running finish; their results still count.
    async fn shutdown(&mut self, events: &mut mpsc::UnboundedReceiver<WorkerEvent>) {
        self.accepting = false;
        if !self.queue.is_empty() {
            warn!(queued = self.queue.len(), "shutting down with undispatched jobs");
        }

        for slot in &self.slots {
            let _ = slot.commands.send(WorkerCommand::Exit);
        }
        for slot in &mut self.slots {
            if let Some(supervisor) = slot.supervisor.take() {
                if let Err(e) = supervisor.await {
                    warn!(slot = slot.id, error = %e, "worker supervisor failed");
                }
            }
        }

        while let Ok(event) = events.try_recv() {
            self.handle_event(event);
        }
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(self.stats);
        }
        info!(
            succeeded = self.stats.succeeded,
            failed = self.stats.failed,
            skipped = self.stats.skipped,
            "worker pool stopped"
        );
    }
}
