//! Workers: isolated execution contexts that run one job at a time.
//!
//! Each worker is a tokio task that talks to the coordinator only through
//! channels carrying [`WorkerCommand`] and [`WorkerMessage`]. A second
//! supervisor task awaits the worker's `JoinHandle` and reports how it ended,
//! so a panic inside a job surfaces as a [`WorkerEventKind::Fault`] instead
//! of taking the coordinator down.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use folio_bundle::Assembler;
use folio_fetch::{ContentExtractor, HttpFetcher};
use folio_shared::{FetchConfig, JobRequest, JobResult, Result};

use crate::job::{Job, JobContext, JobSettings};

/// Normal termination after an `exit` command.
pub const EXIT_OK: i32 = 0;
/// The command channel closed without an `exit`.
pub const EXIT_ORPHANED: i32 = 1;
/// The worker's context could not be built.
pub const EXIT_INIT_FAILED: i32 = 2;

/// Progress is reported every this many completed fragments, and on completion.
pub const PROGRESS_EVERY: usize = 20;

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

/// Coordinator → worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    Download(JobRequest),
    Exit,
}

/// Worker → coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Ready,
    Progress {
        id: String,
        title: String,
        completed: usize,
        total: usize,
    },
    Result(JobResult),
}

/// What the coordinator receives, tagged with the sender's slot and generation.
#[derive(Debug)]
pub struct WorkerEvent {
    pub slot: usize,
    pub generation: u64,
    pub kind: WorkerEventKind,
}

#[derive(Debug)]
pub enum WorkerEventKind {
    Message(WorkerMessage),
    /// The execution context panicked.
    Fault(String),
    /// The execution context returned with this exit code.
    Exited(i32),
}

// ---------------------------------------------------------------------------
// Runners
// ---------------------------------------------------------------------------

/// Runs one job to completion inside a worker.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(
        &self,
        request: JobRequest,
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> JobResult;
}

/// Builds a worker's runner. Called inside the worker task, once per spawn.
pub trait RunnerFactory: Send + Sync {
    fn build(&self, slot: usize) -> Result<Box<dyn JobRunner>>;
}

impl<F> RunnerFactory for F
where
    F: Fn(usize) -> Result<Box<dyn JobRunner>> + Send + Sync,
{
    fn build(&self, slot: usize) -> Result<Box<dyn JobRunner>> {
        self(slot)
    }
}

/// The production runner: every request becomes a fresh [`Job`].
pub struct FragmentJobRunner {
    context: Arc<JobContext>,
}

impl FragmentJobRunner {
    pub fn new(context: JobContext) -> Self {
        Self {
            context: Arc::new(context),
        }
    }
}

#[async_trait]
impl JobRunner for FragmentJobRunner {
    async fn run(
        &self,
        request: JobRequest,
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> JobResult {
        Job::new(request, self.context.clone()).run(progress).await
    }
}

/// Gives every worker its own [`HttpFetcher`] (and so its own connection pool).
pub struct HttpRunnerFactory {
    fetch: FetchConfig,
    extractor: Arc<dyn ContentExtractor>,
    assembler: Arc<dyn Assembler>,
    settings: JobSettings,
}

impl HttpRunnerFactory {
    pub fn new(
        fetch: FetchConfig,
        extractor: Arc<dyn ContentExtractor>,
        assembler: Arc<dyn Assembler>,
        settings: JobSettings,
    ) -> Self {
        Self {
            fetch,
            extractor,
            assembler,
            settings,
        }
    }
}

impl RunnerFactory for HttpRunnerFactory {
    fn build(&self, slot: usize) -> Result<Box<dyn JobRunner>> {
        let fetcher = HttpFetcher::new(&self.fetch)?;
        debug!(slot, "worker http client ready");
        Ok(Box::new(FragmentJobRunner::new(JobContext {
            fetcher: Arc::new(fetcher),
            extractor: self.extractor.clone(),
            assembler: self.assembler.clone(),
            settings: self.settings.clone(),
        })))
    }
}

// ---------------------------------------------------------------------------
// Worker task
// ---------------------------------------------------------------------------

/// Coordinator-side handle to a spawned worker.
pub(crate) struct WorkerHandle {
    pub commands: mpsc::UnboundedSender<WorkerCommand>,
    pub supervisor: JoinHandle<()>,
}

#[derive(Clone)]
struct Outbox {
    slot: usize,
    generation: u64,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl Outbox {
    fn send(&self, kind: WorkerEventKind) {
        let event = WorkerEvent {
            slot: self.slot,
            generation: self.generation,
            kind,
        };
        if self.events.send(event).is_err() {
            debug!(slot = self.slot, "coordinator gone, dropping worker event");
        }
    }

    fn message(&self, message: WorkerMessage) {
        self.send(WorkerEventKind::Message(message));
    }
}

/// Spawn the worker for `slot` and its supervisor.
pub(crate) fn spawn_worker(
    slot: usize,
    generation: u64,
    factory: Arc<dyn RunnerFactory>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> WorkerHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let outbox = Outbox {
        slot,
        generation,
        events,
    };

    let worker = tokio::spawn(worker_loop(slot, factory, commands_rx, outbox.clone()));
    let supervisor = tokio::spawn(async move {
        let kind = match worker.await {
            Ok(code) => WorkerEventKind::Exited(code),
            Err(e) if e.is_panic() => WorkerEventKind::Fault(panic_message(e.into_panic())),
            Err(e) => WorkerEventKind::Fault(e.to_string()),
        };
        outbox.send(kind);
    });

    WorkerHandle {
        commands: commands_tx,
        supervisor,
    }
}

async fn worker_loop(
    slot: usize,
    factory: Arc<dyn RunnerFactory>,
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
    outbox: Outbox,
) -> i32 {
    let runner = match factory.build(slot) {
        Ok(runner) => runner,
        Err(e) => {
            error!(slot, error = %e, "worker context failed to start");
            return EXIT_INIT_FAILED;
        }
    };
    outbox.message(WorkerMessage::Ready);

    while let Some(command) = commands.recv().await {
        match command {
            WorkerCommand::Download(request) => {
                debug!(slot, id = %request.id, "job received");
                let mut sampler = ProgressSampler::default();
                let id = request.id.clone();
                let title = request.title.clone();

                let result = runner
                    .run(request, &mut |completed, total| {
                        if sampler.should_report(completed, total) {
                            outbox.message(WorkerMessage::Progress {
                                id: id.clone(),
                                title: title.clone(),
                                completed,
                                total,
                            });
                        }
                    })
                    .await;

                outbox.message(WorkerMessage::Result(result));
            }
            WorkerCommand::Exit => {
                info!(slot, "worker exiting");
                return EXIT_OK;
            }
        }
    }

    EXIT_ORPHANED
}

/// Thins fragment-level progress down to every [`PROGRESS_EVERY`] completions plus the last one.
#[derive(Debug, Default)]
struct ProgressSampler {
    last: Option<usize>,
}

impl ProgressSampler {
    fn should_report(&mut self, completed: usize, total: usize) -> bool {
        if self.last == Some(completed) {
            return false;
        }
        let due = completed == total || completed % PROGRESS_EVERY == 0;
        if due {
            self.last = Some(completed);
        }
        due
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::tests::{StubFetcher, context, request, temp_output};
    use folio_shared::FolioError;

    struct EchoRunner;

    #[async_trait]
    impl JobRunner for EchoRunner {
        async fn run(
            &self,
            request: JobRequest,
            progress: &mut (dyn FnMut(usize, usize) + Send),
        ) -> JobResult {
            if request.id == "boom" {
                panic!("runner exploded");
            }
            for done in 1..=45 {
                progress(done, 45);
            }
            JobResult::success(&request, 45, 0, "out.md".into())
        }
    }

    fn echo_factory() -> Arc<dyn RunnerFactory> {
        Arc::new(|_slot: usize| -> Result<Box<dyn JobRunner>> { Ok(Box::new(EchoRunner)) })
    }

    async fn next(events: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> WorkerEventKind {
        events.recv().await.expect("event").kind
    }

    #[test]
    fn protocol_shapes() {
        let cmd = WorkerCommand::Download(request("lost-sea", 3));
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "download");
        assert_eq!(json["id"], "lost-sea");
        assert!(json["url"].as_str().unwrap().starts_with("https://"));

        let exit = serde_json::to_string(&WorkerCommand::Exit).unwrap();
        assert_eq!(exit, r#"{"type":"exit"}"#);

        let result = WorkerMessage::Result(JobResult::skipped(&request("huge", 1), 5000, "ceiling"));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["type"], "result");
        assert_eq!(json["success"], false);
        assert_eq!(json["skipped"], true);
        assert_eq!(json["totalFragments"], 5000);

        let parsed: WorkerMessage = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, result);
    }

    #[test]
    fn progress_sampling() {
        let mut sampler = ProgressSampler::default();
        let reported: Vec<usize> = (1..=45).filter(|&c| sampler.should_report(c, 45)).collect();
        assert_eq!(reported, vec![20, 40, 45]);
        assert!(!sampler.should_report(45, 45));
    }

    #[tokio::test]
    async fn ready_job_and_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_worker(0, 0, echo_factory(), tx);

        assert!(matches!(next(&mut rx).await, WorkerEventKind::Message(WorkerMessage::Ready)));

        handle.commands.send(WorkerCommand::Download(request("a", 45))).unwrap();
        let mut progress = Vec::new();
        loop {
            match next(&mut rx).await {
                WorkerEventKind::Message(WorkerMessage::Progress { completed, .. }) => {
                    progress.push(completed)
                }
                WorkerEventKind::Message(WorkerMessage::Result(result)) => {
                    assert!(result.is_success());
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(progress, vec![20, 40, 45]);

        handle.commands.send(WorkerCommand::Exit).unwrap();
        assert!(matches!(next(&mut rx).await, WorkerEventKind::Exited(EXIT_OK)));
        handle.supervisor.await.unwrap();
    }

    #[tokio::test]
    async fn panic_becomes_fault() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_worker(3, 7, echo_factory(), tx);
        let _ = next(&mut rx).await;

        handle.commands.send(WorkerCommand::Download(request("boom", 1))).unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!((event.slot, event.generation), (3, 7));
        match event.kind {
            WorkerEventKind::Fault(message) => assert!(message.contains("runner exploded")),
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_channel_exits_non_zero() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_worker(0, 0, echo_factory(), tx);
        let _ = next(&mut rx).await;

        drop(handle.commands);
        assert!(matches!(next(&mut rx).await, WorkerEventKind::Exited(EXIT_ORPHANED)));
    }

    #[tokio::test]
    async fn failed_init_never_reports_ready() {
        let factory: Arc<dyn RunnerFactory> =
            Arc::new(|_slot: usize| -> Result<Box<dyn JobRunner>> {
                Err(FolioError::config("no client"))
            });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = spawn_worker(0, 0, factory, tx);

        assert!(matches!(next(&mut rx).await, WorkerEventKind::Exited(EXIT_INIT_FAILED)));
    }

    #[tokio::test]
    async fn fragment_runner_runs_real_jobs() {
        let out = temp_output();
        let fetcher = Arc::new(StubFetcher::default());
        let runner = FragmentJobRunner::new(context(fetcher, 2, out.clone()));

        let result = runner.run(request("small", 2), &mut |_, _| {}).await;
        assert!(result.is_success());
        assert_eq!(result.total_fragments, 2);

        let _ = std::fs::remove_dir_all(&out);
    }
}
