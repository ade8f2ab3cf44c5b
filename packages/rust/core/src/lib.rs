//! Job execution and pool orchestration for folio.
//!
//! Bottom-up:
//! - [`limiter`]: per-job cap on simultaneous fragment fetches, with spacing
//! - [`fragment`]: fetch and extract a single fragment
//! - [`retry`]: repeated passes over unresolved fragments, then placeholders
//! - [`job`]: the manifest → fragments → bundle state machine
//! - [`worker`]: isolated worker tasks and their message protocol
//! - [`coordinator`]: the [`WorkerPool`] actor
//! - [`pipeline`]: listing resolution plus a full pool run

pub mod coordinator;
pub mod fragment;
pub mod job;
pub mod limiter;
pub mod pipeline;
pub mod retry;
pub mod worker;

pub use coordinator::{PoolObserver, SilentObserver, WorkerPhase, WorkerPool};
pub use job::{Job, JobContext, JobPhase, JobSettings};
pub use limiter::ConcurrencyLimiter;
pub use pipeline::{ProgressReporter, RunSummary, SilentProgress, run, run_with};
pub use retry::{Resolution, RetryController};
pub use worker::{
    FragmentJobRunner, HttpRunnerFactory, JobRunner, RunnerFactory, WorkerCommand, WorkerMessage,
};
