//! Per-job concurrency limiter for fragment fetches.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, warn};

/// Caps how many fragment tasks of one job run at once and spaces out their starts.
///
/// A limiter belongs to a single job. With one job per worker, the effective
/// fetch concurrency of a run is `workers × limit`.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    permits: Arc<Semaphore>,
    limit: usize,
    delay: Duration,
}

impl ConcurrencyLimiter {
    pub fn new(limit: usize, delay: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
            delay,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `task(index)` for every index, at most `limit` at a time.
    ///
    /// Before each task acquires its slot the limiter waits `delay`, except
    /// for the first task of the batch. `on_done` is called from this task
    /// (never concurrently) with each finished `(index, output)`. A task that
    /// panics produces no output; its index is simply not reported.
    pub async fn run_batch<F, Fut, T>(
        &self,
        indices: &[usize],
        task: F,
        mut on_done: impl FnMut(usize, T),
    ) where
        F: Fn(usize) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let mut running: JoinSet<(usize, T)> = JoinSet::new();

        for (position, &index) in indices.iter().enumerate() {
            if position > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            // Drain finished tasks while waiting for a free slot.
            let permit = loop {
                tokio::select! {
                    permit = self.permits.clone().acquire_owned() => break permit,
                    Some(joined) = running.join_next() => settle(joined, &mut on_done),
                }
            };
            let Ok(permit) = permit else {
                warn!(index, "limiter closed, remaining fragments left for retry");
                break;
            };

            let fut = task(index);
            running.spawn(async move {
                let _permit = permit;
                (index, fut.await)
            });
        }

        while let Some(joined) = running.join_next().await {
            settle(joined, &mut on_done);
        }
    }
}

fn settle<T>(joined: Result<(usize, T), JoinError>, on_done: &mut impl FnMut(usize, T)) {
    match joined {
        Ok((index, output)) => on_done(index, output),
        Err(e) => error!(error = %e, "fragment task aborted"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[tokio::test]
    async fn never_exceeds_limit() {
        let limiter = ConcurrencyLimiter::new(3, Duration::ZERO);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let indices: Vec<usize> = (0..12).collect();
        let mut done = Vec::new();

        limiter
            .run_batch(
                &indices,
                |index| {
                    let active = active.clone();
                    let peak = peak.clone();
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        index * 10
                    }
                },
                |index, out| done.push((index, out)),
            )
            .await;

        assert_eq!(peak.load(Ordering::SeqCst), 3);
        done.sort();
        assert_eq!(done.len(), 12);
        assert_eq!(done[11], (11, 110));
    }

    #[tokio::test]
    async fn spaces_out_task_starts() {
        let limiter = ConcurrencyLimiter::new(8, Duration::from_millis(20));
        let start = Instant::now();
        let mut count = 0;

        limiter
            .run_batch(&[0, 1, 2, 3], |_| async {}, |_, _| count += 1)
            .await;

        assert_eq!(count, 4);
        // Three gaps; the first task starts immediately.
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn panicking_task_is_not_reported() {
        let limiter = ConcurrencyLimiter::new(2, Duration::ZERO);
        let mut done = Vec::new();

        limiter
            .run_batch(
                &[0, 1, 2],
                |index| async move {
                    if index == 1 {
                        panic!("bad fragment");
                    }
                    index
                },
                |index, _| done.push(index),
            )
            .await;

        done.sort();
        assert_eq!(done, vec![0, 2]);
    }
}
