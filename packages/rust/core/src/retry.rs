//! Retry controller: repeated passes over unresolved fragments.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

use folio_shared::{Fragment, Result};

use crate::fragment::{FAILED_FRAGMENT_BODY, ResolvedFragment, placeholder_title};
use crate::limiter::ConcurrencyLimiter;

/// Extra passes after the initial one.
pub const EXTRA_PASSES: usize = 2;

/// Outcome of resolving every fragment of a job.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// One entry per manifest entry, in manifest order, every body set.
    pub fragments: Vec<Fragment>,
    /// Entries filled with a placeholder.
    pub failed: usize,
    /// Retry passes that actually ran (0..=EXTRA_PASSES).
    pub retry_passes: usize,
}

#[derive(Debug, Clone)]
pub struct RetryController {
    extra_passes: usize,
    cooldown: Duration,
}

impl RetryController {
    /// The cooldown between passes is twice the limiter's inter-request delay.
    pub fn for_limiter(limiter: &ConcurrencyLimiter) -> Self {
        Self {
            extra_passes: EXTRA_PASSES,
            cooldown: limiter.delay() * 2,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Resolve every fragment named in `titles`.
    ///
    /// `task(index)` fetches one fragment. `progress(completed, total)` is called
    /// after every newly resolved fragment and once more when the array is full.
    pub async fn resolve<F, Fut>(
        &self,
        limiter: &ConcurrencyLimiter,
        titles: &[String],
        task: F,
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Resolution
    where
        F: Fn(usize) -> Fut,
        Fut: Future<Output = Result<ResolvedFragment>> + Send + 'static,
    {
        let total = titles.len();
        let mut fragments: Vec<Fragment> = titles
            .iter()
            .enumerate()
            .map(|(index, title)| Fragment::pending(index, title.clone()))
            .collect();
        let mut completed = 0usize;

        let mut pending: Vec<usize> = (0..total).collect();
        let mut retry_passes = 0;

        for pass in 0..=self.extra_passes {
            if pass > 0 {
                pending = unresolved(&fragments);
                if pending.is_empty() {
                    break;
                }
                info!(pass, remaining = pending.len(), "retrying unresolved fragments");
                if !self.cooldown.is_zero() {
                    tokio::time::sleep(self.cooldown).await;
                }
                retry_passes = pass;
            }

            limiter
                .run_batch(&pending, &task, |index, outcome| match outcome {
                    Ok(resolved) => {
                        let slot = &mut fragments[index];
                        if slot.body.is_none() {
                            completed += 1;
                        }
                        slot.title = resolved.title;
                        slot.body = Some(resolved.body);
                        progress(completed, total);
                    }
                    Err(e) => debug!(index, pass, error = %e, "fragment left for retry"),
                })
                .await;
        }

        let mut failed = 0;
        for fragment in fragments.iter_mut().filter(|f| f.body.is_none()) {
            fragment.title = placeholder_title(fragment.index, &fragment.title);
            fragment.body = Some(FAILED_FRAGMENT_BODY.to_string());
            failed += 1;
        }
        if failed > 0 {
            warn!(failed, total, "fragments replaced with placeholders");
        }
        progress(total, total);

        Resolution {
            fragments,
            failed,
            retry_passes,
        }
    }
}

fn unresolved(fragments: &[Fragment]) -> Vec<usize> {
    fragments
        .iter()
        .filter(|f| !f.is_resolved())
        .map(|f| f.index)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use folio_shared::FolioError;

    fn titles(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("Chapter {}", i + 1)).collect()
    }

    /// Counts calls per index; index fails while its call count is below `fail_until[index]`.
    #[derive(Clone, Default)]
    struct FlakyTask {
        calls: Arc<Mutex<HashMap<usize, usize>>>,
        fail_until: Arc<HashMap<usize, usize>>,
    }

    impl FlakyTask {
        fn new(fail_until: &[(usize, usize)]) -> Self {
            Self {
                calls: Arc::default(),
                fail_until: Arc::new(fail_until.iter().copied().collect()),
            }
        }

        fn call(
            &self,
            index: usize,
        ) -> impl Future<Output = Result<ResolvedFragment>> + Send + 'static {
            let attempt = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(index).or_default();
                *n += 1;
                *n
            };
            let limit = self.fail_until.get(&index).copied().unwrap_or(0);
            async move {
                if attempt <= limit {
                    Err(FolioError::Network(format!("fragment {index} attempt {attempt}")))
                } else {
                    Ok(ResolvedFragment {
                        title: format!("Resolved {index}"),
                        body: format!("<p>{index}</p>"),
                    })
                }
            }
        }

        fn calls_for(&self, index: usize) -> usize {
            self.calls.lock().unwrap().get(&index).copied().unwrap_or(0)
        }
    }

    fn controller() -> (ConcurrencyLimiter, RetryController) {
        let limiter = ConcurrencyLimiter::new(3, Duration::ZERO);
        let retry = RetryController::for_limiter(&limiter);
        (limiter, retry)
    }

    #[tokio::test]
    async fn failed_fragment_resolves_on_first_retry_pass() {
        let (limiter, retry) = controller();
        let task = FlakyTask::new(&[(2, 1)]);
        let mut reports = Vec::new();

        let resolution = retry
            .resolve(&limiter, &titles(5), |i| task.call(i), &mut |c, t| {
                reports.push((c, t))
            })
            .await;

        assert_eq!(resolution.failed, 0);
        assert_eq!(resolution.retry_passes, 1);
        assert_eq!(resolution.fragments.len(), 5);
        assert!(resolution.fragments.iter().all(Fragment::is_resolved));
        assert_eq!(resolution.fragments[2].title, "Resolved 2");
        assert_eq!(task.calls_for(2), 2);
        assert_eq!(task.calls_for(0), 1);
        assert_eq!(reports.last(), Some(&(5, 5)));
    }

    #[tokio::test]
    async fn fragment_failing_two_passes_resolves_on_the_last() {
        let (limiter, retry) = controller();
        let task = FlakyTask::new(&[(2, 2)]);

        let resolution = retry
            .resolve(&limiter, &titles(5), |i| task.call(i), &mut |_, _| {})
            .await;

        assert_eq!(resolution.failed, 0);
        assert_eq!(resolution.retry_passes, 2);
        assert_eq!(task.calls_for(2), 3);
    }

    #[tokio::test]
    async fn all_failures_become_placeholders() {
        let (limiter, retry) = controller();
        let always = (0..4).map(|i| (i, usize::MAX)).collect::<Vec<_>>();
        let task = FlakyTask::new(&always);

        let names = vec!["Intro".to_string(), String::new(), "C".into(), "D".into()];

        let resolution = retry
            .resolve(&limiter, &names, |i| task.call(i), &mut |_, _| {})
            .await;

        assert_eq!(resolution.failed, 4);
        assert_eq!(resolution.fragments.len(), 4);
        assert_eq!(resolution.fragments[0].title, "Intro");
        assert_eq!(resolution.fragments[1].title, "Fragment 2");
        assert!(
            resolution
                .fragments
                .iter()
                .all(|f| f.body.as_deref() == Some(FAILED_FRAGMENT_BODY))
        );
    }

    #[tokio::test]
    async fn at_most_two_extra_passes() {
        let (limiter, retry) = controller();
        let task = FlakyTask::new(&[(1, usize::MAX)]);

        let resolution = retry
            .resolve(&limiter, &titles(3), |i| task.call(i), &mut |_, _| {})
            .await;

        assert_eq!(resolution.retry_passes, 2);
        assert_eq!(resolution.failed, 1);
        // Initial pass + two retries.
        assert_eq!(task.calls_for(1), 3);
        assert_eq!(task.calls_for(0), 1);
    }

    #[tokio::test]
    async fn no_retry_when_everything_resolves() {
        let (limiter, retry) = controller();
        let task = FlakyTask::new(&[]);

        let resolution = retry
            .resolve(&limiter, &titles(3), |i| task.call(i), &mut |_, _| {})
            .await;

        assert_eq!(resolution.retry_passes, 0);
        assert_eq!(resolution.failed, 0);
    }

    #[test]
    fn cooldown_is_twice_the_delay() {
        let limiter = ConcurrencyLimiter::new(3, Duration::from_millis(500));
        assert_eq!(RetryController::for_limiter(&limiter).cooldown(), Duration::from_secs(1));
    }
}
