use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Priority of a service, determines its restart behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePriority {
    /// The read loop: restarts immediately, retries forever.
    Critical,
    /// Reconciler, config apply, diagnostics: restart with backoff.
    Important,
}

impl ServicePriority {
    fn max_retries(self) -> u32 {
        match self {
            Self::Critical => u32::MAX,
            Self::Important => 10,
        }
    }

    fn backoff(self, retry: u32) -> Duration {
        match self {
            Self::Critical => Duration::from_millis(100 * u64::from(retry)),
            Self::Important => Duration::from_secs(u64::from(retry)),
        }
    }
}

/// Run a service in a supervised tokio task, restarting it on failure or
/// panic according to its priority. The retry counter resets once a
/// service has stayed up for a minute.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    priority: ServicePriority,
    factory: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let factory = Arc::new(factory);
    tokio::spawn(async move {
        let max_retries = priority.max_retries();
        let mut retries: u32 = 0;
        let mut last_restart = Instant::now();

        loop {
            info!("[supervisor] starting service: {name}");

            let f = Arc::clone(&factory);
            let result = tokio::spawn(async move { f().await }).await;

            match result {
                Ok(Ok(())) => {
                    info!("[supervisor] {name} exited cleanly");
                    break;
                }
                Ok(Err(e)) => {
                    error!("[supervisor] {name} failed: {e:#}");
                }
                Err(join_error) => {
                    error!("[supervisor] {name} task panicked: {join_error}");
                }
            }

            if last_restart.elapsed() > Duration::from_secs(60) {
                retries = 0;
            }
            retries = retries.saturating_add(1);

            if retries > max_retries {
                error!("[supervisor] {name} exceeded max retries ({max_retries}), giving up");
                break;
            }

            let backoff = priority.backoff(retries);
            warn!("[supervisor] {name} restarting in {backoff:?} (attempt {retries})");
            tokio::time::sleep(backoff).await;
            last_restart = Instant::now();
        }
    })
}
