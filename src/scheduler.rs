use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Outcome of one failed cycle of a background loop.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("recoverable: {0:#}")]
    Recoverable(anyhow::Error),

    #[error("fatal: {0:#}")]
    Fatal(anyhow::Error),
}

/// Periodic driver for a background loop.
///
/// Successful cycles are followed by `interval`, recoverable failures by
/// `retry_delay`; a fatal failure ends the loop with the error. The loop
/// also ends when the quit signal flips to `true`, without cancelling a cycle
/// that is already running.
#[derive(Debug, Clone)]
pub struct Ticker {
    name: String,
    interval: Duration,
    retry_delay: Duration,
}

impl Ticker {
    pub fn new(name: impl Into<String>, interval: Duration, retry_delay: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
            retry_delay,
        }
    }

    pub async fn run<F, Fut>(
        &self,
        mut quit: watch::Receiver<bool>,
        mut cycle: F,
    ) -> anyhow::Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), CycleError>>,
    {
        info!("Starting {} loop", self.name);

        loop {
            if *quit.borrow() {
                break;
            }

            let delay = match cycle().await {
                Ok(()) => self.interval,
                Err(CycleError::Recoverable(e)) => {
                    warn!(
                        "{} cycle aborted, retrying in {:?}: {:#}",
                        self.name, self.retry_delay, e
                    );
                    self.retry_delay
                }
                Err(CycleError::Fatal(e)) => {
                    error!("{} loop stopped: {:#}", self.name, e);
                    return Err(e.context(format!("{} loop failed", self.name)));
                }
            };

            tokio::select! {
                _ = sleep(delay) => {}
                changed = quit.changed() => {
                    // A dropped sender also means nobody can keep us running.
                    if changed.is_err() || *quit.borrow() {
                        break;
                    }
                }
            }
        }

        info!("{} loop stopped", self.name);
        Ok(())
    }
}
