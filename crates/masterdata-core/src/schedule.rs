//! Cancellable repeating background tasks.
//!
//! A [`ScheduledTask`] owns its timer: cancelling it or dropping the handle
//! stops the loop, so a periodic check can never outlive whatever started it.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("no async runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

/// Cancellation token for background work
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct ScheduledTask {
    name: String,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Run `tick` every `period`, first after one full period.
    ///
    /// The loop ends when `tick` returns `ControlFlow::Break`, or when the
    /// task is cancelled or dropped.
    pub fn every<F, Fut>(
        name: impl Into<String>,
        period: Duration,
        mut tick: F,
    ) -> Result<Self, ScheduleError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()?;
        let name = name.into();
        let token = CancellationToken::new();
        let period = period.max(Duration::from_millis(1));

        let loop_token = token.clone();
        let loop_name = name.clone();
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if loop_token.is_cancelled() {
                    break;
                }
                if tick().await.is_break() {
                    break;
                }
            }
            tracing::debug!("Scheduled task {} stopped", loop_name);
        });

        tracing::debug!("Scheduled task {} started every {:?}", name, period);
        Ok(Self {
            name,
            token,
            handle: Some(handle),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn cancel(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
