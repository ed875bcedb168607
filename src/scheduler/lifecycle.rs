//! Start/stop control for periodic background work.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// One iteration of a background loop.
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    async fn run_once(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Stopped,
    Running,
    Stopping,
}

struct LoopInner {
    state: LoopState,
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

/// A periodic task that runs once at start, then on every tick.
///
/// A second `start` while running fails with `AlreadyRunning`; `stop` waits
/// for the in-flight iteration and is a no-op when not running.
pub struct BackgroundLoop {
    name: &'static str,
    interval: Duration,
    inner: Mutex<LoopInner>,
}

impl BackgroundLoop {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval: interval.max(Duration::from_millis(1)),
            inner: Mutex::new(LoopInner {
                state: LoopState::Stopped,
                cancel: None,
                handle: None,
            }),
        }
    }

    /// Spawn the loop. It also stops when `parent` is cancelled.
    pub fn start(&self, parent: &CancellationToken, task: Arc<dyn PeriodicTask>) -> Result<()> {
        let mut inner = self.inner.lock();
        reap_finished(&mut inner);
        if inner.state != LoopState::Stopped {
            return Err(Error::AlreadyRunning(self.name));
        }

        let token = parent.child_token();
        let handle = tokio::spawn(run_loop(task, self.interval, token.clone()));

        inner.state = LoopState::Running;
        inner.cancel = Some(token);
        inner.handle = Some(handle);

        tracing::info!("{}: started (interval {:?})", self.name, self.interval);
        Ok(())
    }

    /// Signal the loop and wait for the current iteration to finish.
    ///
    /// If this future is dropped before the loop exits, the loop is left
    /// `Stopping` and a later `stop` or `state` call picks it up.
    pub async fn stop(&self) {
        let (token, handle) = {
            let mut inner = self.inner.lock();
            reap_finished(&mut inner);
            match inner.state {
                LoopState::Stopped => return,
                // Another stop is already draining the task.
                LoopState::Stopping if inner.handle.is_none() => return,
                LoopState::Running | LoopState::Stopping => inner.state = LoopState::Stopping,
            }
            (inner.cancel.take(), inner.handle.take())
        };

        if let Some(token) = token {
            token.cancel();
        }
        let mut pending = PendingStop {
            inner: &self.inner,
            handle,
        };
        if let Some(handle) = pending.handle.as_mut() {
            if let Err(e) = handle.await {
                tracing::error!("{}: task ended abnormally: {}", self.name, e);
            }
        }
        pending.handle = None;

        let mut inner = self.inner.lock();
        inner.state = LoopState::Stopped;
        inner.handle = None;
        tracing::info!("{}: stopped", self.name);
    }

    pub fn state(&self) -> LoopState {
        let mut inner = self.inner.lock();
        reap_finished(&mut inner);
        inner.state
    }
}

/// Hands the join handle back to the loop if `stop` is dropped mid-drain.
struct PendingStop<'a> {
    inner: &'a Mutex<LoopInner>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for PendingStop<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.inner.lock().handle = Some(handle);
        }
    }
}

/// A loop whose parent token fired, or whose `stop` was abandoned, may have
/// exited without anyone marking it stopped.
fn reap_finished(inner: &mut LoopInner) {
    let finished = inner.handle.as_ref().is_some_and(|h| h.is_finished());
    if inner.state != LoopState::Stopped && finished {
        inner.state = LoopState::Stopped;
        inner.cancel = None;
        inner.handle = None;
    }
}

async fn run_loop(task: Arc<dyn PeriodicTask>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => task.run_once().await,
        }
    }
}
