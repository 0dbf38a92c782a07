//! # Task Scheduler
//!
//! Abstraction over how stage workers are spawned and joined. The dispatcher only
//! sees [`TaskScheduler`] and [`TaskHandle`]; [`TokioTaskScheduler`] runs workers
//! as tokio tasks behind a semaphore that caps how many run at once.
//!
//! A worker that panics or is aborted surfaces as a [`SchedulerError`] on join and
//! never takes down its siblings.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{BatchflowError, Result, SchedulerError};
use crate::orchestration::worker::WorkerReport;

/// Unit of work handed to a scheduler.
pub type WorkerTask = BoxFuture<'static, Result<WorkerReport>>;

#[async_trait]
pub trait TaskHandle: Send + fmt::Debug {
    fn name(&self) -> &str;

    /// Wait for the task. Safe to call again after a timed-out wait.
    async fn join(&mut self) -> std::result::Result<WorkerReport, SchedulerError>;

    /// Request cancellation; a later `join` reports [`SchedulerError::Cancelled`].
    fn abort(&self);
}

pub trait TaskScheduler: Send + Sync + fmt::Debug {
    fn spawn(&self, name: String, task: WorkerTask) -> Box<dyn TaskHandle>;
}

/// Runs tasks on the ambient tokio runtime, at most `max_concurrent` at a time.
#[derive(Debug, Clone)]
pub struct TokioTaskScheduler {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl TokioTaskScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for TokioTaskScheduler {
    fn default() -> Self {
        Self::new(Semaphore::MAX_PERMITS.min(1_024))
    }
}

impl TaskScheduler for TokioTaskScheduler {
    fn spawn(&self, name: String, task: WorkerTask) -> Box<dyn TaskHandle> {
        let permits = Arc::clone(&self.permits);
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.map_err(|_| {
                BatchflowError::Scheduler(SchedulerError::Cancelled {
                    task: task_name.clone(),
                })
            })?;
            debug!(task = %task_name, "🚀 SCHEDULER: task started");
            task.await
        });
        Box::new(TokioTaskHandle { name, handle })
    }
}

#[derive(Debug)]
pub struct TokioTaskHandle {
    name: String,
    handle: JoinHandle<Result<WorkerReport>>,
}

#[async_trait]
impl TaskHandle for TokioTaskHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn join(&mut self) -> std::result::Result<WorkerReport, SchedulerError> {
        match (&mut self.handle).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => Err(SchedulerError::Failed {
                task: self.name.clone(),
                message: e.to_string(),
            }),
            Err(join_error) if join_error.is_panic() => {
                let message = panic_message(join_error.into_panic());
                warn!(task = %self.name, %message, "💥 SCHEDULER: task panicked");
                Err(SchedulerError::Panicked {
                    task: self.name.clone(),
                    message,
                })
            }
            Err(_) => Err(SchedulerError::Cancelled {
                task: self.name.clone(),
            }),
        }
    }

    fn abort(&self) {
        self.handle.abort();
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
