//! Supervised background tasks.
//!
//! A [`SupervisedTask`] owns one worker future. Stopping is cooperative: the
//! worker observes its [`CancellationToken`] at its next suspension point and
//! [`SupervisedTask::stop`] waits for it to finish. Panics and errors are
//! caught at the task boundary and reported as `"Crashed"` on the task's
//! status key instead of unwinding further.

use crate::{Result, status::StatusHandle};
use futures::FutureExt;
use std::{any::Any, future::Future, panic::AssertUnwindSafe};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const STATUS_STOPPED: &str = "Stopped";
pub const STATUS_CRASHED: &str = "Crashed";

/// How a supervised task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskExit {
    /// Returned after a stop request.
    Stopped,
    /// Panicked, returned an error, or returned without being asked to.
    Crashed,
}

#[derive(Debug)]
pub struct SupervisedTask {
    name: String,
    cancel: CancellationToken,
    handle: JoinHandle<TaskExit>,
}

impl SupervisedTask {
    /// Spawn `body` with a fresh cancellation token.
    pub fn spawn<F, Fut>(name: impl Into<String>, status: StatusHandle, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let cancel = CancellationToken::new();
        let work = body(cancel.clone());

        let task_name = name.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let exit = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(Ok(())) if token.is_cancelled() => TaskExit::Stopped,
                Ok(Ok(())) => {
                    error!(task = %task_name, "task exited without a stop request");
                    TaskExit::Crashed
                }
                Ok(Err(err)) => {
                    error!(task = %task_name, ?err, "task failed");
                    TaskExit::Crashed
                }
                Err(panic) => {
                    error!(task = %task_name, panic = %panic_message(panic.as_ref()), "task crashed");
                    TaskExit::Crashed
                }
            };

            match exit {
                TaskExit::Stopped => {
                    info!(task = %task_name, "stopped");
                    status.update(STATUS_STOPPED);
                }
                TaskExit::Crashed => status.update(STATUS_CRASHED),
            }
            exit
        });

        Self {
            name,
            cancel,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Request a stop without waiting for it.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Request a stop and wait until the task has released its resources.
    pub async fn stop(self) -> TaskExit {
        self.cancel.cancel();
        match self.handle.await {
            Ok(exit) => exit,
            Err(err) => {
                error!(task = %self.name, ?err, "task join failed");
                TaskExit::Crashed
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
