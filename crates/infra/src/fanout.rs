//! Concurrent fan-out of named async operations.
//!
//! Every task runs on its own tokio task and reports exactly one
//! [`FanoutOutput`] over a channel, in completion order. The operation itself
//! runs in a nested task so panics, deadlines and cancellation all surface as
//! an output instead of a lost result.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type BoxedFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;
type BoxedOperation<T, E> = Box<dyn FnOnce(CancellationToken) -> BoxedFuture<T, E> + Send>;

/// A named unit of work. The operation receives a token that fires when the
/// fan-out is cancelled or the task's deadline passes.
pub struct FanoutTask<T, E> {
    name: String,
    operation: BoxedOperation<T, E>,
}

impl<T, E> FanoutTask<T, E> {
    pub fn new<F, Fut>(name: impl Into<String>, operation: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            name: name.into(),
            operation: Box::new(move |cancel| Box::pin(operation(cancel))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T, E> core::fmt::Debug for FanoutTask<T, E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FanoutTask").field("name", &self.name).finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FanoutError<E> {
    #[error("task failed: {0}")]
    Failed(E),

    #[error("task deadline exceeded")]
    DeadlineExceeded,

    #[error("task cancelled")]
    Cancelled,

    #[error("task panicked: {0}")]
    Panicked(String),
}

#[derive(Debug)]
pub struct FanoutOutput<T, E> {
    pub name: String,
    pub result: Result<T, FanoutError<E>>,
}

/// Receiving side of a fan-out. Yields one output per task, then `None`.
#[derive(Debug)]
pub struct FanoutStream<T, E> {
    rx: mpsc::Receiver<FanoutOutput<T, E>>,
}

impl<T, E> FanoutStream<T, E> {
    pub async fn recv(&mut self) -> Option<FanoutOutput<T, E>> {
        self.rx.recv().await
    }

    /// Drain every remaining output in completion order.
    pub async fn collect(mut self) -> Vec<FanoutOutput<T, E>> {
        let mut outputs = Vec::new();
        while let Some(output) = self.rx.recv().await {
            outputs.push(output);
        }
        outputs
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FanoutExecutor {
    deadline: Option<Duration>,
}

impl FanoutExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound every task run by this executor to `deadline`.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Start all tasks immediately. Must be called from within a tokio runtime.
    pub fn run_all<T, E>(
        &self,
        tasks: Vec<FanoutTask<T, E>>,
        cancel: &CancellationToken,
    ) -> FanoutStream<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let (tx, rx) = mpsc::channel(tasks.len().max(1));

        for task in tasks {
            let tx = tx.clone();
            let token = cancel.child_token();
            let deadline = self.deadline;

            tokio::spawn(async move {
                let FanoutTask { name, operation } = task;
                let result = supervise(&name, operation, token, deadline).await;
                if tx.send(FanoutOutput { name, result }).await.is_err() {
                    debug!("fan-out receiver dropped before output was delivered");
                }
            });
        }

        FanoutStream { rx }
    }
}

async fn supervise<T, E>(
    name: &str,
    operation: BoxedOperation<T, E>,
    token: CancellationToken,
    deadline: Option<Duration>,
) -> Result<T, FanoutError<E>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let mut inner = tokio::spawn(operation(token.clone()));

    let expiry = async {
        match deadline {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        joined = &mut inner => match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(FanoutError::Failed(e)),
            Err(e) => Err(join_failure(name, e)),
        },
        _ = token.cancelled() => {
            inner.abort();
            Err(FanoutError::Cancelled)
        }
        _ = expiry => {
            token.cancel();
            inner.abort();
            warn!(task = name, "fan-out task exceeded its deadline");
            Err(FanoutError::DeadlineExceeded)
        }
    }
}

fn join_failure<E>(name: &str, err: JoinError) -> FanoutError<E> {
    if err.is_panic() {
        let message = panic_message(err.into_panic());
        warn!(task = name, panic = %message, "fan-out task panicked");
        FanoutError::Panicked(message)
    } else {
        FanoutError::Cancelled
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
