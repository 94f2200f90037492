//! Asynchronous Result Delivery
//!
//! User callbacks may block, so they never run on a connection reader task.
//! [`CallbackExecutor`] hands each one to tokio's blocking pool, with a
//! semaphore bounding how many run at once.

use crate::message::Response;
use crate::{Result, RpcError};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::warn;

/// Receives the outcome of an asynchronous call, exactly once
pub trait ResponseCallback: Send + 'static {
    fn on_success(self: Box<Self>, response: Response);

    fn on_failure(self: Box<Self>, error: RpcError);
}

/// [`ResponseCallback`] made of two closures
pub struct FnCallback<S, F> {
    on_success: S,
    on_failure: F,
}

impl<S, F> FnCallback<S, F>
where
    S: FnOnce(Response) + Send + 'static,
    F: FnOnce(RpcError) + Send + 'static,
{
    pub fn new(on_success: S, on_failure: F) -> Self {
        Self {
            on_success,
            on_failure,
        }
    }

    pub fn boxed(on_success: S, on_failure: F) -> Box<dyn ResponseCallback> {
        Box::new(Self::new(on_success, on_failure))
    }
}

impl<S, F> ResponseCallback for FnCallback<S, F>
where
    S: FnOnce(Response) + Send + 'static,
    F: FnOnce(RpcError) + Send + 'static,
{
    fn on_success(self: Box<Self>, response: Response) {
        (self.on_success)(response)
    }

    fn on_failure(self: Box<Self>, error: RpcError) {
        (self.on_failure)(error)
    }
}

/// Bounded dispatcher running callbacks off the I/O tasks
#[derive(Clone)]
pub struct CallbackExecutor {
    permits: Arc<Semaphore>,
    handle: Handle,
}

impl CallbackExecutor {
    /// Must be called from within a tokio runtime
    pub fn new(workers: usize) -> Self {
        Self::with_handle(workers, Handle::current())
    }

    pub fn with_handle(workers: usize, handle: Handle) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            handle,
        }
    }

    pub fn dispatch(&self, callback: Box<dyn ResponseCallback>, outcome: Result<Response>) {
        let permits = Arc::clone(&self.permits);
        self.handle.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let run = tokio::task::spawn_blocking(move || match outcome {
                Ok(response) => callback.on_success(response),
                Err(error) => callback.on_failure(error),
            });
            if let Err(e) = run.await {
                warn!("Response callback panicked: {}", e);
            }
        });
    }

    /// Callbacks that could start right now without waiting
    pub fn available_workers(&self) -> usize {
        self.permits.available_permits()
    }
}
