//! Pending Calls
//!
//! One [`PendingCall`] per in-flight request. Whichever of response, timeout
//! or send failure reaches [`PendingCall::complete`] first wins; every later
//! attempt is a no-op returning `false`.

use crate::callback::{CallbackExecutor, ResponseCallback};
use crate::instance::HealthTracker;
use crate::message::{CorrelationId, Response, ResponseStatus};
use crate::timer::TimeoutHandle;
use crate::{Result, RpcError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Lifecycle of a pending call
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Created = 0,
    Sent = 1,
    Resolved = 2,
}

impl CallState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CallState::Created,
            1 => CallState::Sent,
            _ => CallState::Resolved,
        }
    }
}

/// Runs once when the call resolves, with the raw outcome
pub type ReleaseHook = Box<dyn FnOnce(&Result<Response>) + Send + 'static>;

enum Completion {
    Waiter(oneshot::Sender<Result<Response>>),
    Callback(Box<dyn ResponseCallback>, CallbackExecutor),
}

/// Placeholder for the eventual result of one request
pub struct PendingCall {
    correlation_id: AtomicU32,
    operation: String,
    created_at: Instant,
    sent_at: Mutex<Option<Instant>>,
    read_timeout: Duration,
    state: AtomicU8,
    completion: Mutex<Option<Completion>>,
    timeout: Mutex<Option<TimeoutHandle>>,
    release: Mutex<Option<ReleaseHook>>,
    health: Arc<HealthTracker>,
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("correlation_id", &self.correlation_id())
            .field("operation", &self.operation)
            .field("instance", self.health.instance())
            .field("state", &self.state())
            .finish()
    }
}

impl PendingCall {
    fn new(
        operation: String,
        read_timeout: Duration,
        health: Arc<HealthTracker>,
        completion: Completion,
    ) -> Self {
        Self {
            correlation_id: AtomicU32::new(0),
            operation,
            created_at: Instant::now(),
            sent_at: Mutex::new(None),
            read_timeout,
            state: AtomicU8::new(CallState::Created as u8),
            completion: Mutex::new(Some(completion)),
            timeout: Mutex::new(None),
            release: Mutex::new(None),
            health,
        }
    }

    /// A call whose result is awaited through the returned [`CallWaiter`]
    pub fn with_waiter(
        operation: impl Into<String>,
        read_timeout: Duration,
        health: Arc<HealthTracker>,
    ) -> (Arc<Self>, CallWaiter) {
        let (tx, rx) = oneshot::channel();
        let call = Arc::new(Self::new(
            operation.into(),
            read_timeout,
            health,
            Completion::Waiter(tx),
        ));
        (call, CallWaiter { rx })
    }

    /// A call whose result is delivered to `callback` through `executor`
    pub fn with_callback(
        operation: impl Into<String>,
        read_timeout: Duration,
        health: Arc<HealthTracker>,
        callback: Box<dyn ResponseCallback>,
        executor: CallbackExecutor,
    ) -> Arc<Self> {
        Arc::new(Self::new(
            operation.into(),
            read_timeout,
            health,
            Completion::Callback(callback, executor),
        ))
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id.load(Ordering::Acquire)
    }

    pub(crate) fn assign_id(&self, id: CorrelationId) {
        self.correlation_id.store(id, Ordering::Release);
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn state(&self) -> CallState {
        CallState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_resolved(&self) -> bool {
        self.state() == CallState::Resolved
    }

    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the request started going out, or since creation if it
    /// never did
    pub fn round_trip(&self) -> Duration {
        let sent_at = *self.sent_at.lock();
        sent_at.unwrap_or(self.created_at).elapsed()
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    /// Transition CREATED -> SENT as the request starts going out, stamping
    /// the time latency samples are measured from. A resolved call stays
    /// resolved.
    pub fn mark_sent(&self) {
        self.sent_at.lock().get_or_insert_with(Instant::now);
        let _ = self.state.compare_exchange(
            CallState::Created as u8,
            CallState::Sent as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Install the hook that hands the connection back to its strategy
    pub fn set_release_hook(&self, hook: ReleaseHook) {
        *self.release.lock() = Some(hook);
    }

    /// Keep the armed timeout so success can cancel it. If the call already
    /// resolved, the timeout is cancelled on the spot.
    pub fn attach_timeout(&self, handle: TimeoutHandle) {
        let mut slot = self.timeout.lock();
        if self.is_resolved() {
            handle.cancel();
        } else {
            *slot = Some(handle);
        }
    }

    /// Timeout failure describing this call
    pub fn timeout_error(&self) -> RpcError {
        RpcError::timeout(
            format!("call {}", self.operation),
            Some(self.health.instance().clone()),
            self.read_timeout.as_millis() as u64,
            self.elapsed().as_millis() as u64,
        )
    }

    /// Resolve the call. Returns `false` if it was already resolved, in which
    /// case `outcome` is discarded.
    pub fn complete(&self, outcome: Result<Response>) -> bool {
        let Some(completion) = self.completion.lock().take() else {
            return false;
        };
        self.state.store(CallState::Resolved as u8, Ordering::Release);

        if let Some(timeout) = self.timeout.lock().take() {
            timeout.cancel();
        }

        match &outcome {
            Ok(_) => self
                .health
                .update_latency(self.round_trip().as_millis() as u64),
            Err(RpcError::Timeout { .. }) => {
                self.health
                    .update_latency_with_read_timeout(self.read_timeout.as_millis() as u64);
                self.health.inc_failed_num();
            }
            Err(_) => {}
        }

        if let Some(release) = self.release.lock().take() {
            release(&outcome);
        }

        let outcome = outcome.and_then(into_result);
        match completion {
            Completion::Waiter(tx) => {
                let _ = tx.send(outcome);
            }
            Completion::Callback(callback, executor) => executor.dispatch(callback, outcome),
        }
        true
    }
}

/// Remote-reported errors become `Service` failures
fn into_result(response: Response) -> Result<Response> {
    match response.status {
        ResponseStatus::Ok => Ok(response),
        ResponseStatus::ServiceError { code, message } => Err(RpcError::service(code, message)),
    }
}

/// Receiving side of a waiter-mode [`PendingCall`]
#[derive(Debug)]
pub struct CallWaiter {
    rx: oneshot::Receiver<Result<Response>>,
}

impl CallWaiter {
    /// Wait up to `timeout` for the result. `Ok(None)` means nothing arrived
    /// in time and the caller owns the timeout path.
    pub async fn wait(&mut self, timeout: Duration) -> Option<Result<Response>> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(_)) => Some(Err(RpcError::unknown("pending call dropped without a result"))),
            Err(_) => None,
        }
    }

    /// Wait with no deadline, for use after the timeout path has run
    pub async fn finish(self) -> Result<Response> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::unknown("pending call dropped without a result")),
        }
    }
}
