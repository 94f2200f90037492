//! Communication Client
//!
//! Per-instance request pipeline: acquire a connection, register a pending
//! call, encode, send, arm the timeout, then either await the result or let
//! the callback path deliver it. Every failure before the timeout is armed
//! resolves the call on the spot, so no registry entry or timer is left behind.

use crate::callback::{CallbackExecutor, ResponseCallback};
use crate::config::ClientConfig;
use crate::error::AcquireError;
use crate::instance::{HealthTracker, Instance};
use crate::message::{CorrelationId, Request, Response};
use crate::pending::PendingCall;
use crate::protocol::{BincodeProtocol, Protocol};
use crate::registry::CorrelationRegistry;
use crate::strategy::{build_strategy, ConnectionStrategy, StrategyStats};
use crate::timer::TimeoutScheduler;
use crate::transports::{
    Connection, Connector, InboundHandler, SendError, TcpConnector, TcpConnectorConfig,
};
use crate::{Result, RpcError};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Resolves pending calls from inbound response frames
pub struct ResponseDispatcher {
    registry: Arc<CorrelationRegistry>,
    protocol: Arc<dyn Protocol>,
}

impl ResponseDispatcher {
    pub fn new(registry: Arc<CorrelationRegistry>, protocol: Arc<dyn Protocol>) -> Self {
        Self { registry, protocol }
    }
}

impl InboundHandler for ResponseDispatcher {
    fn on_frame(&self, connection_id: u64, frame: Bytes) {
        match self.protocol.decode_response(&frame) {
            Ok(response) => {
                let correlation_id = response.correlation_id;
                if self.registry.resolve(correlation_id, Ok(response)) {
                    debug!(connection_id, correlation_id, "Resolved pending call");
                }
            }
            // the call stays pending and times out
            Err(e) => warn!(connection_id, "Dropping undecodable response frame: {}", e),
        }
    }

    fn on_closed(&self, connection_id: u64) {
        debug!(connection_id, "Connection reader stopped");
    }
}

/// Services shared by every client of one runtime: the correlation registry,
/// the timeout scheduler, the callback executor, the protocol and the
/// connector whose inbound frames feed the registry.
#[derive(Clone)]
pub struct ClientContext {
    pub registry: Arc<CorrelationRegistry>,
    pub scheduler: Arc<TimeoutScheduler>,
    pub executor: CallbackExecutor,
    pub protocol: Arc<dyn Protocol>,
    pub connector: Arc<dyn Connector>,
}

impl ClientContext {
    /// TCP transport with the bincode protocol. Must be called from within a
    /// tokio runtime.
    pub fn tcp(config: &ClientConfig) -> Self {
        Self::tcp_with_protocol(config, Arc::new(BincodeProtocol::new()))
    }

    pub fn tcp_with_protocol(config: &ClientConfig, protocol: Arc<dyn Protocol>) -> Self {
        let registry = Arc::new(CorrelationRegistry::new(config.max_pending_calls));
        let dispatcher = Arc::new(ResponseDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&protocol),
        ));
        let connector = Arc::new(TcpConnector::new(
            TcpConnectorConfig::from_client_config(config),
            dispatcher,
        ));
        Self::new(config, protocol, registry, connector)
    }

    /// Assemble a context around a custom connector. The connector must feed
    /// inbound frames to a [`ResponseDispatcher`] over the same `registry`.
    pub fn new(
        config: &ClientConfig,
        protocol: Arc<dyn Protocol>,
        registry: Arc<CorrelationRegistry>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            registry,
            scheduler: Arc::new(TimeoutScheduler::new()),
            executor: CallbackExecutor::new(config.callback_workers),
            protocol,
            connector,
        }
    }

    /// Stop the timeout driver, firing every armed timeout
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

/// Registered call not yet armed with a timeout. Dropping it unarmed, e.g.
/// when the caller's future is cancelled mid-send, resolves the call so its
/// registry entry and connection are released.
struct SendGuard<'a> {
    registry: &'a CorrelationRegistry,
    correlation_id: CorrelationId,
    remote: &'a Instance,
    armed: bool,
}

impl SendGuard<'_> {
    fn fail(mut self, error: RpcError) {
        self.armed = false;
        self.registry.resolve(self.correlation_id, Err(error));
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let error = RpcError::network("call cancelled before the request was sent", Some(self.remote.clone()));
        if self.registry.resolve(self.correlation_id, Err(error)) {
            debug!(correlation_id = self.correlation_id, "Abandoned call released");
        }
    }
}

/// Request pipeline bound to one remote instance
pub struct CommunicationClient {
    strategy: Arc<dyn ConnectionStrategy>,
    context: ClientContext,
    read_timeout: Duration,
}

impl CommunicationClient {
    /// Open a client with its own TCP context
    pub async fn connect(instance: Instance, config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let context = ClientContext::tcp(config);
        Self::new(instance, &context, config).await
    }

    /// Open a client sharing `context` with other clients
    pub async fn new(instance: Instance, context: &ClientContext, config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let strategy = build_strategy(
            config.connection,
            instance.clone(),
            Arc::clone(&context.connector),
            config,
        )
        .await;
        info!(instance = %instance, strategy = ?config.connection, "Created communication client");
        Ok(Self {
            strategy,
            context: context.clone(),
            read_timeout: config.read_timeout(),
        })
    }

    pub fn instance(&self) -> &Instance {
        self.strategy.instance()
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        self.strategy.health()
    }

    pub fn strategy(&self) -> &Arc<dyn ConnectionStrategy> {
        &self.strategy
    }

    pub fn stats(&self) -> StrategyStats {
        self.strategy.stats()
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Send `request` and wait up to the read timeout for its response
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let (call, mut waiter) = PendingCall::with_waiter(
            request.operation(),
            self.read_timeout,
            Arc::clone(self.health()),
        );
        self.dispatch(request, Arc::clone(&call)).await;

        match waiter.wait(self.read_timeout).await {
            Some(outcome) => outcome,
            None => {
                self.expire(&call);
                waiter.finish().await
            }
        }
    }

    /// Send `request` and return once it is on the wire; `callback` receives
    /// the outcome exactly once. Returns the correlation id when the request
    /// was sent; otherwise the failure already went to `callback`.
    pub async fn execute_with_callback(
        &self,
        request: Request,
        callback: Box<dyn ResponseCallback>,
    ) -> Option<CorrelationId> {
        let call = PendingCall::with_callback(
            request.operation(),
            self.read_timeout,
            Arc::clone(self.health()),
            callback,
            self.context.executor.clone(),
        );
        self.dispatch(request, call).await
    }

    pub async fn close(&self) {
        self.strategy.close().await;
    }

    /// Resolve `call` with a timeout unless something else got there first
    fn expire(&self, call: &Arc<PendingCall>) {
        self.context
            .registry
            .remove_if_same(call.correlation_id(), call);
        if call.complete(Err(call.timeout_error())) {
            debug!(correlation_id = call.correlation_id(), "Call timed out while waiting");
        }
    }

    async fn acquire_connection(&self) -> Result<Arc<dyn Connection>> {
        let instance = self.instance();
        match self.strategy.acquire().await {
            Ok(connection) if connection.is_active() => Ok(connection),
            Ok(connection) => {
                self.strategy.remove(connection);
                self.health().inc_failed_num();
                Err(AcquireError::NotActive.into_rpc(instance))
            }
            Err(AcquireError::Exhausted { max }) => {
                let doubled = max.saturating_mul(2);
                self.strategy.update_max_connections(doubled);
                warn!(
                    instance = %instance,
                    max,
                    doubled,
                    "Connection pool exhausted, doubling its maximum"
                );
                Err(AcquireError::Exhausted { max }.into_rpc(instance))
            }
            Err(e @ AcquireError::ConnectFailed { .. }) => {
                self.health().inc_failed_num();
                Err(e.into_rpc(instance))
            }
            Err(e) => Err(e.into_rpc(instance)),
        }
    }

    /// Run the pipeline for `call`. Any failure resolves the call directly.
    async fn dispatch(&self, mut request: Request, call: Arc<PendingCall>) -> Option<CorrelationId> {
        let connection = match self.acquire_connection().await {
            Ok(connection) => connection,
            Err(e) => {
                call.complete(Err(e));
                return None;
            }
        };
        self.health().record_acquired();

        let strategy = Arc::clone(&self.strategy);
        let held = Arc::clone(&connection);
        call.set_release_hook(Box::new(move |outcome| match outcome {
            Err(RpcError::Network { .. }) => strategy.remove(held),
            _ => strategy.release(held),
        }));

        let registry = &self.context.registry;
        let correlation_id = match registry.register(Arc::clone(&call)) {
            Ok(id) => id,
            Err(e) => {
                call.complete(Err(e));
                return None;
            }
        };
        request.correlation_id = correlation_id;
        let guard = SendGuard {
            registry,
            correlation_id,
            remote: self.instance(),
            armed: true,
        };

        let frame = match self.context.protocol.encode_request(&request) {
            Ok(frame) => frame,
            Err(e) => {
                guard.fail(e);
                return None;
            }
        };

        call.mark_sent();
        if let Err(e) = connection.send(frame).await {
            let error = match e {
                SendError::Closed => {
                    self.health().inc_failed_num();
                    debug!(
                        correlation_id,
                        connection_id = connection.id(),
                        "Connection closed during send"
                    );
                    RpcError::network("connection closed during send", Some(self.instance().clone()))
                }
                SendError::Failed(error @ RpcError::Network { .. }) => {
                    self.health().inc_failed_num();
                    warn!(
                        correlation_id,
                        connection_id = connection.id(),
                        "Send failed: {}",
                        error
                    );
                    error
                }
                // rejected locally, nothing reached the instance
                SendError::Failed(error) => {
                    warn!(
                        correlation_id,
                        connection_id = connection.id(),
                        "Request not sent: {}",
                        error
                    );
                    error
                }
            };
            guard.fail(error);
            return None;
        }

        let weak_registry = Arc::downgrade(registry);
        let weak_call = Arc::downgrade(&call);
        let handle = self.context.scheduler.arm(self.read_timeout, move || {
            let Some(call) = weak_call.upgrade() else {
                return;
            };
            if let Some(registry) = weak_registry.upgrade() {
                registry.remove_if_same(correlation_id, &call);
            }
            if call.complete(Err(call.timeout_error())) {
                debug!(correlation_id, "Call timed out");
            }
        });
        call.attach_timeout(handle);
        guard.disarm();

        debug!(
            correlation_id,
            instance = %self.instance(),
            operation = call.operation(),
            "Sent request"
        );
        Some(correlation_id)
    }
}
