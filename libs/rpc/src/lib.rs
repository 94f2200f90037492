//! RPC Client Runtime
//!
//! Client side of a request/response RPC system: per-instance connection
//! strategies, correlation of asynchronous responses to pending calls,
//! timeout enforcement and load balancing across the instances of a service.
//!
//! A call flows through [`ServiceClient`] (instance selection and retries)
//! into the chosen instance's [`CommunicationClient`] (acquire, register,
//! encode, send, arm timeout) and is resolved either by the
//! [`ResponseDispatcher`] when the response frame arrives or by the
//! [`TimeoutScheduler`].

pub mod error;
pub mod config;
pub mod instance;
pub mod message;
pub mod protocol;

pub mod transports;
pub mod strategy;

pub mod callback;
pub mod timer;
pub mod pending;
pub mod registry;
pub mod client;

pub mod balance;
pub mod discovery;
pub mod cluster;

// Re-export commonly used types
pub use error::{AcquireError, Result, RpcError};
pub use config::{ClientConfig, FairConfig, LoadBalanceKind, StrategyKind};
pub use instance::{HealthTracker, Instance, LatencyWindow};
pub use message::{CorrelationId, Request, Response, ResponseStatus};
pub use protocol::{BincodeProtocol, Protocol};

pub use transports::{Connection, Connector, InboundHandler, SendError, TcpConnector, TcpConnectorConfig};
pub use strategy::{build_strategy, ConnectionStrategy, StrategyStats};

pub use callback::{CallbackExecutor, FnCallback, ResponseCallback};
pub use timer::{TimeoutHandle, TimeoutScheduler};
pub use pending::{CallState, PendingCall};
pub use registry::CorrelationRegistry;
pub use client::{ClientContext, CommunicationClient, ResponseDispatcher};

pub use balance::{build_balancer, LoadBalancer, WeightTree};
pub use discovery::{DiscoveryListener, ServiceDiscovery, StaticDiscovery};
pub use cluster::ServiceClient;
