//! Multi-Instance Service Client
//!
//! Keeps one [`CommunicationClient`] per discovered instance, routes each call
//! through the configured load balancer and retries retryable failures on
//! instances not tried yet. Membership changes arrive from discovery and are
//! applied in order by a background task.

use crate::balance::{build_balancer, LoadBalancer};
use crate::callback::ResponseCallback;
use crate::client::{ClientContext, CommunicationClient};
use crate::config::ClientConfig;
use crate::discovery::{DiscoveryListener, ServiceDiscovery};
use crate::instance::{HealthTracker, Instance};
use crate::message::{CorrelationId, Request, Response};
use crate::{Result, RpcError};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

type MembershipChange = (Vec<Instance>, Vec<Instance>);

struct ClusterInner {
    service: String,
    config: ClientConfig,
    context: ClientContext,
    balancer: Arc<dyn LoadBalancer>,
    clients: RwLock<BTreeMap<Instance, Arc<CommunicationClient>>>,
    closed: AtomicBool,
}

impl ClusterInner {
    fn candidates(&self) -> Vec<Arc<HealthTracker>> {
        self.clients
            .read()
            .values()
            .map(|client| Arc::clone(client.health()))
            .collect()
    }

    fn select(&self, tried: &HashSet<Instance>) -> Option<Arc<CommunicationClient>> {
        let clients = self.clients.read();
        let candidates: Vec<_> = clients.values().map(|c| Arc::clone(c.health())).collect();
        let picked = self.balancer.select(&candidates, tried)?;
        clients.get(picked.instance()).cloned()
    }

    async fn add_instance(&self, instance: Instance) {
        if self.clients.read().contains_key(&instance) {
            return;
        }
        let client = match CommunicationClient::new(instance.clone(), &self.context, &self.config).await {
            Ok(client) => Arc::new(client),
            Err(e) => {
                error!(service = %self.service, instance = %instance, "Failed to create client: {}", e);
                return;
            }
        };

        let duplicate = {
            let mut clients = self.clients.write();
            if self.closed.load(Ordering::Acquire) || clients.contains_key(&instance) {
                true
            } else {
                clients.insert(instance.clone(), Arc::clone(&client));
                false
            }
        };
        if duplicate {
            client.close().await;
        } else {
            info!(service = %self.service, instance = %instance, "Added instance");
        }
    }

    async fn remove_instance(&self, instance: &Instance) {
        let removed = self.clients.write().remove(instance);
        if let Some(client) = removed {
            info!(service = %self.service, instance = %instance, "Removed instance");
            client.close().await;
        }
    }

    /// Rebuild balancer state; a panic is logged and the cycle skipped
    fn refresh_balancer(&self) {
        let candidates = self.candidates();
        if catch_unwind(AssertUnwindSafe(|| self.balancer.refresh(&candidates))).is_err() {
            error!(service = %self.service, "Load balancer refresh panicked, keeping previous state");
        }
    }
}

/// Forwards discovery callbacks to the membership task
struct MembershipListener {
    changes: mpsc::UnboundedSender<MembershipChange>,
}

impl DiscoveryListener for MembershipListener {
    fn on_change(&self, added: Vec<Instance>, removed: Vec<Instance>) {
        if self.changes.send((added, removed)).is_err() {
            debug!("Membership change after service client shut down");
        }
    }
}

/// Load-balanced client for every instance of one service
pub struct ServiceClient {
    inner: Arc<ClusterInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceClient {
    /// Client over TCP with the bincode protocol
    pub async fn new(
        service: impl Into<String>,
        discovery: Arc<dyn ServiceDiscovery>,
        config: ClientConfig,
    ) -> Result<Self> {
        config.validate()?;
        let context = ClientContext::tcp(&config);
        Self::with_context(service, discovery, config, context).await
    }

    /// Client sharing an existing runtime context
    pub async fn with_context(
        service: impl Into<String>,
        discovery: Arc<dyn ServiceDiscovery>,
        config: ClientConfig,
        context: ClientContext,
    ) -> Result<Self> {
        config.validate()?;
        let service = service.into();
        let balancer = build_balancer(config.load_balance, &config);
        let rebuild_interval = config.rebuild_interval();
        let inner = Arc::new(ClusterInner {
            service,
            config,
            context,
            balancer,
            clients: RwLock::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        });

        for instance in discovery.lookup() {
            inner.add_instance(instance).await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        discovery.subscribe(Arc::new(MembershipListener { changes: tx }));
        let membership = tokio::spawn(apply_membership(Arc::downgrade(&inner), rx));
        let maintenance = tokio::spawn(maintain(Arc::downgrade(&inner), rebuild_interval));

        info!(
            service = %inner.service,
            instances = inner.clients.read().len(),
            balancer = ?inner.balancer.kind(),
            "Service client started"
        );
        Ok(Self {
            inner,
            tasks: Mutex::new(vec![membership, maintenance]),
        })
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.inner.clients.read().keys().cloned().collect()
    }

    pub fn client(&self, instance: &Instance) -> Option<Arc<CommunicationClient>> {
        self.inner.clients.read().get(instance).cloned()
    }

    pub fn balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.inner.balancer
    }

    pub fn context(&self) -> &ClientContext {
        &self.inner.context
    }

    /// Rebuild balancer state now instead of waiting for the next period
    pub fn refresh(&self) {
        self.inner.refresh_balancer();
    }

    /// Call the service, retrying retryable failures up to `retries` times,
    /// each time on an instance not tried yet when one is left
    pub async fn invoke(&self, request: Request) -> Result<Response> {
        let attempts = self.inner.config.retries + 1;
        let mut tried = HashSet::new();
        let mut last_error = None;

        for attempt in 1..=attempts {
            let Some(client) = self.inner.select(&tried) else {
                break;
            };
            let instance = client.instance().clone();

            match client.execute(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    self.inner.balancer.mark_invalid(&instance);
                    warn!(
                        service = %self.inner.service,
                        instance = %instance,
                        attempt,
                        attempts,
                        "Call failed: {}",
                        e
                    );
                    tried.insert(instance);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| self.no_instance()))
    }

    /// Pick an instance and send one asynchronous attempt. Failures, including
    /// having no instance at all, reach `callback`.
    pub async fn invoke_with_callback(
        &self,
        request: Request,
        callback: Box<dyn ResponseCallback>,
    ) -> Option<CorrelationId> {
        match self.inner.select(&HashSet::new()) {
            Some(client) => client.execute_with_callback(request, callback).await,
            None => {
                self.inner.context.executor.dispatch(callback, Err(self.no_instance()));
                None
            }
        }
    }

    /// Close every instance client and stop background tasks
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let clients: Vec<_> = std::mem::take(&mut *self.inner.clients.write())
            .into_values()
            .collect();
        for client in clients {
            client.close().await;
        }
        info!(service = %self.inner.service, "Service client closed");
    }

    fn no_instance(&self) -> RpcError {
        RpcError::network(
            format!("no available instance for service {}", self.inner.service),
            None,
        )
    }
}

impl Drop for ServiceClient {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn apply_membership(
    cluster: Weak<ClusterInner>,
    mut changes: mpsc::UnboundedReceiver<MembershipChange>,
) {
    while let Some((added, removed)) = changes.recv().await {
        let Some(cluster) = cluster.upgrade() else {
            return;
        };
        if cluster.closed.load(Ordering::Acquire) {
            return;
        }
        for instance in &removed {
            cluster.remove_instance(instance).await;
        }
        for instance in added {
            cluster.add_instance(instance).await;
        }
    }
}

async fn maintain(cluster: Weak<ClusterInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(cluster) = cluster.upgrade() else {
            return;
        };
        if cluster.closed.load(Ordering::Acquire) {
            return;
        }
        cluster.refresh_balancer();
    }
}
