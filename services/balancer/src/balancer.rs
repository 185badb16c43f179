//! The balancer: one state machine per service, driven by update deliveries.

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use ferry_model::{EventSink, ServiceUpdate};
use ferry_netfilter::{ChainManager, Table, FILTER_HOOKS, NAT_HOOKS};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{BalancerError, ErrorReporter};
use crate::forwarder::ForwarderContext;
use crate::pool::PoolConfig;
use crate::service::{ServiceSlot, StateKind};

/// Everything a service transition needs from its surroundings.
pub struct BalancerContext {
    pub netfilter: Arc<ChainManager>,
    /// Forwarders listen on this IP; it is the DNAT target.
    pub bridge_ip: IpAddr,
    pub pool_config: PoolConfig,
    pub connect_timeout: Duration,
    pub sink: Arc<dyn EventSink>,
    pub errors: ErrorReporter,
}

impl BalancerContext {
    /// Create the managed NAT and filter chains, replacing leftovers.
    pub fn install_chains(&self) -> Result<(), BalancerError> {
        self.netfilter.setup_chain(Table::Nat, NAT_HOOKS)?;
        self.netfilter.setup_chain(Table::Filter, FILTER_HOOKS)?;
        Ok(())
    }

    /// Remove both managed chains.
    ///
    /// Both tables are attempted; the first error is returned.
    pub fn remove_chains(&self) -> Result<(), BalancerError> {
        let nat = self.netfilter.teardown_chain(Table::Nat, NAT_HOOKS);
        let filter = self.netfilter.teardown_chain(Table::Filter, FILTER_HOOKS);
        nat?;
        filter?;
        Ok(())
    }

    pub(crate) fn forwarder_context(&self, service: &str) -> ForwarderContext {
        ForwarderContext {
            service: service.to_string(),
            sink: Arc::clone(&self.sink),
            errors: self.errors.clone(),
            connect_timeout: self.connect_timeout,
        }
    }
}

/// Services by name.
pub struct Balancer {
    ctx: BalancerContext,
    services: BTreeMap<String, ServiceSlot>,
}

impl Balancer {
    pub fn new(ctx: BalancerContext) -> Self {
        Self {
            ctx,
            services: BTreeMap::new(),
        }
    }

    pub fn context(&self) -> &BalancerContext {
        &self.ctx
    }

    /// Apply one delivery in order.
    ///
    /// A delivery whose first update has `reset` set is a full snapshot:
    /// known services it does not name are deleted first. Returns the
    /// errors of services whose transition failed; each keeps its
    /// previous state.
    pub async fn apply(&mut self, delivery: Vec<ServiceUpdate>) -> Vec<(String, BalancerError)> {
        let mut errors = Vec::new();

        if delivery.first().is_some_and(|u| u.reset) {
            let named: HashSet<&str> = delivery.iter().map(|u| u.name.as_str()).collect();
            let stale: Vec<String> = self
                .services
                .keys()
                .filter(|name| !named.contains(name.as_str()))
                .cloned()
                .collect();
            for name in stale {
                debug!(service = %name, "Service missing from snapshot");
                self.remove(&name).await;
            }
        }

        for update in delivery {
            let Some(service) = update.service else {
                self.remove(&update.name).await;
                continue;
            };

            let slot = self
                .services
                .entry(update.name.clone())
                .or_insert_with(|| ServiceSlot::new(update.name.clone()));
            if let Err(e) = slot.update(&self.ctx, &service).await {
                warn!(
                    service = %update.name,
                    state = ?slot.kind(),
                    error = %e,
                    "Service update failed, keeping previous state"
                );
                errors.push((update.name, e));
            }
        }

        errors
    }

    /// Apply deliveries until `shutdown` fires, then release everything.
    ///
    /// A closed update channel leaves the current services in place.
    pub async fn run(
        &mut self,
        mut updates: mpsc::Receiver<Vec<ServiceUpdate>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut open = true;
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                delivery = updates.recv(), if open => match delivery {
                    Some(delivery) => {
                        for (service, error) in self.apply(delivery).await {
                            self.ctx.errors.report(&service, error);
                        }
                    }
                    None => {
                        info!(
                            services = self.services.len(),
                            "Update feed closed, keeping current services"
                        );
                        open = false;
                    }
                },
            }
        }

        self.shutdown().await;
    }

    /// Release every service's rules and forwarders.
    pub async fn shutdown(&mut self) {
        let services = std::mem::take(&mut self.services);
        let count = services.len();
        for (_, slot) in services {
            slot.stop(&self.ctx).await;
        }
        info!(services = count, "All services released");
    }

    pub fn state_of(&self, name: &str) -> Option<StateKind> {
        self.services.get(name).map(ServiceSlot::kind)
    }

    /// Address of the service's forwarder while it is forwarding.
    pub fn forwarder_addr(&self, name: &str) -> Option<SocketAddr> {
        self.services
            .get(name)
            .and_then(ServiceSlot::forwarder)
            .map(|f| f.local_addr())
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    async fn remove(&mut self, name: &str) {
        if let Some(slot) = self.services.remove(name) {
            info!(service = %name, state = ?slot.kind(), "Service removed");
            slot.stop(&self.ctx).await;
        }
    }
}
