//! Per-service state machine.
//!
//! A service is in one of three states, chosen by its snapshot:
//!
//! | snapshot                      | state           | owns                          |
//! |-------------------------------|-----------------|-------------------------------|
//! | no virtual address            | `NotForwarding` | nothing                       |
//! | address, no instances         | `Rejecting`     | a REJECT rule                 |
//! | address and instances         | `Forwarding`    | a DNAT rule, forwarder, pool  |
//!
//! Moving between states installs the new state's resources before the old
//! state's are released, so the virtual address is always covered by one
//! rule or the other. A failed install leaves the previous state in place.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use ferry_model::{Instance, Service};
use ferry_netfilter::Rule;
use tracing::{debug, info, warn};

use crate::balancer::BalancerContext;
use crate::error::BalancerError;
use crate::forwarder::Forwarder;
use crate::pool::InstancePool;

/// Resources held by a service.
pub enum ServiceState {
    NotForwarding,
    Rejecting {
        address: SocketAddr,
        rule: Rule,
    },
    Forwarding {
        address: SocketAddr,
        rule: Rule,
        forwarder: Forwarder,
        /// Sorted, deduplicated membership last pushed into the pool.
        instances: Vec<Instance>,
    },
}

/// Name of a [`ServiceState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    NotForwarding,
    Rejecting,
    Forwarding,
}

impl ServiceState {
    pub fn kind(&self) -> StateKind {
        match self {
            ServiceState::NotForwarding => StateKind::NotForwarding,
            ServiceState::Rejecting { .. } => StateKind::Rejecting,
            ServiceState::Forwarding { .. } => StateKind::Forwarding,
        }
    }

    pub fn address(&self) -> Option<SocketAddr> {
        match self {
            ServiceState::NotForwarding => None,
            ServiceState::Rejecting { address, .. } | ServiceState::Forwarding { address, .. } => {
                Some(*address)
            }
        }
    }
}

/// The state a snapshot asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    NotForwarding,
    Rejecting(SocketAddr),
    Forwarding(SocketAddr),
}

impl Target {
    fn for_service(service: &Service) -> Self {
        match service.address {
            None => Target::NotForwarding,
            Some(address) if service.instances.is_empty() => Target::Rejecting(address),
            Some(address) => Target::Forwarding(address),
        }
    }

    fn kind(&self) -> StateKind {
        match self {
            Target::NotForwarding => StateKind::NotForwarding,
            Target::Rejecting(_) => StateKind::Rejecting,
            Target::Forwarding(_) => StateKind::Forwarding,
        }
    }

    fn address(&self) -> Option<SocketAddr> {
        match self {
            Target::NotForwarding => None,
            Target::Rejecting(address) | Target::Forwarding(address) => Some(*address),
        }
    }
}

/// One named service and the state it is in.
pub struct ServiceSlot {
    name: String,
    state: ServiceState,
}

impl ServiceSlot {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ServiceState::NotForwarding,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &ServiceState {
        &self.state
    }

    pub fn kind(&self) -> StateKind {
        self.state.kind()
    }

    pub fn forwarder(&self) -> Option<&Forwarder> {
        match &self.state {
            ServiceState::Forwarding { forwarder, .. } => Some(forwarder),
            _ => None,
        }
    }

    /// Move to the state `service` asks for.
    ///
    /// On error nothing changes.
    pub async fn update(
        &mut self,
        ctx: &BalancerContext,
        service: &Service,
    ) -> Result<(), BalancerError> {
        service
            .validate()
            .map_err(|e| BalancerError::Config(format!("service {}: {}", self.name, e)))?;

        let target = Target::for_service(service);
        if target.kind() == self.kind() && target.address() == self.state.address() {
            self.refresh(service);
            return Ok(());
        }

        let next = self.install(ctx, target, service).await?;
        let previous = std::mem::replace(&mut self.state, next);
        info!(
            service = %self.name,
            from = ?previous.kind(),
            to = ?self.state.kind(),
            address = ?self.state.address(),
            "Service state changed"
        );
        release(ctx, &self.name, previous).await;
        Ok(())
    }

    /// Release everything the current state owns.
    pub async fn stop(self, ctx: &BalancerContext) {
        release(ctx, &self.name, self.state).await;
    }

    /// Apply membership and protocol changes that need no new resources.
    fn refresh(&mut self, service: &Service) {
        let ServiceState::Forwarding {
            forwarder,
            instances,
            ..
        } = &mut self.state
        else {
            return;
        };

        let held: HashSet<&Instance> = instances.iter().collect();
        if service.instance_set() != held {
            let wanted = sorted_instances(service);
            forwarder.pool().update_instances(&wanted);
            info!(
                service = %self.name,
                instances = wanted.len(),
                "Service instances changed"
            );
            *instances = wanted;
        }

        let protocol = service.protocol();
        if forwarder.protocol() != protocol {
            forwarder.set_protocol(protocol);
        }
    }

    async fn install(
        &self,
        ctx: &BalancerContext,
        target: Target,
        service: &Service,
    ) -> Result<ServiceState, BalancerError> {
        match target {
            Target::NotForwarding => Ok(ServiceState::NotForwarding),
            Target::Rejecting(address) => {
                let rule = Rule::reject(address);
                ctx.netfilter.add_rule(&rule)?;
                Ok(ServiceState::Rejecting { address, rule })
            }
            Target::Forwarding(address) => {
                let instances = sorted_instances(service);
                let pool = Arc::new(InstancePool::new(self.name.clone(), ctx.pool_config.clone()));
                pool.update_instances(&instances);

                let forwarder = Forwarder::start(
                    SocketAddr::new(ctx.bridge_ip, 0),
                    service.protocol(),
                    pool,
                    ctx.forwarder_context(&self.name),
                )
                .await?;

                let rule = Rule::dnat(address, forwarder.local_addr());
                if let Err(e) = ctx.netfilter.add_rule(&rule) {
                    forwarder.stop().await;
                    return Err(e.into());
                }

                Ok(ServiceState::Forwarding {
                    address,
                    rule,
                    forwarder,
                    instances,
                })
            }
        }
    }
}

async fn release(ctx: &BalancerContext, name: &str, state: ServiceState) {
    match state {
        ServiceState::NotForwarding => {}
        ServiceState::Rejecting { rule, .. } => delete_rule(ctx, name, &rule),
        ServiceState::Forwarding { rule, forwarder, .. } => {
            // Unhook first so no new connection is steered at a closing port.
            delete_rule(ctx, name, &rule);
            forwarder.stop().await;
        }
    }
}

/// Delete `rule`, reporting failures instead of returning them.
fn delete_rule(ctx: &BalancerContext, name: &str, rule: &Rule) {
    match ctx.netfilter.delete_rule(rule) {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {
            debug!(service = %name, rule = %rule, "Rule already gone");
        }
        Err(e) => {
            warn!(service = %name, rule = %rule, error = %e, "Failed to remove rule");
            ctx.errors.report(name, e.into());
        }
    }
}

fn sorted_instances(service: &Service) -> Vec<Instance> {
    let mut instances: Vec<Instance> = service.instance_set().into_iter().cloned().collect();
    instances.sort();
    instances
}
