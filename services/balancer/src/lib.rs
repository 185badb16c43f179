//! Host-local transparent load balancer.
//!
//! Each service with a virtual address gets packet-filter rules that either
//! steer its traffic to a local forwarder (when it has instances) or reject
//! it outright (when it has none). Forwarders pick an instance per
//! connection from a backoff-aware pool and relay with a TCP or HTTP shim.

pub mod balancer;
pub mod config;
pub mod error;
pub mod feed;
pub mod forwarder;
pub mod pool;
pub mod service;
pub mod shim;

pub use balancer::{Balancer, BalancerContext};
pub use config::{Config, UpdateSource};
pub use error::{BalancerError, ErrorReporter, OperationalError};
pub use forwarder::{Forwarder, ForwarderContext};
pub use pool::{InstancePool, InstanceState, PoolConfig};
pub use service::{ServiceSlot, ServiceState, StateKind};
