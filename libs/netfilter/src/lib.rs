//! Packet-filter management for the balancer.
//!
//! This library owns one dedicated chain per table and the rules inside it:
//! - DNAT rules steering a service's virtual address to a local forwarder
//! - REJECT rules answering connections for services with no instances
//!
//! Commands are issued through an [`Invoker`], so tests can run against an
//! in-memory packet filter (the `testing` feature) instead of a real
//! `iptables` binary.

mod chain;
mod error;
mod invoke;
#[cfg(any(test, feature = "testing"))]
mod memory;
mod rule;

pub use chain::{ChainManager, FILTER_HOOKS, NAT_HOOKS};
pub use error::{sanitize_output, NetfilterError, MAX_MESSAGE_LEN};
pub use invoke::{InvokeError, Invoker, IptablesInvoker};
#[cfg(any(test, feature = "testing"))]
pub use memory::{MemoryInvoker, RuleSnapshot};
pub use rule::{Rule, Table};
