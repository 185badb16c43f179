//! # ferry-model
//!
//! Shared vocabulary between the balancer core and its collaborators.
//!
//! ## Inputs
//!
//! The control plane describes services as full-replacement snapshots keyed
//! by name. A [`ServiceUpdate`] carries one such snapshot (or a deletion);
//! the balancer consumes them in deliveries of one or more updates.
//!
//! ## Outputs
//!
//! Every relayed connection produces a [`ConnectionEvent`]; every completed
//! HTTP exchange on an `http` service produces an [`HttpExchangeEvent`].
//! Both are handed to an [`EventSink`].

mod error;
mod events;
mod types;

pub use error::ModelError;
pub use events::*;
pub use types::*;
