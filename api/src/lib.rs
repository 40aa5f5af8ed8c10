//! The Warden data model, config, and shared objects
//!
//! Warden is a job-level admission controller: it decides when a batch
//! workload is allowed to start running given finite, shared pools of
//! compute organized as hierarchical quotas with borrowing, preemption,
//! and fair sharing. This crate holds everything the admission engine and
//! its collaborators share: the object model, the resource algebra, the
//! error type, configuration, and tracing setup.

#[macro_use]
extern crate serde_derive;

pub mod conf;
pub mod errors;
pub mod features;
pub mod models;
pub mod utils;

pub use conf::Conf;
pub use errors::Error;
pub use features::Features;
