//! # koney-core
//!
//! Core library for koney - a cluster-level controller that turns
//! declarative deception policies into decoy files inside running
//! workloads and kernel-level tracing rules that report any access to
//! them.
//!
//! This crate provides the building blocks shared by the controller and
//! the alert forwarder:
//!
//! - **Data model**: `DeceptionPolicy`, traps, resource filters, and
//!   status conditions
//! - **Matching**: resource filters and container-name patterns
//!   (literal, glob, regex)
//! - **Identity**: content-addressed naming of derived resources
//! - **Fingerprinting**: recognition of the controller's own decoy
//!   writes so they never alert
//! - **Cluster boundary**: the [`cluster::ClusterClient`] trait plus an
//!   in-memory implementation used by every test
//!
//! ## Example
//!
//! ```rust
//! use koney_core::api::Trap;
//! use koney_core::identity;
//!
//! let trap = Trap::filesystem_honeytoken("/run/secrets/aws_token.json", "{}", true);
//! let name = identity::tracing_policy_name(&trap).unwrap();
//! assert!(name.starts_with("koney-tracing-policy-"));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod alert;
pub mod api;
pub mod changes;
pub mod cluster;
pub mod config;
pub mod fingerprint;
pub mod identity;
pub mod matching;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::api::{
        CaptorStrategy, DeceptionPolicy, DecoyStrategy, ResourceFilter, ResourceFilters, Trap,
        TrapKind,
    };
    pub use crate::cluster::{ClusterClient, ClusterError, Workload};
    pub use crate::identity::{monitoring_id, tracing_policy_name, trap_id};
}

/// Re-export commonly used types at the crate root.
pub use api::{DeceptionPolicy, Trap};
pub use cluster::{ClusterClient, ClusterError};
