//! # koney-forwarder
//!
//! Companion process of the controller: tails the kernel-probe host's
//! log stream, turns raw probe events into deduplicated,
//! fingerprint-filtered canonical alerts, and serves the HTTP surface
//! the tracing policies point their webhooks at. Triggers only
//! schedule work; the debouncer owns the scan timer and one scan
//! covers the recent log window.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod debounce;
pub mod dedup;
pub mod pipeline;
pub mod server;
pub mod sink;

pub use pipeline::{Pipeline, ScanSummary};
