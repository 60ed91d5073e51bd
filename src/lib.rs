//! Fluxgate - Request Admission Engine
//!
//! This crate implements a request-admission engine: given a stream of
//! identified requests it decides in real time whether each request is
//! allowed under the configured rate policies, and if not, how long the
//! caller must wait. It sustains high call rates with bounded memory
//! even when the number of distinct request identities is unbounded or
//! adversarial, by keeping exact GCRA counters for frequently-seen
//! identities and approximate sketch counters for the long tail.
//!
//! The engine is synchronous and deterministic given its state: no
//! background threads, no timers. The caller drives time-window rotation
//! explicitly via [`Fluxgate::rotate`].

pub mod clock;
pub mod config;
pub mod error;
pub mod limiter;

pub use config::{FluxgateConfig, PolicyAction, PolicySpec};
pub use error::{FluxgateError, Result};
pub use limiter::{CheckDecision, CheckRequest, CheckResult, Fluxgate};
