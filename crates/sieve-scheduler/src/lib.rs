//! Change classification, job gating and run orchestration for Sieve.

pub mod classifier;
pub mod concurrency;
pub mod coordinator;
pub mod dag;
pub mod plan;
pub mod scheduler;
pub mod service_gate;
pub mod sink;
pub mod triggers;

pub use classifier::PathClassifier;
pub use concurrency::{ArbiterConfig, ConcurrencyArbiter, GroupRegistry, RunHandle};
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use dag::JobGraph;
pub use scheduler::{RunScheduler, SchedulerConfig};
pub use service_gate::{GateError, Ready, ServiceGate};
