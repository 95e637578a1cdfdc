//! Host step execution and service health probes for Sieve.

pub mod output;
pub mod probes;
pub mod shell;

pub use output::{OutputStream, OutputTail};
pub use probes::{CommandProbe, DefaultProbeFactory, TcpProbe};
pub use shell::{RunnerConfig, ShellRunner};
