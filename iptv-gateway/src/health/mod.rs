//! Channel health probing.

pub mod engine;
pub mod prober;

pub use engine::{HealthProbeEngine, ProbeReport, ProbeSummary};
pub use prober::{NetworkProber, ProbeOutcome, SourceProber};
