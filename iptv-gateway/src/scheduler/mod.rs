//! Background job scheduling.

mod periodic;

pub use periodic::{FirstRun, JobHandle, PeriodicJob};
