//! Cron-driven reconciliation sweeps.

pub mod scheduler;

pub use scheduler::SweepScheduler;
