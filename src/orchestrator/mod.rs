//! Pipeline orchestrator.
//!
//! Drives a call through the fixed stage walk, persisting each artifact
//! atomically with the stage-pointer advance, retrying transient engine
//! failures with backoff, and serializing every mutation per call id.

mod runner;

pub use runner::Orchestrator;
