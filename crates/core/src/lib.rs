//! Domain types for the comfyjob adapter.
//!
//! Holds everything that can be reasoned about without touching the
//! network: the workflow graph and its node roles, the job contract
//! exchanged with the serverless runtime, and asset filename rules.

pub mod assets;
pub mod error;
pub mod job;
pub mod workflow;
