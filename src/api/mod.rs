//! HTTP surface for the engine.
//!
//! A thin REST layer over the orchestrator: one endpoint runs a turn,
//! the rest are inspection. All conversation semantics live behind
//! [`crate::orchestrator::Orchestrator`]; handlers only translate.

mod handlers;
mod rest;

pub use handlers::*;
pub use rest::*;
