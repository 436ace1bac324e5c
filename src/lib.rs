//! Fuzzball Agent - per-node job and volume executor
//!
//! Receives commands from the scheduler over a message bus, runs jobs
//! through a sandbox runtime, manages node-local volumes and keeps a
//! content-addressed image cache.

pub mod agent;
pub mod bus;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod image;
pub mod orchestration;
pub mod shutdown;
pub mod volume;

pub use agent::{Agent, AgentState};
pub use error::{AgentError, AgentResult};
