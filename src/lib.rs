//! conductor - multi-agent orchestration engine
//!
//! Manages a pool of long-lived, container-isolated worker agents and
//! dispatches heterogeneous tasks to them with priority scheduling,
//! failure-isolated retries, cross-agent coordination strategies, and
//! token-level cost accounting.

#![allow(clippy::field_reassign_with_default)]
#![allow(clippy::module_inception)]

pub mod agent;
pub mod channel;
pub mod config;
pub mod coordination;
pub mod decomposer;
pub mod error;
pub mod orchestrator;
pub mod protocol;
pub mod queue;
pub mod recovery;
pub mod runtime;
pub mod tokens;
pub mod utils;
pub mod worker;
pub mod workspace;

pub use agent::{Agent, Task, TaskKind, TaskResult, TaskStatus};
pub use config::ConductorConfig;
pub use error::{ConductorError, Result};
pub use orchestrator::Orchestrator;
