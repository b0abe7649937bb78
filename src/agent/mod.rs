//! Agent runtime for the bridge protocol
//!
//! Task intake, the in-flight registry, the executor seam and the lifecycle
//! state machine that ties them to the message bus.

pub mod executor;
pub mod http_executor;
pub mod registry;
pub mod runtime;

pub use executor::{EchoExecutor, ExecutorError, TaskExecutor, TaskOutcome};
pub use http_executor::{HttpExecutorConfig, HttpTaskExecutor};
pub use registry::{Admission, AgentTask, ClaimedTask, TaskRegistry};
pub use runtime::{AgentIdentity, AgentRuntime, Intake, RuntimeError, RuntimeSettings};
