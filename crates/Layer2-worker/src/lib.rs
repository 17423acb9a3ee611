//! # relay-worker
//!
//! Worker lifecycle and execution engine for Relay.
//! Turns a task into work performed inside an ephemeral, isolated worker
//! and reports the result.
//!
//! ## Features
//!
//! - Backend fallback: Pod → Container → Host
//! - Per-task worker reuse with an atomic get-or-insert registry
//! - Bounded readiness waits with cancellation
//! - Host, container and pod exec transports
//! - `EXEC:` directives run in the same worker
//! - Continuation sessions per task
//! - Guaranteed worker teardown
//! - **In-worker exec agent** (Unix)

#[cfg(unix)]
pub mod agent;
pub mod backend;
pub mod context;
pub mod directive;
pub mod dispatcher;
pub mod platform;
pub mod pool;
pub mod registry;
pub mod reporter;
pub mod session;
pub mod state;
pub mod task;
pub mod transport;
pub mod worker;

// Engine
pub use dispatcher::{DispatchSettings, TaskDispatcher, SESSION_FILE_ENV};
pub use pool::{DispatchHandle, DispatchPool};
pub use registry::{ActiveWorker, WorkerLease, WorkerRegistry};
pub use reporter::{LogReporter, ResultReporter};
pub use session::{Session, SessionRegistry};

// Task model
pub use context::{PrimaryCommand, TaskContext};
pub use directive::{parse_directives, DIRECTIVE_PREFIX};
pub use state::WorkerState;
pub use task::{ExecutionResult, OutputFormat, Task, TaskId, DEFAULT_MAX_TURNS};
pub use worker::{BackendKind, Worker};

// Backends and transports
pub use backend::{
    Backend, ContainerBackend, ContainerSettings, HostBackend, PodBackend, PodSettings,
    WorkerBackend,
};
pub use platform::{ContainerRuntime, DockerRuntime, KubePodApi, PodApi};
pub use transport::{
    ContainerTransport, ExecOptions, ExecTransport, HostTransport, PodTransport,
};

// In-worker agent
#[cfg(unix)]
pub use agent::{AgentClient, AgentRequest, AgentResponse, AgentServer};
