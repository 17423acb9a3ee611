//! In-worker exec agent
//!
//! A small server that runs inside a worker, bound to one owner (task id),
//! and executes commands on behalf of the host. Requests addressed to any
//! other owner are refused.

mod client;
mod protocol;
mod server;

pub use client::AgentClient;
pub use protocol::{AgentRequest, AgentResponse, EXEC_REQUEST_TYPE};
pub use server::AgentServer;
