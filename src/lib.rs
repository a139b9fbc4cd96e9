//! PML: Procedural Memory Layer.
//!
//! A meta-tool layer between an AI agent and a fleet of MCP tool providers.
//! Two operations carry the public surface: `discover` (find the right
//! tool/capability for a natural-language intent, via hybrid dense +
//! learned-hypergraph retrieval) and `execute` (run a dependency-ordered
//! workflow of tool calls in parallel layers).

pub mod config;
pub mod embedding;
pub mod error;
pub mod gateway;
pub mod graph;
pub mod retriever;
pub mod runtime;
pub mod server;
pub mod shgat;
pub mod store;
pub mod workflow;

// Re-export the types callers touch most.
pub use error::{PmlError, Result, WireError};
pub use graph::{Capability, CapabilityGraph, EpisodicTrace, ToolRecord};
pub use retriever::{DiscoverKind, DiscoverOptions, DiscoverResult};
pub use runtime::{DiscoverRequest, DiscoverResponse, ExecuteInput, ExecuteRequest, PmlRuntime};
pub use server::PmlServer;
pub use shgat::{Shgat, ShgatConfig, TrainOptions, TrainReport};
pub use store::{Store, ToolUpsert};
pub use workflow::{ResultBundle, Task, TaskResult, TaskStatus, Workflow};
