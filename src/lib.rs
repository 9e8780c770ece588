//! Pipeline-parallel training over an interpreted graph IR.
//!
//! A model is a linear sequence of typed IR nodes (placeholders, attribute
//! reads, function/method/submodule calls, an output marker). The sequence
//! is cut into contiguous stages by submodule-call count, one worker rank
//! per stage. Each rank interprets its node range forward per micro-batch,
//! ships the boundary activation downstream as a self-described frame, then
//! replays its range in reverse to propagate gradients back upstream, with
//! all-forward-then-all-backward scheduling.

pub mod backward;
pub mod codec;
pub mod config;
pub mod error;
pub mod graph;
pub mod models;
pub mod registry;
pub mod runner;
pub mod split;
pub mod transport;
pub mod value;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use graph::{Arg, Graph, GraphBuilder, Node, NodeId, OpKind};
pub use registry::{CallableModule, ModuleRegistry};
pub use runner::StageRunner;
pub use split::{partition, stage_range, RangeMetadata};
pub use transport::{memory_mesh, MemoryMesh, Messaging, TcpMesh};
pub use value::Value;
