//! Recipe graph machinery.
//!
//! A recipe is a DAG of typed nodes wired by data-flow edges. This module
//! validates the graph and fixes its execution order (`validate`), resolves
//! each node's inputs and prompt from upstream outputs (`resolve`), and runs a
//! single node against its capability (`executor`, `transform`). Walking a
//! whole execution and persisting its state is the orchestrator's job.

pub mod executor;
pub mod resolve;
pub mod transform;
pub mod validate;

pub use executor::{Capabilities, NodeExecutor, NodeOutcome, ProgressFn};
pub use resolve::{resolve_node_input, NodeOutputs, ResolvedInput};
pub use validate::{ancestors, topological_order, validate_dag};
