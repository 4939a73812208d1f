//! Workflow execution runtime
//!
//! This crate validates workflow graphs, compiles each node into its
//! wrapper chain and runs the chains in topological order, fanning batch
//! nodes out over a bounded worker pool.

pub mod batch_executor;
mod compiler;
mod executor;
mod record;
mod registry;
mod runtime;
pub mod unit;
mod validator;

pub use batch_executor::{BatchExecutor, BatchOutcome, ItemCall, ItemFn};
pub use compiler::{CompiledWorkflow, Compiler};
pub use executor::{ExecutionFailure, ExecutionResult, WorkflowExecutor};
pub use record::{BatchSummary, ExecutionRecord, RecordStatus};
pub use registry::{NodeFactory, NodeRegistry, NodeTypeInfo, PortDefinition, ResolvedNodeType};
pub use runtime::{FlowRuntime, RuntimeConfig};
pub use unit::{ExecutableUnit, ExecutionContext, ExecutionSettings, UnitBlueprint};
pub use validator::{GraphValidator, ValidationResult, BATCH_OUTPUTS};
