pub mod builder;
pub mod context;
pub mod engine;
pub mod graph;
pub mod plan;
pub mod types;

pub use builder::PlanBuilder;
pub use context::OrchestrationContext;
pub use engine::{EngineConfig, ExecutionEngine};
pub use graph::DependencyGraph;
pub use plan::{ExecutionPlan, PlanExecutor, PlanOutcome, PlanStep, PlannedCall, StepReport, ToolOutcome};
pub use types::*;
