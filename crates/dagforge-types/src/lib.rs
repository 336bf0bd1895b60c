pub mod event;
pub mod execution;
pub mod job;
pub mod provider;
pub mod tool;

pub use event::DagEvent;
pub use execution::{
    DagRecord, DagStatus, Execution, ExecutionStatus, PlanningAttempt, SubStep, SubStepStatus,
};
pub use job::{
    ActionType, Coverage, Entity, Intent, Job, JobValidationError, SubTask, ToolOrPrompt,
    Validation, NO_DEPENDENCIES,
};
pub use provider::{GenerationStats, ModelInfo, ProviderInfo, TokenUsage};
pub use tool::{ToolResult, ToolSchema};
