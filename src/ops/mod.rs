//! Operation plans and the builder used to assemble them.

pub mod builder;
pub mod plan;

pub use builder::{PhaseHandle, PlanBuilder, PlanIdentity};
pub use plan::{
    OperationData, OperationPhase, OperationPlan, PhaseData, PhaseState, PlanChange,
    PlanChangelog, Server, aggregate_state,
};
