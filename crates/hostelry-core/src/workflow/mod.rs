//! Workflow execution: steps, definitions, executions and the engine.

pub mod blocking;
pub mod context;
pub mod definition;
pub mod engine;
pub mod execution;
pub mod expression;
pub mod retry;
pub mod statistics;
pub mod step;
