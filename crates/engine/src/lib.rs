//! # contextloom engine
//!
//! Turns a conversation snapshot into a bounded context payload.
//!
//! The [`context`] module holds the pipeline stages, leaves first: token
//! accounting, the budget manager, the history analyzer, the content
//! prioritizer, the dependency correlator, the context assembler and the
//! bridge builder. [`pipeline::ContextPipeline`] runs them in order for
//! one cycle; [`optimizer::ProgressiveOptimizer`] wraps the pipeline and
//! the language-model call, retrying with reduced context on overflow or
//! transient failure.

pub mod context;
pub mod optimizer;
pub mod pipeline;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use optimizer::{OptimizerOutcome, ProgressiveOptimizer, RetryState};
pub use pipeline::{ContextPipeline, PipelineOutput, RequestFrame};
