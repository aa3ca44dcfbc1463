//! Context assembly pipeline stages.
//!
//! | Stage | Input | Output |
//! |-------|-------|--------|
//! | Analyzer | conversation turns | candidate items, tool chains, segments |
//! | Prioritizer | items + current query | priority score and tier per item |
//! | Correlator | prioritized items | references and dependency clusters |
//! | Assembler | clusters + budget | ordered selection within budget |
//! | Bridge builder | excluded clusters | compact bridge items |
//!
//! Every stage is a pure function of its inputs and returns its decision
//! records alongside its result.

pub mod analyzer;
pub mod assembler;
pub mod bridge;
pub mod budget;
pub mod correlator;
pub mod prioritizer;
pub mod signals;
pub mod token;

pub use analyzer::{ConversationAnalysis, HistoryAnalyzer, MessageClass, Segment, ToolChain};
pub use assembler::{
    AssembledContext, AssemblyInput, ContextAssembler, OmissionRecord, TierStats,
};
pub use bridge::{BridgeBuilder, ExcludedCluster};
pub use budget::{Budget, BudgetManager};
pub use correlator::{CorrelationResult, DependencyCluster, DependencyCorrelator, ReferenceGraph};
pub use prioritizer::{ContentPrioritizer, PriorityFactors, ScoringContext};
pub use token::{TextTokenizer, TokenAccountant, TokenStrategy};
