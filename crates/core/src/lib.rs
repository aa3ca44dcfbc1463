//! # contextloom core
//!
//! Domain types, traits, and error definitions for the contextloom context
//! assembly engine. This crate has **no runtime dependencies** beyond serde
//! and friends: it defines the model every other crate works against.
//!
//! ## Layout
//!
//! - [`message`] / [`turn`] / [`tool`]: the raw conversation log as the
//!   conversation store hands it over.
//! - [`item`] / [`reference`]: the per-cycle candidate items and the typed
//!   edges between them.
//! - [`decision`]: telemetry decision records and the sink trait.
//! - [`provider`]: the language-model client seam (request, response,
//!   precise token counting).
//! - [`store`]: the conversation store seam.

pub mod decision;
pub mod error;
pub mod item;
pub mod message;
pub mod provider;
pub mod reference;
pub mod store;
pub mod tool;
pub mod turn;

// Re-export key types at crate root for ergonomics
pub use decision::{Decision, DecisionRecord, DecisionStage, TelemetrySink};
pub use error::{ContextError, Error, RequestError, Result, StoreError, TokenCountError};
pub use item::{ChainState, ContextItem, ItemId, ItemKind, ItemMetadata, PriorityTier};
pub use message::{Message, MessageToolCall, Role, SessionId};
pub use provider::{
    LanguageModelClient, ModelRequest, ModelResponse, PreciseTokenCounter, ToolDefinition, Usage,
};
pub use reference::{BridgeType, Reference, ReferenceFactors, ReferenceStrength, ReferenceType};
pub use store::{ConversationSnapshot, ConversationStore};
pub use tool::ToolExecutionRecord;
pub use turn::ConversationTurn;
