//! Tool execution records.
//!
//! The tool-execution layer runs tools; this crate only reads the
//! records it leaves behind so that scoring and correlation can see
//! which tool ran, on what, and whether it failed.

use serde::{Deserialize, Serialize};

/// A completed tool execution as reported by the tool-execution layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionRecord {
    /// The call ID this record belongs to (matches `MessageToolCall::id`)
    pub call_id: String,

    /// Name of the tool that ran
    pub tool_name: String,

    /// Arguments as a JSON value
    #[serde(default)]
    pub arguments: serde_json::Value,

    /// Raw result payload
    #[serde(default)]
    pub result_payload: String,

    /// Whether the tool reported a failure
    #[serde(default)]
    pub error_flag: bool,

    /// Wall-clock duration in milliseconds
    #[serde(default)]
    pub duration_ms: u64,
}

impl ToolExecutionRecord {
    /// Best-effort extraction of a file path from the call arguments.
    ///
    /// Looks at the argument keys tools conventionally use for paths.
    pub fn target_path(&self) -> Option<&str> {
        ["path", "file", "file_path", "filename", "target"]
            .iter()
            .find_map(|key| self.arguments.get(*key).and_then(|v| v.as_str()))
    }
}
