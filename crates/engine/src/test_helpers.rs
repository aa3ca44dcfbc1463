//! Shared test helpers: item builders, conversation builders and a
//! scripted language-model client.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use contextloom_core::error::RequestError;
use contextloom_core::item::{ContextItem, ItemId, ItemKind, ItemMetadata, PriorityTier};
use contextloom_core::message::{Message, MessageToolCall, Role};
use contextloom_core::provider::{LanguageModelClient, ModelRequest, ModelResponse, Usage};
use contextloom_core::tool::ToolExecutionRecord;
use contextloom_core::turn::ConversationTurn;

use crate::context::signals;

/// An assistant turn item costing `tokens`, with metadata extracted
/// from `text`.
pub fn sized(sequence: usize, turn: u64, text: &str, tokens: usize) -> ContextItem {
    ContextItem {
        id: ItemId::message(turn, sequence),
        kind: ItemKind::Turn {
            role: Role::Assistant,
            injection: false,
            tool_calls: vec![],
        },
        text: text.into(),
        token_count: tokens,
        turn_index: turn,
        sequence,
        timestamp: Utc::now(),
        priority_score: 0.5,
        priority_tier: PriorityTier::Medium,
        metadata: ItemMetadata {
            file_paths: signals::file_paths(text),
            function_names: signals::function_names(text),
            error: signals::has_error_marker(text),
            ..Default::default()
        },
    }
}

/// A tool result item.
pub fn tool_item(sequence: usize, turn: u64, tool: &str, text: &str, tokens: usize) -> ContextItem {
    let mut item = sized(sequence, turn, text, tokens);
    item.kind = ItemKind::ToolResult {
        tool_name: tool.into(),
        call_id: format!("call_{sequence}"),
    };
    item.metadata.tool_names = vec![tool.into()];
    item
}

/// A completed turn: user question, agent answer.
pub fn exchange(turn_number: u64, question: &str, answer: &str) -> ConversationTurn {
    ConversationTurn::new(turn_number)
        .with_message(Message::user(question))
        .with_message(Message::assistant(answer))
}

/// A turn whose agent calls `tool` on `path` and, when `result` is set,
/// receives its output. With `follow_up` the chain is closed.
pub fn tool_turn(
    turn_number: u64,
    question: &str,
    tool: &str,
    path: &str,
    result: Option<&str>,
    follow_up: Option<&str>,
) -> ConversationTurn {
    let call_id = format!("call_t{turn_number}");
    let call = MessageToolCall::new(&call_id, tool, serde_json::json!({ "path": path }));
    let mut turn = ConversationTurn::new(turn_number)
        .with_message(Message::user(question))
        .with_message(Message::assistant(format!("Let me use {tool}.")).with_tool_calls(vec![call]));
    if let Some(output) = result {
        turn = turn
            .with_message(Message::tool_result(&call_id, output))
            .with_record(ToolExecutionRecord {
                call_id: call_id.clone(),
                tool_name: tool.into(),
                arguments: serde_json::json!({ "path": path }),
                result_payload: output.into(),
                error_flag: false,
                duration_ms: 12,
            });
    }
    if let Some(text) = follow_up {
        turn = turn.with_message(Message::assistant(text));
    }
    turn
}

pub fn text_response(text: &str) -> ModelResponse {
    ModelResponse {
        message: Message::assistant(text),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock-model".into(),
    }
}

/// Returns scripted results in order and records every request.
pub struct ScriptedClient {
    script: Mutex<Vec<Result<ModelResponse, RequestError>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedClient {
    pub fn new(script: Vec<Result<ModelResponse, RequestError>>) -> Self {
        Self {
            script: Mutex::new(script),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModelClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted_mock"
    }

    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, RequestError> {
        let mut requests = self.requests.lock().unwrap();
        let call = requests.len();
        requests.push(request);
        drop(requests);

        let script = self.script.lock().unwrap();
        match script.get(call) {
            Some(result) => result.clone(),
            None => panic!("ScriptedClient: no more results (call #{call}, have {})", script.len()),
        }
    }
}

/// A client that never answers.
pub struct HangingClient;

#[async_trait]
impl LanguageModelClient for HangingClient {
    fn name(&self) -> &str {
        "hanging_mock"
    }

    async fn complete(&self, _request: ModelRequest) -> Result<ModelResponse, RequestError> {
        std::future::pending().await
    }
}
