//! Turn/history analyzer.
//!
//! Walks the flattened message log once and produces the candidate
//! [`ContextItem`]s for the cycle together with the structure later
//! stages need: tool chains (ACTIVE or COMPLETED), conversational
//! segments, the current user message, system messages and context
//! injections.
//!
//! Malformed structure never fails the walk. Orphan tool results become
//! standalone items flagged `orphan`, and every inconsistency is recorded
//! as a [`ContextError::MalformedConversation`] issue.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use contextloom_core::decision::{Decision, DecisionRecord, DecisionStage};
use contextloom_core::error::ContextError;
use contextloom_core::item::{
    ChainState, ContextItem, ItemId, ItemKind, ItemMetadata, PriorityTier,
};
use contextloom_core::message::{Message, MessageToolCall, Role};
use contextloom_core::tool::ToolExecutionRecord;
use contextloom_core::turn::ConversationTurn;
use serde::Serialize;
use tracing::{debug, warn};

use super::signals::{self, TextPart};
use super::token::{MESSAGE_OVERHEAD, TokenAccountant};

/// How a message participates in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageClass {
    System,
    User,
    Agent,
    ToolResult,
    ContextInjection,
}

pub fn classify(message: &Message) -> MessageClass {
    match message.role {
        Role::System => MessageClass::System,
        Role::User if message.is_context_injection() => MessageClass::ContextInjection,
        Role::User => MessageClass::User,
        Role::Assistant => MessageClass::Agent,
        Role::Tool => MessageClass::ToolResult,
    }
}

/// An atomic call → result → response sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolChain {
    pub id: String,
    pub state: ChainState,
    /// Member items in log order, snippets included
    pub members: Vec<ItemId>,
    pub call_ids: Vec<String>,
    pub tool_names: Vec<String>,
    /// Calls that never received a result
    pub missing_results: Vec<String>,
    pub start_turn: u64,
    pub end_turn: u64,
}

/// A user message and everything up to the next one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub index: usize,
    pub start_turn: u64,
    pub end_turn: u64,
    pub items: Vec<ItemId>,
    /// No active chain, and the segment ends in an agent text response.
    pub completed: bool,
}

/// Everything the analyzer derived from one snapshot.
#[derive(Debug, Clone, Default)]
pub struct ConversationAnalysis {
    /// Candidate items in log order; `sequence` is the index here.
    pub items: Vec<ContextItem>,
    pub tool_chains: Vec<ToolChain>,
    pub segments: Vec<Segment>,
    pub current_user_message: Option<Message>,
    /// Turn of the current user message, else the newest turn
    pub current_turn: u64,
    pub system_messages: Vec<Message>,
    pub context_injections: Vec<ItemId>,
    pub issues: Vec<ContextError>,
    pub decisions: Vec<DecisionRecord>,
}

impl ConversationAnalysis {
    pub fn active_chains(&self) -> impl Iterator<Item = &ToolChain> {
        self.tool_chains
            .iter()
            .filter(|c| c.state == ChainState::Active)
    }

    pub fn completed_segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|s| s.completed)
    }

    pub fn item(&self, id: &ItemId) -> Option<&ContextItem> {
        self.items.iter().find(|i| &i.id == id)
    }
}

// ── Analyzer ──────────────────────────────────────────────────────────────

/// Stateless; borrows the token accountant for item costs.
pub struct HistoryAnalyzer<'a> {
    tokens: &'a TokenAccountant,
}

impl<'a> HistoryAnalyzer<'a> {
    pub fn new(tokens: &'a TokenAccountant) -> Self {
        Self { tokens }
    }

    pub fn analyze(&self, turns: &[ConversationTurn]) -> ConversationAnalysis {
        let flat: Vec<(u64, usize, &Message)> = turns
            .iter()
            .flat_map(|t| {
                t.messages
                    .iter()
                    .enumerate()
                    .map(move |(i, m)| (t.turn_number, i, m))
            })
            .collect();

        let records: HashMap<&str, &ToolExecutionRecord> = turns
            .iter()
            .flat_map(|t| t.tool_records.iter())
            .map(|r| (r.call_id.as_str(), r))
            .collect();
        let answered: HashSet<&str> = flat
            .iter()
            .filter_map(|(_, _, m)| m.tool_call_id.as_deref())
            .collect();

        let current_pos = locate_current_user(&flat);
        let current_turn = current_pos
            .map(|p| flat[p].0)
            .or_else(|| turns.last().map(|t| t.turn_number))
            .unwrap_or(0);

        let mut walk = Walk::new(self.tokens, &records);

        for (pos, (turn, index, message)) in flat.iter().enumerate() {
            let (turn, index) = (*turn, *index);
            if Some(pos) == current_pos {
                walk.interrupt_chain(turn);
                walk.start_segment(turn);
                continue;
            }
            match classify(message) {
                MessageClass::System => walk.system_messages.push((*message).clone()),
                MessageClass::ContextInjection => {
                    let created = walk.push_message(turn, index, message, true);
                    let ids: Vec<ItemId> =
                        created.iter().map(|i| walk.items[*i].id.clone()).collect();
                    walk.injections.extend(ids);
                }
                MessageClass::User => {
                    walk.interrupt_chain(turn);
                    walk.start_segment(turn);
                    let created = walk.push_message(turn, index, message, false);
                    if message.has_tool_calls() {
                        walk.open_or_extend_chain(turn, &created, &message.tool_calls);
                    }
                    walk.mark_response(false);
                }
                MessageClass::Agent => {
                    let created = walk.push_message(turn, index, message, false);
                    if message.has_tool_calls() {
                        walk.open_or_extend_chain(turn, &created, &message.tool_calls);
                        walk.mark_response(false);
                        let missing: Vec<&MessageToolCall> = message
                            .tool_calls
                            .iter()
                            .filter(|c| !answered.contains(c.id.as_str()))
                            .collect();
                        walk.synthesize_results(turn, message.timestamp, &missing);
                    } else {
                        walk.consume_response(turn, &created);
                        walk.mark_response(true);
                    }
                }
                MessageClass::ToolResult => {
                    walk.push_tool_result(turn, index, message);
                    walk.mark_response(false);
                }
            }
        }

        let mut analysis = walk.finish();
        analysis.current_user_message = current_pos.map(|p| flat[p].2.clone());
        analysis.current_turn = current_turn;

        debug!(
            items = analysis.items.len(),
            chains = analysis.tool_chains.len(),
            active = analysis.active_chains().count(),
            segments = analysis.segments.len(),
            issues = analysis.issues.len(),
            "Conversation analyzed"
        );
        analysis
    }
}

/// The last non-injection user message with no agent text after it.
fn locate_current_user(flat: &[(u64, usize, &Message)]) -> Option<usize> {
    let pos = flat
        .iter()
        .rposition(|(_, _, m)| classify(m) == MessageClass::User)?;
    let answered = flat[pos + 1..]
        .iter()
        .any(|(_, _, m)| classify(m) == MessageClass::Agent && !m.has_tool_calls());
    (!answered).then_some(pos)
}

// ── Walk state ────────────────────────────────────────────────────────────

struct ChainDraft {
    id: String,
    members: Vec<usize>,
    pending: BTreeSet<String>,
    call_ids: Vec<String>,
    tool_names: Vec<String>,
    missing: Vec<String>,
    start_turn: u64,
    end_turn: u64,
    state: Option<ChainState>,
}

struct SegmentDraft {
    start_turn: u64,
    end_turn: u64,
    items: Vec<usize>,
    ends_in_response: bool,
}

struct Walk<'a> {
    tokens: &'a TokenAccountant,
    records: &'a HashMap<&'a str, &'a ToolExecutionRecord>,
    items: Vec<ContextItem>,
    item_chain: Vec<Option<usize>>,
    chains: Vec<ChainDraft>,
    open: Option<usize>,
    calls: HashMap<String, MessageToolCall>,
    segments: Vec<SegmentDraft>,
    segment: Option<usize>,
    system_messages: Vec<Message>,
    injections: Vec<ItemId>,
    issues: Vec<ContextError>,
    decisions: Vec<DecisionRecord>,
}

impl<'a> Walk<'a> {
    fn new(
        tokens: &'a TokenAccountant,
        records: &'a HashMap<&'a str, &'a ToolExecutionRecord>,
    ) -> Self {
        Self {
            tokens,
            records,
            items: Vec::new(),
            item_chain: Vec::new(),
            chains: Vec::new(),
            open: None,
            calls: HashMap::new(),
            segments: Vec::new(),
            segment: None,
            system_messages: Vec::new(),
            injections: Vec::new(),
            issues: Vec::new(),
            decisions: Vec::new(),
        }
    }

    // ── Segments ──

    fn start_segment(&mut self, turn: u64) {
        self.segments.push(SegmentDraft {
            start_turn: turn,
            end_turn: turn,
            items: Vec::new(),
            ends_in_response: false,
        });
        self.segment = Some(self.segments.len() - 1);
    }

    fn mark_response(&mut self, is_agent_text: bool) {
        if let Some(s) = self.segment {
            self.segments[s].ends_in_response = is_agent_text;
        }
    }

    // ── Items ──

    #[allow(clippy::too_many_arguments)]
    fn push_item(
        &mut self,
        id: ItemId,
        kind: ItemKind,
        text: String,
        token_count: usize,
        turn: u64,
        timestamp: DateTime<Utc>,
        mut metadata: ItemMetadata,
    ) -> usize {
        if self.segment.is_none() {
            self.start_segment(turn);
        }
        let index = self.items.len();
        if let Some(s) = self.segment {
            let segment = &mut self.segments[s];
            segment.items.push(index);
            segment.end_turn = turn;
            metadata.segment = Some(s);
        }
        self.items.push(ContextItem {
            id,
            kind,
            text,
            token_count,
            turn_index: turn,
            sequence: index,
            timestamp,
            priority_score: 0.0,
            priority_tier: PriorityTier::Minimal,
            metadata,
        });
        self.item_chain.push(None);
        index
    }

    /// A user, agent or injection message, with fenced code split out
    /// into snippet items. Returns the parent index first.
    fn push_message(
        &mut self,
        turn: u64,
        index: usize,
        message: &Message,
        injection: bool,
    ) -> Vec<usize> {
        let parent_id = ItemId::message(turn, index);
        let mut prose = Vec::new();
        let mut snippets = Vec::new();
        for part in signals::split_code_blocks(&message.content) {
            match part {
                TextPart::Prose(p) => prose.push(p),
                TextPart::Code { language, code } => {
                    let id = ItemId::snippet(turn, index, snippets.len());
                    prose.push(format!("[snippet {id}]"));
                    snippets.push((id, language, code));
                }
            }
        }
        let text = prose.join("\n");

        let call_text: Vec<&str> = message
            .tool_calls
            .iter()
            .map(|c| c.arguments.as_str())
            .collect();
        let mut metadata = ItemMetadata {
            file_paths: signals::file_paths(&text),
            function_names: signals::function_names(&text),
            tool_names: message.tool_calls.iter().map(|c| c.name.clone()).collect(),
            error: signals::has_error_marker(&text),
            ..Default::default()
        };
        for args in &call_text {
            merge_unique(&mut metadata.file_paths, signals::file_paths(args));
        }
        let call_tokens: usize = message
            .tool_calls
            .iter()
            .map(|c| self.tokens.count(&c.name) + self.tokens.count(&c.arguments))
            .sum();
        let token_count = MESSAGE_OVERHEAD + self.tokens.count(&text) + call_tokens;

        let kind = ItemKind::Turn {
            role: message.role,
            injection,
            tool_calls: message.tool_calls.clone(),
        };
        for call in &message.tool_calls {
            self.calls.insert(call.id.clone(), call.clone());
        }

        let parent = self.push_item(
            parent_id.clone(),
            kind,
            text,
            token_count,
            turn,
            message.timestamp,
            metadata,
        );
        let mut created = vec![parent];
        for (id, language, code) in snippets {
            let metadata = ItemMetadata {
                file_paths: signals::file_paths(&code),
                function_names: signals::function_names(&code),
                error: signals::has_error_marker(&code),
                ..Default::default()
            };
            let token_count = MESSAGE_OVERHEAD + self.tokens.count(&code);
            created.push(self.push_item(
                id,
                ItemKind::CodeSnippet {
                    language,
                    parent: parent_id.clone(),
                },
                code,
                token_count,
                turn,
                message.timestamp,
                metadata,
            ));
        }
        created
    }

    fn tool_result_item(
        &mut self,
        id: ItemId,
        call_id: &str,
        content: &str,
        turn: u64,
        timestamp: DateTime<Utc>,
    ) -> usize {
        let record = self.records.get(call_id).copied();
        let call = self.calls.get(call_id);
        let tool_name = record
            .map(|r| r.tool_name.clone())
            .or_else(|| call.map(|c| c.name.clone()))
            .unwrap_or_else(|| "unknown".into());
        let text = if content.is_empty() {
            record.map(|r| r.result_payload.clone()).unwrap_or_default()
        } else {
            content.to_string()
        };

        let mut file_paths = Vec::new();
        if let Some(path) = record.and_then(|r| r.target_path()) {
            file_paths.push(path.to_string());
        }
        if let Some(call) = call {
            merge_unique(&mut file_paths, signals::file_paths(&call.arguments));
        }
        merge_unique(&mut file_paths, signals::file_paths(&text));

        let metadata = ItemMetadata {
            file_paths,
            function_names: signals::function_names(&text),
            tool_names: vec![tool_name.clone()],
            error: record.is_some_and(|r| r.error_flag) || signals::has_error_marker(&text),
            ..Default::default()
        };
        let token_count = MESSAGE_OVERHEAD + self.tokens.count(&text);
        self.push_item(
            id,
            ItemKind::ToolResult {
                tool_name,
                call_id: call_id.to_string(),
            },
            text,
            token_count,
            turn,
            timestamp,
            metadata,
        )
    }

    fn push_tool_result(&mut self, turn: u64, index: usize, message: &Message) {
        let call_id = message.tool_call_id.clone().unwrap_or_default();
        let item = self.tool_result_item(
            ItemId::message(turn, index),
            &call_id,
            &message.content,
            turn,
            message.timestamp,
        );

        let in_open_chain = self
            .open
            .filter(|c| self.chains[*c].pending.contains(&call_id));
        match in_open_chain {
            Some(c) => {
                let chain = &mut self.chains[c];
                chain.pending.remove(&call_id);
                chain.end_turn = turn;
                chain.members.push(item);
                self.item_chain[item] = Some(c);
            }
            None => self.mark_orphan(item, &call_id),
        }
    }

    /// Calls answered only by an execution record get a result item
    /// built from the record.
    fn synthesize_results(
        &mut self,
        turn: u64,
        timestamp: DateTime<Utc>,
        calls: &[&MessageToolCall],
    ) {
        for call in calls {
            if !self.records.contains_key(call.id.as_str()) {
                continue;
            }
            let id = ItemId(format!("t{turn}-call-{}", call.id));
            let item = self.tool_result_item(id, &call.id, "", turn, timestamp);
            if let Some(c) = self.open {
                let chain = &mut self.chains[c];
                chain.pending.remove(&call.id);
                chain.members.push(item);
                self.item_chain[item] = Some(c);
            }
        }
    }

    fn mark_orphan(&mut self, item: usize, call_id: &str) {
        let target = &mut self.items[item];
        target.metadata.orphan = true;
        let issue = ContextError::MalformedConversation(format!(
            "orphan tool result {} for unknown call '{call_id}'",
            target.id
        ));
        warn!("{issue}");
        self.issues.push(issue);
        self.decisions.push(DecisionRecord::new(
            DecisionStage::Analyzer,
            target.id.clone(),
            Decision::Demoted,
            "orphan_tool_result",
        ));
    }

    // ── Chains ──

    fn open_or_extend_chain(&mut self, turn: u64, members: &[usize], calls: &[MessageToolCall]) {
        let chain_index = match self.open {
            Some(c) => c,
            None => {
                let id = format!("chain-{}", self.items[members[0]].id);
                self.chains.push(ChainDraft {
                    id,
                    members: Vec::new(),
                    pending: BTreeSet::new(),
                    call_ids: Vec::new(),
                    tool_names: Vec::new(),
                    missing: Vec::new(),
                    start_turn: turn,
                    end_turn: turn,
                    state: None,
                });
                self.open = Some(self.chains.len() - 1);
                self.chains.len() - 1
            }
        };
        let chain = &mut self.chains[chain_index];
        chain.end_turn = turn;
        for call in calls {
            chain.pending.insert(call.id.clone());
            chain.call_ids.push(call.id.clone());
            chain.tool_names.push(call.name.clone());
        }
        for m in members {
            chain.members.push(*m);
            self.item_chain[*m] = Some(chain_index);
        }
    }

    /// Agent text: joins the open chain and closes it once every call
    /// has its result.
    fn consume_response(&mut self, turn: u64, members: &[usize]) {
        let Some(c) = self.open else {
            return;
        };
        let chain = &mut self.chains[c];
        chain.end_turn = turn;
        for m in members {
            chain.members.push(*m);
            self.item_chain[*m] = Some(c);
        }
        if chain.pending.is_empty() {
            chain.state = Some(ChainState::Completed);
            self.open = None;
        }
    }

    /// A new user message closes whatever chain is open.
    fn interrupt_chain(&mut self, turn: u64) {
        let Some(c) = self.open.take() else {
            return;
        };
        let chain = &mut self.chains[c];
        chain.state = Some(ChainState::Completed);
        if !chain.pending.is_empty() {
            chain.missing = std::mem::take(&mut chain.pending).into_iter().collect();
            let issue = ContextError::MalformedConversation(format!(
                "tool chain {} interrupted at turn {turn} with {} result(s) missing",
                chain.id,
                chain.missing.len()
            ));
            warn!("{issue}");
            self.issues.push(issue);
        }
    }

    // ── Output ──

    fn finish(mut self) -> ConversationAnalysis {
        if let Some(c) = self.open.take() {
            let chain = &mut self.chains[c];
            chain.state = Some(ChainState::Active);
            chain.missing = chain.pending.iter().cloned().collect();
        }

        for (item, chain) in self.item_chain.iter().enumerate() {
            if let Some(c) = chain {
                let draft = &self.chains[*c];
                let metadata = &mut self.items[item].metadata;
                metadata.chain_id = Some(draft.id.clone());
                metadata.chain_state = draft.state;
            }
        }

        let tool_chains: Vec<ToolChain> = self
            .chains
            .iter()
            .map(|draft| ToolChain {
                id: draft.id.clone(),
                state: draft.state.unwrap_or(ChainState::Completed),
                members: draft
                    .members
                    .iter()
                    .map(|m| self.items[*m].id.clone())
                    .collect(),
                call_ids: draft.call_ids.clone(),
                tool_names: draft.tool_names.clone(),
                missing_results: draft.missing.clone(),
                start_turn: draft.start_turn,
                end_turn: draft.end_turn,
            })
            .collect();

        let segments = self
            .segments
            .iter()
            .enumerate()
            .map(|(index, draft)| {
                let has_active = draft
                    .items
                    .iter()
                    .any(|i| self.items[*i].in_active_chain());
                Segment {
                    index,
                    start_turn: draft.start_turn,
                    end_turn: draft.end_turn,
                    items: draft.items.iter().map(|i| self.items[*i].id.clone()).collect(),
                    completed: !draft.items.is_empty() && !has_active && draft.ends_in_response,
                }
            })
            .collect();

        ConversationAnalysis {
            items: self.items,
            tool_chains,
            segments,
            current_user_message: None,
            current_turn: 0,
            system_messages: self.system_messages,
            context_injections: self.injections,
            issues: self.issues,
            decisions: self.decisions,
        }
    }
}

fn merge_unique(into: &mut Vec<String>, more: Vec<String>) {
    for value in more {
        if !into.contains(&value) {
            into.push(value);
        }
    }
}
