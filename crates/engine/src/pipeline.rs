//! One assembly cycle: analyze → reduce → prioritize → correlate →
//! assemble (with bridging), over an immutable conversation snapshot.
//!
//! The pipeline is a pure function of the snapshot, the request frame,
//! the reduction level and the budget pressure. Every stage hands its
//! decision records back; they are merged here in stage order.

use std::collections::{HashMap, HashSet};

use contextloom_config::{AppConfig, ContextStrategy};
use contextloom_core::decision::{Decision, DecisionRecord, DecisionStage};
use contextloom_core::error::ContextError;
use contextloom_core::item::{ContextItem, ItemId, ItemKind};
use contextloom_core::message::{Message, Role};
use contextloom_core::provider::{ModelRequest, ToolDefinition};
use contextloom_core::store::ConversationSnapshot;
use serde::Serialize;
use tracing::{debug, warn};

use crate::context::{
    AssembledContext, AssemblyInput, Budget, BudgetManager, ContentPrioritizer, ContextAssembler,
    ConversationAnalysis, DependencyCorrelator, HistoryAnalyzer, ScoringContext, TokenAccountant,
};

/// The fixed parts of a request, around the assembled history.
#[derive(Debug, Clone, Default)]
pub struct RequestFrame {
    pub model: String,
    pub system_instructions: String,
    pub tool_schemas: Vec<ToolDefinition>,
    pub max_output_tokens: Option<u32>,
}

impl RequestFrame {
    pub fn new(model: impl Into<String>, system_instructions: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_instructions: system_instructions.into(),
            ..Default::default()
        }
    }

    /// Frame for the configured model, without instructions or tools.
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(&config.model.name, "").with_max_output_tokens(config.model.max_output_tokens)
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tool_schemas = tools;
        self
    }

    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = Some(max);
        self
    }
}

/// Counts describing what the analyzer and correlator found.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisSummary {
    pub items: usize,
    /// Items left after level reduction
    pub candidates: usize,
    pub tool_chains: usize,
    pub active_chains: usize,
    pub segments: usize,
    pub completed_segments: usize,
    pub references: usize,
    pub clusters: usize,
    pub issues: Vec<String>,
    pub correlation_timeout: bool,
    pub token_strategy: String,
}

/// Result of one cycle.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub context: AssembledContext,
    pub decisions: Vec<DecisionRecord>,
    pub analysis: AnalysisSummary,
    pub current_user_message: Option<Message>,
    /// System messages found in the log; merged into the system prompt
    pub system_messages: Vec<Message>,
    /// System instructions + tool schemas + current user message
    pub base_prompt_tokens: usize,
    pub level: u32,
}

impl PipelineOutput {
    /// Merge frame, history and current message into a request.
    pub fn to_request(&self, frame: &RequestFrame) -> ModelRequest {
        let mut system = frame.system_instructions.clone();
        for message in &self.system_messages {
            if !system.is_empty() {
                system.push_str("\n\n");
            }
            system.push_str(&message.content);
        }

        let items = &self.context.items;
        let snippets: HashMap<&str, &ContextItem> = items
            .iter()
            .filter(|i| i.kind.is_snippet())
            .map(|i| (i.id.as_str(), i))
            .collect();
        let present: HashSet<&ItemId> = items.iter().map(|i| &i.id).collect();

        let mut messages: Vec<Message> = items
            .iter()
            .filter_map(|item| render(item, &snippets, &present))
            .collect();
        if let Some(current) = &self.current_user_message {
            messages.push(current.clone());
        }

        ModelRequest {
            model: frame.model.clone(),
            system,
            messages,
            tools: frame.tool_schemas.clone(),
            max_tokens: frame.max_output_tokens,
        }
    }
}

/// Turns a snapshot into an [`AssembledContext`].
pub struct ContextPipeline {
    config: AppConfig,
    tokens: TokenAccountant,
    fixed_budget: Option<usize>,
}

impl ContextPipeline {
    pub fn new(config: AppConfig, tokens: TokenAccountant) -> Self {
        Self {
            config,
            tokens,
            fixed_budget: None,
        }
    }

    /// Use exactly `available` history tokens instead of deriving the
    /// budget from the model limit.
    pub fn with_fixed_budget(mut self, available: usize) -> Self {
        self.fixed_budget = Some(available);
        self
    }

    pub fn with_strategy(mut self, strategy: ContextStrategy) -> Self {
        self.config.bridge.strategy = strategy;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn tokens(&self) -> &TokenAccountant {
        &self.tokens
    }

    /// Run one cycle at reduction `level` and budget `pressure`.
    ///
    /// Fails only with `ChainExceedsBudget` under the fail policy; every
    /// other problem degrades the context instead.
    pub fn build(
        &self,
        snapshot: &ConversationSnapshot,
        frame: &RequestFrame,
        level: u32,
        pressure: usize,
    ) -> Result<PipelineOutput, ContextError> {
        let analysis = HistoryAnalyzer::new(&self.tokens).analyze(snapshot.turns());
        for issue in &analysis.issues {
            debug!(%issue, "Conversation issue");
        }

        let base_prompt_tokens = self.base_prompt_tokens(frame, &analysis);
        let budget = self.budget(base_prompt_tokens, pressure);

        let mut decisions = analysis.decisions.clone();
        let (mut items, reduced) = self.reduce(&analysis, level);
        decisions.extend(reduced);

        let prioritizer = ContentPrioritizer::new(self.config.scoring.clone());
        let query = analysis
            .current_user_message
            .as_ref()
            .map(|m| m.content.as_str());
        let scoring_context = ScoringContext::build(&items, query, analysis.current_turn);
        let mut scoring = prioritizer.prioritize(&mut items, &scoring_context);

        let correlator = DependencyCorrelator::new(self.config.correlation.clone());
        let mut correlation = correlator.correlate(&items);
        if correlation.timeout.is_some() {
            // Recency-only heuristic
            scoring = prioritizer.prioritize_by_recency(&mut items, analysis.current_turn);
            correlation.clusters = correlator.cluster(&items, &correlation.references);
        }
        decisions.extend(scoring);
        decisions.extend(std::mem::take(&mut correlation.decisions));

        let assembler = ContextAssembler::new(
            self.config.assembly.clone(),
            self.config.bridge.clone(),
            self.config.budget.pressure_threshold,
        );
        let (context, assembled) = assembler.assemble(&AssemblyInput {
            items: &items,
            references: &correlation.references,
            clusters: &correlation.clusters,
            segments: &analysis.segments,
            budget,
            tokens: &self.tokens,
        })?;
        decisions.extend(assembled);

        let summary = AnalysisSummary {
            items: analysis.items.len(),
            candidates: items.len(),
            tool_chains: analysis.tool_chains.len(),
            active_chains: analysis.active_chains().count(),
            segments: analysis.segments.len(),
            completed_segments: analysis.completed_segments().count(),
            references: correlation.references.len(),
            clusters: correlation.clusters.len(),
            issues: analysis.issues.iter().map(|i| i.to_string()).collect(),
            correlation_timeout: correlation.timeout.is_some(),
            token_strategy: self.tokens.strategy().to_string(),
        };

        Ok(PipelineOutput {
            context,
            decisions,
            analysis: summary,
            current_user_message: analysis.current_user_message,
            system_messages: analysis.system_messages,
            base_prompt_tokens,
            level,
        })
    }

    fn base_prompt_tokens(&self, frame: &RequestFrame, analysis: &ConversationAnalysis) -> usize {
        let system = self.tokens.count(&frame.system_instructions)
            + analysis
                .system_messages
                .iter()
                .map(|m| self.tokens.count_message(m))
                .sum::<usize>();
        let tools = self.tokens.count_tools(&frame.tool_schemas);
        let user = analysis
            .current_user_message
            .as_ref()
            .map(|m| self.tokens.count_message(m))
            .unwrap_or(0);
        system + tools + user
    }

    fn budget(&self, base_prompt_tokens: usize, pressure: usize) -> Budget {
        if let Some(available) = self.fixed_budget {
            return Budget::fixed(available, self.config.budget.tolerance);
        }
        let manager = BudgetManager::new(self.config.model.context_limit, &self.config.budget);
        match manager.available_budget(base_prompt_tokens, pressure) {
            Ok(budget) => budget,
            Err(err) => {
                warn!(%err, "Falling back to emergency context");
                Budget::emergency(manager.limit(), base_prompt_tokens, manager.margin_for(pressure))
            }
        }
    }

    /// Drop candidates outside the window of `level`. Active chains stay.
    fn reduce(
        &self,
        analysis: &ConversationAnalysis,
        level: u32,
    ) -> (Vec<ContextItem>, Vec<DecisionRecord>) {
        let optimizer = &self.config.optimizer;
        // Turns kept before the current one, and snippets kept
        let (turns, snippets) = match level {
            0 => return (analysis.items.clone(), Vec::new()),
            1 => (optimizer.moderate_turns as u64, optimizer.moderate_snippets),
            2 => (optimizer.aggressive_turns as u64, optimizer.aggressive_snippets),
            _ => (0, 0),
        };
        let current = analysis.current_turn;
        let in_window = |item: &ContextItem| current.saturating_sub(item.turn_index) <= turns;

        let allowed_snippets: HashSet<&ItemId> = analysis
            .items
            .iter()
            .rev()
            .filter(|i| i.kind.is_snippet() && in_window(i))
            .take(snippets)
            .map(|i| &i.id)
            .collect();

        let mut kept = Vec::new();
        let mut decisions = Vec::new();
        for item in &analysis.items {
            let keep = item.in_active_chain()
                || (in_window(item) && (!item.kind.is_snippet() || allowed_snippets.contains(&item.id)));
            if keep {
                kept.push(item.clone());
            } else {
                decisions.push(
                    DecisionRecord::new(
                        DecisionStage::Optimizer,
                        item.id.clone(),
                        Decision::Excluded,
                        format!("reduction_level_{level}"),
                    )
                    .with_tokens(-(item.token_count as i64)),
                );
            }
        }
        debug!(level, kept = kept.len(), dropped = decisions.len(), "Candidates reduced");
        (kept, decisions)
    }
}

// ── Rendering ─────────────────────────────────────────────────────────────

fn render(
    item: &ContextItem,
    snippets: &HashMap<&str, &ContextItem>,
    present: &HashSet<&ItemId>,
) -> Option<Message> {
    match &item.kind {
        ItemKind::Turn {
            role,
            injection,
            tool_calls,
        } => {
            let text = inline_snippets(&item.text, snippets);
            let message = match role {
                Role::User if *injection => Message::context_injection(text),
                Role::User => Message::user(text),
                Role::System => Message::system(text),
                Role::Assistant | Role::Tool => Message::assistant(text),
            };
            Some(if tool_calls.is_empty() {
                message
            } else {
                message.with_tool_calls(tool_calls.clone())
            })
        }
        // Inlined into its parent when the parent is present
        ItemKind::CodeSnippet { language, parent } => (!present.contains(parent))
            .then(|| Message::assistant(fence(language.as_deref(), &item.text))),
        ItemKind::ToolResult { call_id, .. } => Some(Message::tool_result(call_id, &item.text)),
        ItemKind::Bridge { .. } => Some(Message::system(&item.text)),
    }
}

/// Replace `[snippet <id>]` markers with the snippet's code block.
fn inline_snippets(text: &str, snippets: &HashMap<&str, &ContextItem>) -> String {
    if !text.contains("[snippet ") {
        return text.to_string();
    }
    text.lines()
        .map(|line| {
            let marker = line
                .trim()
                .strip_prefix("[snippet ")
                .and_then(|rest| rest.strip_suffix(']'));
            match marker {
                Some(id) => match snippets.get(id) {
                    Some(snippet) => {
                        let language = match &snippet.kind {
                            ItemKind::CodeSnippet { language, .. } => language.as_deref(),
                            _ => None,
                        };
                        fence(language, &snippet.text)
                    }
                    None => "[code block omitted]".to_string(),
                },
                None => line.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn fence(language: Option<&str>, code: &str) -> String {
    format!("```{}\n{}\n```", language.unwrap_or(""), code.trim_end_matches('\n'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{exchange, tool_turn};
    use contextloom_core::message::SessionId;
    use contextloom_core::turn::ConversationTurn;

    fn snapshot(turns: Vec<ConversationTurn>) -> ConversationSnapshot {
        ConversationSnapshot::new(SessionId::from("test"), turns)
    }

    fn pipeline() -> ContextPipeline {
        ContextPipeline::new(AppConfig::default(), TokenAccountant::heuristic_only())
    }

    fn history(n: u64) -> Vec<ConversationTurn> {
        let mut turns: Vec<ConversationTurn> = (1..=n)
            .map(|t| exchange(t, &format!("Question {t} about module_{t}.rs"), &format!("Answer {t} explaining module_{t}.rs")))
            .collect();
        turns.push(ConversationTurn::new(n + 1).with_message(Message::user("Now summarize the work")));
        turns
    }

    #[test]
    fn builds_context_and_request() {
        let snap = snapshot(history(3));
        let frame = RequestFrame::new("test-model", "You are helpful.");
        let output = pipeline().build(&snap, &frame, 0, 0).unwrap();

        assert_eq!(output.context.items.len(), 6);
        assert!(!output.context.overflows());
        assert_eq!(
            output.current_user_message.as_ref().map(|m| m.content.as_str()),
            Some("Now summarize the work")
        );
        assert!(output.base_prompt_tokens > 0);

        let request = output.to_request(&frame);
        assert_eq!(request.model, "test-model");
        assert_eq!(request.system, "You are helpful.");
        assert_eq!(request.messages.len(), 7);
        assert_eq!(request.messages.last().unwrap().content, "Now summarize the work");
        assert_eq!(request.messages[0].role, Role::User);
        assert_eq!(request.messages[1].role, Role::Assistant);
    }

    #[test]
    fn reduction_levels_shrink_candidates() {
        let snap = snapshot(history(8));
        let frame = RequestFrame::new("m", "");
        let p = pipeline();

        let counts: Vec<usize> = (0..4)
            .map(|level| p.build(&snap, &frame, level, level as usize).unwrap().analysis.candidates)
            .collect();
        // 8 exchanges → 16 items; current turn is 9
        assert_eq!(counts, vec![16, 6, 2, 0]);

        let level1 = p.build(&snap, &frame, 1, 1).unwrap();
        assert!(level1.decisions.iter().any(|d| {
            d.stage == DecisionStage::Optimizer && d.decision == Decision::Excluded && d.reason == "reduction_level_1"
        }));
    }

    #[test]
    fn active_chain_survives_every_level() {
        let mut turns = history(4);
        turns.pop();
        turns.push(tool_turn(5, "Check config.toml", "read_file", "config.toml", None, None));
        let snap = snapshot(turns);
        let frame = RequestFrame::new("m", "");

        for level in 0..4 {
            let output = pipeline().build(&snap, &frame, level, 0).unwrap();
            assert_eq!(output.analysis.active_chains, 1);
            assert!(
                output.context.contains(&ItemId::message(5, 1)),
                "level {level} dropped the active chain"
            );
        }
    }

    #[test]
    fn budget_exceeded_falls_back_to_emergency_context() {
        let mut config = AppConfig::default();
        config.model.context_limit = 100;
        let p = ContextPipeline::new(config, TokenAccountant::heuristic_only());
        let frame = RequestFrame::new("m", "x".repeat(2_000));

        let output = p.build(&snapshot(history(2)), &frame, 0, 0).unwrap();
        assert!(output.context.emergency);
        assert!(output.context.items.is_empty());
        // Mandatory elements still make it into the request
        let request = output.to_request(&frame);
        assert_eq!(request.messages.len(), 1);
    }

    #[test]
    fn budget_below_floor_still_keeps_small_history() {
        let turns = vec![
            exchange(1, "hi", "ok"),
            ConversationTurn::new(2).with_message(Message::user("next")),
        ];
        let snap = snapshot(turns);
        let frame = RequestFrame::new("m", "");
        let base = pipeline().build(&snap, &frame, 0, 0).unwrap().base_prompt_tokens;

        // Leaves 10 tokens after the 2000-token margin
        let mut config = AppConfig::default();
        config.model.context_limit = base + 2_000 + 10;
        let p = ContextPipeline::new(config, TokenAccountant::heuristic_only());
        let output = p.build(&snap, &frame, 0, 0).unwrap();

        assert!(!output.context.emergency);
        assert!(output.context.budget.floored);
        assert_eq!(output.context.budget.available, 50);
        assert_eq!(output.context.items.len(), 2);
        assert!(!output.context.overflows());
    }

    #[test]
    fn correlation_timeout_degrades_to_recency() {
        let mut config = AppConfig::default();
        config.correlation.max_items = 2;
        let p = ContextPipeline::new(config, TokenAccountant::heuristic_only());
        let output = p.build(&snapshot(history(3)), &RequestFrame::new("m", ""), 0, 0).unwrap();
        assert!(output.analysis.correlation_timeout);
        assert_eq!(output.context.items.len(), 6);
        assert!(output.decisions.iter().any(|d| {
            d.stage == DecisionStage::Correlator && d.reason == "correlation_timeout"
        }));
    }

    #[test]
    fn snippets_are_inlined_when_present() {
        let turns = vec![
            ConversationTurn::new(1)
                .with_message(Message::user("Why does this fail?\n```python\nprint(x)\n```"))
                .with_message(Message::assistant("x is undefined")),
            ConversationTurn::new(2).with_message(Message::user("Thanks, what next?")),
        ];
        let frame = RequestFrame::new("m", "");
        let output = pipeline().build(&snapshot(turns), &frame, 0, 0).unwrap();
        let request = output.to_request(&frame);

        assert_eq!(request.messages.len(), 3);
        assert!(request.messages[0].content.contains("```python\nprint(x)\n```"));
        assert!(!request.messages[0].content.contains("[snippet"));

        let mut stripped = output.clone();
        stripped.context.items.retain(|i| !i.kind.is_snippet());
        let request = stripped.to_request(&frame);
        assert!(request.messages[0].content.contains("[code block omitted]"));
    }

    #[test]
    fn tool_results_and_bridges_render_as_messages() {
        let turns = vec![
            tool_turn(1, "Read lib.rs", "read_file", "src/lib.rs", Some("fn main() {}"), Some("It is tiny.")),
            ConversationTurn::new(2).with_message(Message::user("Ok")),
        ];
        let frame = RequestFrame::new("m", "");
        let output = pipeline().build(&snapshot(turns), &frame, 0, 0).unwrap();
        let request = output.to_request(&frame);
        let roles: Vec<Role> = request.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant, Role::User]
        );
        assert_eq!(request.messages[1].tool_calls.len(), 1);
        assert_eq!(request.messages[2].tool_call_id.as_deref(), Some("call_t1"));
    }
}
