//! Progressive optimizer: the retry loop around the pipeline and the
//! language-model call.
//!
//! Each trigger (an overflowing context, or a transient failure reported
//! by the client) raises the reduction level, which also shrinks the
//! safety margin. Transient failures additionally back off with jitter.
//!
//! All loop state lives in a [`RetryState`] value owned by one `run` call,
//! so concurrent sessions never share anything and cancellation leaves
//! nothing behind.

use std::sync::Arc;
use std::time::Duration;

use contextloom_config::OptimizerConfig;
use contextloom_core::decision::TelemetrySink;
use contextloom_core::error::{ContextError, Error, RequestError};
use contextloom_core::provider::{LanguageModelClient, ModelResponse};
use contextloom_core::store::ConversationSnapshot;
use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pipeline::{ContextPipeline, PipelineOutput, RequestFrame};

/// Highest reduction level: the current turn only.
pub const MAX_LEVEL: u32 = 3;

const SIMPLIFY_SUGGESTION: &str =
    "Try simplifying the request or starting a new session with less history.";

/// One pass through the loop.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub level: u32,
    pub context_tokens: usize,
    /// "ok", "overflow" or the error class
    pub outcome: String,
    /// Backoff slept after this attempt
    pub delay_ms: u64,
}

/// Retry bookkeeping for one request.
#[derive(Debug, Clone)]
pub struct RetryState {
    pub level: u32,
    /// Failed client calls so far
    pub attempt: u32,
    /// Length of the current run of same-class failures
    pub consecutive_errors: u32,
    pub last_error_class: Option<&'static str>,
    pub started_at: Instant,
    pub history: Vec<AttemptRecord>,
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            level: 0,
            attempt: 0,
            consecutive_errors: 0,
            last_error_class: None,
            started_at: Instant::now(),
            history: Vec::new(),
        }
    }

    /// Raise the reduction level, saturating at [`MAX_LEVEL`].
    pub fn escalate(&mut self) -> bool {
        if self.level >= MAX_LEVEL {
            return false;
        }
        self.level += 1;
        true
    }

    pub fn record_failure(&mut self, error: &RequestError) {
        let class = error.class();
        self.attempt += 1;
        self.consecutive_errors = if self.last_error_class == Some(class) {
            self.consecutive_errors + 1
        } else {
            1
        };
        self.last_error_class = Some(class);
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// A successful request and how it was obtained.
#[derive(Debug, Clone)]
pub struct OptimizerOutcome {
    pub response: ModelResponse,
    /// The cycle whose context produced the response
    pub output: PipelineOutput,
    pub state: RetryState,
}

/// `min(base × multiplier^retry, cap) × (1 ± jitter)`, with `retry`
/// counted from zero and `jitter_sample` in `[-1, 1]`.
pub fn backoff_delay(config: &OptimizerConfig, retry: u32, jitter_sample: f64) -> Duration {
    let raw = config.base_delay_ms as f64 * config.backoff_multiplier.powi(retry as i32);
    let capped = raw.min(config.max_delay_ms as f64);
    let jittered = capped * (1.0 + config.jitter * jitter_sample.clamp(-1.0, 1.0));
    Duration::from_millis(jittered.max(0.0).round() as u64)
}

pub struct ProgressiveOptimizer {
    pipeline: ContextPipeline,
    client: Arc<dyn LanguageModelClient>,
    config: OptimizerConfig,
    sink: Option<Arc<dyn TelemetrySink>>,
}

impl ProgressiveOptimizer {
    pub fn new(
        pipeline: ContextPipeline,
        client: Arc<dyn LanguageModelClient>,
        config: OptimizerConfig,
    ) -> Self {
        Self {
            pipeline,
            client,
            config,
            sink: None,
        }
    }

    /// Attach a telemetry sink; every cycle's decision records go to it.
    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn pipeline(&self) -> &ContextPipeline {
        &self.pipeline
    }

    /// Assemble and send, retrying with reduced context until the client
    /// answers, a permanent error occurs, retries run out or `cancel`
    /// fires.
    pub async fn run(
        &self,
        snapshot: &ConversationSnapshot,
        frame: &RequestFrame,
        cancel: &CancellationToken,
    ) -> Result<OptimizerOutcome, Error> {
        let mut state = RetryState::new();
        let attempt_timeout = Duration::from_secs(self.config.attempt_timeout_secs);

        loop {
            if cancel.is_cancelled() {
                return Err(ContextError::Cancelled.into());
            }

            let output = self
                .pipeline
                .build(snapshot, frame, state.level, state.level as usize)?;
            if let Some(sink) = &self.sink {
                sink.emit(&output.decisions);
            }

            if output.context.overflows() && state.level < MAX_LEVEL {
                info!(
                    level = state.level,
                    total = output.context.total_tokens,
                    available = output.context.budget.available,
                    "Context overflows budget, escalating"
                );
                state.history.push(AttemptRecord {
                    level: state.level,
                    context_tokens: output.context.total_tokens,
                    outcome: "overflow".into(),
                    delay_ms: 0,
                });
                state.escalate();
                continue;
            }

            let request = output.to_request(frame);
            debug!(
                level = state.level,
                attempt = state.attempt,
                messages = request.messages.len(),
                client = self.client.name(),
                "Sending request"
            );
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ContextError::Cancelled.into()),
                result = tokio::time::timeout(attempt_timeout, self.client.complete(request)) => {
                    result.unwrap_or_else(|_| {
                        Err(RequestError::Timeout(format!(
                            "no response within {}s",
                            attempt_timeout.as_secs()
                        )))
                    })
                }
            };

            let error = match result {
                Ok(response) if !response.is_empty() => {
                    state.history.push(AttemptRecord {
                        level: state.level,
                        context_tokens: output.context.total_tokens,
                        outcome: "ok".into(),
                        delay_ms: 0,
                    });
                    info!(
                        level = state.level,
                        failures = state.attempt,
                        elapsed_ms = state.elapsed().as_millis() as u64,
                        "Request succeeded"
                    );
                    return Ok(OptimizerOutcome {
                        response,
                        output,
                        state,
                    });
                }
                Ok(_) => RequestError::EmptyResponse,
                Err(error) => error,
            };

            if !error.is_transient() {
                warn!(%error, "Permanent request failure");
                return Err(error.into());
            }

            state.record_failure(&error);
            if state.attempt > self.config.max_retries
                || state.consecutive_errors >= self.config.max_consecutive_errors
            {
                warn!(
                    attempts = state.attempt,
                    consecutive = state.consecutive_errors,
                    %error,
                    "Retries exhausted"
                );
                state.history.push(AttemptRecord {
                    level: state.level,
                    context_tokens: output.context.total_tokens,
                    outcome: error.class().into(),
                    delay_ms: 0,
                });
                return Err(ContextError::RetriesExhausted {
                    attempts: state.attempt,
                    last_error: error.to_string(),
                    suggestion: SIMPLIFY_SUGGESTION.into(),
                }
                .into());
            }

            let delay = self.delay_for(&error, state.attempt - 1);
            warn!(
                %error,
                attempt = state.attempt,
                level = state.level,
                delay_ms = delay.as_millis() as u64,
                "Transient failure, retrying with reduced context"
            );
            state.history.push(AttemptRecord {
                level: state.level,
                context_tokens: output.context.total_tokens,
                outcome: error.class().into(),
                delay_ms: delay.as_millis() as u64,
            });
            state.escalate();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ContextError::Cancelled.into()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn delay_for(&self, error: &RequestError, retry: u32) -> Duration {
        let sample: f64 = rand::rng().random_range(-1.0..=1.0);
        let delay = backoff_delay(&self.config, retry, sample);
        match error {
            RequestError::RateLimited { retry_after_secs } => delay
                .max(Duration::from_secs(*retry_after_secs))
                .min(Duration::from_millis(self.config.max_delay_ms)),
            _ => delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TokenAccountant;
    use crate::test_helpers::{HangingClient, ScriptedClient, exchange, text_response};
    use contextloom_config::AppConfig;
    use contextloom_core::decision::DecisionRecord;
    use contextloom_core::message::{Message, SessionId};
    use contextloom_core::turn::ConversationTurn;
    use std::sync::Mutex;

    fn snapshot() -> ConversationSnapshot {
        let mut turns: Vec<ConversationTurn> = (1..=6)
            .map(|t| exchange(t, &format!("Question {t} on src/mod_{t}.rs"), &format!("Answer {t}")))
            .collect();
        turns.push(ConversationTurn::new(7).with_message(Message::user("And now?")));
        ConversationSnapshot::new(SessionId::from("s"), turns)
    }

    fn optimizer(client: Arc<dyn LanguageModelClient>, config: OptimizerConfig) -> ProgressiveOptimizer {
        let pipeline = ContextPipeline::new(AppConfig::default(), TokenAccountant::heuristic_only());
        ProgressiveOptimizer::new(pipeline, client, config)
    }

    fn frame() -> RequestFrame {
        RequestFrame::new("mock-model", "Be brief.")
    }

    #[test]
    fn backoff_grows_caps_and_jitters() {
        let config = OptimizerConfig::default();
        assert_eq!(backoff_delay(&config, 0, 0.0), Duration::from_millis(500));
        assert_eq!(backoff_delay(&config, 1, 0.0), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(&config, 3, 0.0), Duration::from_millis(4_000));
        assert_eq!(backoff_delay(&config, 12, 0.0), Duration::from_millis(30_000));
        assert_eq!(backoff_delay(&config, 0, 1.0), Duration::from_millis(600));
        assert_eq!(backoff_delay(&config, 0, -1.0), Duration::from_millis(400));
    }

    #[test]
    fn retry_state_tracks_runs_of_same_class() {
        let mut state = RetryState::new();
        state.record_failure(&RequestError::Network("reset".into()));
        state.record_failure(&RequestError::Network("reset".into()));
        assert_eq!(state.consecutive_errors, 2);
        state.record_failure(&RequestError::EmptyResponse);
        assert_eq!(state.consecutive_errors, 1);
        assert_eq!(state.attempt, 3);

        for _ in 0..5 {
            state.escalate();
        }
        assert_eq!(state.level, MAX_LEVEL);
        assert!(!state.escalate());
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_first_try() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(text_response("done"))]));
        let outcome = optimizer(client.clone(), OptimizerConfig::default())
            .run(&snapshot(), &frame(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.response.message.content, "done");
        assert_eq!(outcome.state.attempt, 0);
        assert_eq!(outcome.state.level, 0);
        assert_eq!(client.call_count(), 1);
        assert_eq!(client.requests()[0].messages.len(), 13);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_retries_with_reduced_context() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(RequestError::Overloaded("busy".into())),
            Ok(text_response("done")),
        ]));
        let outcome = optimizer(client.clone(), OptimizerConfig::default())
            .run(&snapshot(), &frame(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.state.attempt, 1);
        assert_eq!(outcome.state.level, 1);
        assert_eq!(outcome.output.level, 1);
        let requests = client.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].messages.len() < requests[0].messages.len());
        let delay = outcome.state.history[0].delay_ms;
        assert!((400..=600).contains(&delay), "delay {delay}");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_response_is_transient() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(text_response("   ")),
            Ok(text_response("real answer")),
        ]));
        let outcome = optimizer(client.clone(), OptimizerConfig::default())
            .run(&snapshot(), &frame(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.response.message.content, "real answer");
        assert_eq!(outcome.state.history[0].outcome, "empty_response");
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let client = Arc::new(ScriptedClient::new(vec![Err(RequestError::Authentication(
            "bad key".into(),
        ))]));
        let err = optimizer(client.clone(), OptimizerConfig::default())
            .run(&snapshot(), &frame(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Request(RequestError::Authentication(_))));
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_same_errors_trip_breaker() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(RequestError::Overloaded("busy".into())),
            Err(RequestError::Overloaded("busy".into())),
            Err(RequestError::Overloaded("busy".into())),
        ]));
        let err = optimizer(client.clone(), OptimizerConfig::default())
            .run(&snapshot(), &frame(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::Context(ContextError::RetriesExhausted {
                attempts,
                suggestion,
                ..
            }) => {
                assert_eq!(attempts, 3);
                assert!(suggestion.contains("simplifying"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn max_retries_bounds_mixed_failures() {
        let config = OptimizerConfig {
            max_retries: 2,
            ..Default::default()
        };
        let client = Arc::new(ScriptedClient::new(vec![
            Err(RequestError::Network("reset".into())),
            Err(RequestError::Overloaded("busy".into())),
            Err(RequestError::Network("reset".into())),
        ]));
        let err = optimizer(client.clone(), config)
            .run(&snapshot(), &frame(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Context(ContextError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_honours_retry_after() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(RequestError::RateLimited { retry_after_secs: 10 }),
            Ok(text_response("done")),
        ]));
        let outcome = optimizer(client, OptimizerConfig::default())
            .run(&snapshot(), &frame(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.state.history[0].delay_ms, 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_pending_call() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let err = optimizer(Arc::new(HangingClient), OptimizerConfig::default())
            .run(&snapshot(), &frame(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Context(ContextError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn already_cancelled_never_calls_client() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let client = Arc::new(ScriptedClient::new(vec![]));
        let err = optimizer(client.clone(), OptimizerConfig::default())
            .run(&snapshot(), &frame(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Context(ContextError::Cancelled)));
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempts_time_out_and_exhaust() {
        let config = OptimizerConfig {
            attempt_timeout_secs: 5,
            ..Default::default()
        };
        let err = optimizer(Arc::new(HangingClient), config)
            .run(&snapshot(), &frame(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::Context(ContextError::RetriesExhausted { last_error, attempts, .. }) => {
                assert!(last_error.contains("timed out"));
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    struct CollectingSink(Mutex<Vec<DecisionRecord>>);

    impl TelemetrySink for CollectingSink {
        fn emit(&self, records: &[DecisionRecord]) {
            self.0.lock().unwrap().extend_from_slice(records);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn decisions_reach_the_sink() {
        let sink = Arc::new(CollectingSink(Mutex::new(Vec::new())));
        let client = Arc::new(ScriptedClient::new(vec![Ok(text_response("done"))]));
        optimizer(client, OptimizerConfig::default())
            .with_sink(sink.clone())
            .run(&snapshot(), &frame(), &CancellationToken::new())
            .await
            .unwrap();
        let records = sink.0.lock().unwrap();
        assert!(!records.is_empty());
    }
}
