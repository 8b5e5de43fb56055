//! Token usage estimation and the display shield.
//!
//! Usage comes from the backend's trailing usage record when it has one and
//! from a character heuristic otherwise. What the user sees goes through
//! [`DisplayShield`], which keeps the figure from dropping while the user is
//! typing and no fresh backend number has arrived.

use serde_json::Value;

use parley_core::config::TokenConfig;
use parley_core::types::{Message, Role, TokenUsageSnapshot, UsageSource};

use crate::stream::{visible_content, USAGE_MARKER};

#[derive(Clone, Debug)]
pub struct TokenUsageEstimator {
    chars_per_token: f64,
    per_message_overhead: u64,
    base_overhead: u64,
}

impl TokenUsageEstimator {
    pub fn new(config: &TokenConfig) -> Self {
        Self {
            chars_per_token: if config.chars_per_token > 0.0 {
                config.chars_per_token
            } else {
                TokenConfig::default().chars_per_token
            },
            per_message_overhead: config.per_message_overhead,
            base_overhead: config.base_overhead,
        }
    }

    /// Usage for one turn. `history` is the input sent to the backend;
    /// `session_total_before` is the running total before this turn.
    pub fn estimate(
        &self,
        raw_body: &str,
        history: &[Message],
        session_total_before: u64,
    ) -> TokenUsageSnapshot {
        let (input_tokens, response_tokens, total_tokens, source) = match parse_usage_record(raw_body)
        {
            Some(record) => (record.input, record.output, record.total, UsageSource::Backend),
            None => {
                let input = self.input_tokens(history);
                let response = self.message_tokens(Role::Assistant, visible_content(raw_body));
                (input, response, input + response, UsageSource::Heuristic)
            }
        };
        TokenUsageSnapshot {
            input_tokens,
            response_tokens,
            total_tokens,
            session_total_tokens: session_total_before.saturating_add(total_tokens),
            source,
        }
    }

    pub fn input_tokens(&self, history: &[Message]) -> u64 {
        history
            .iter()
            .map(|m| self.message_tokens(m.role, &m.content))
            .sum::<u64>()
            + self.base_overhead
    }

    fn message_tokens(&self, role: Role, content: &str) -> u64 {
        let chars = role.as_str().chars().count() + content.chars().count();
        (chars as f64 / self.chars_per_token).ceil() as u64 + self.per_message_overhead
    }
}

#[derive(Debug, PartialEq, Eq)]
struct UsageRecord {
    input: u64,
    output: u64,
    total: u64,
}

/// Parse the trailing usage record, if it is present and well formed.
fn parse_usage_record(raw_body: &str) -> Option<UsageRecord> {
    let (_, record) = raw_body.rsplit_once(USAGE_MARKER)?;
    let json = record.lines().next().unwrap_or("").trim();
    let value: Value = serde_json::from_str(json).ok()?;
    let field = |names: &[&str]| names.iter().find_map(|n| value.get(*n).and_then(Value::as_u64));

    let input = field(&["input_tokens", "prompt_tokens", "inputTokens"])?;
    let output = field(&["output_tokens", "completion_tokens", "outputTokens"])?;
    let total = field(&["total_tokens", "totalTokens"]).unwrap_or(input + output);
    Some(UsageRecord {
        input,
        output,
        total,
    })
}

/// Running session total. Reset when a new conversation starts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenUsageTracker {
    session_total: u64,
}

impl TokenUsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_total(&self) -> u64 {
        self.session_total
    }

    pub fn record(&mut self, usage: &TokenUsageSnapshot) {
        self.session_total = usage.session_total_tokens;
    }

    pub fn reset(&mut self) {
        self.session_total = 0;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShieldState {
    pub last_displayed: u64,
    pub last_confirmed: u64,
}

/// One candidate figure plus the UI state it was computed under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Observation {
    pub candidate: u64,
    /// The user has unsent text in the input box.
    pub typing: bool,
    /// A backend-reported total, when this observation carries one.
    pub backend_total: Option<u64>,
}

/// Display guard for the token counter.
pub struct DisplayShield;

impl DisplayShield {
    /// Pure transition: returns the next state and the value to show.
    ///
    /// A candidate below the last displayed value is held back only while the
    /// user is typing and no new backend total has arrived.
    pub fn observe(state: ShieldState, obs: Observation) -> (ShieldState, u64) {
        let fresh_backend = obs
            .backend_total
            .map(|total| total != state.last_confirmed)
            .unwrap_or(false);
        let shielded = obs.typing && !fresh_backend && obs.candidate < state.last_displayed;
        let shown = if shielded {
            state.last_displayed
        } else {
            obs.candidate
        };
        let next = ShieldState {
            last_displayed: shown,
            last_confirmed: obs.backend_total.unwrap_or(state.last_confirmed),
        };
        (next, shown)
    }
}
