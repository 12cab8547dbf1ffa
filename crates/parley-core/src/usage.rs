//! Per-session usage telemetry: token and word counts, output characters, elapsed time.

use serde::{Deserialize, Serialize};

/// Rough token estimate used until the LLM reports exact counts (~4 characters per token).
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(4)
}

/// Whitespace-separated word count.
pub fn count_words(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

/// Pricing used to turn a snapshot into a cost estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRates {
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Price per input token.
    #[serde(default = "default_input_token_rate")]
    pub input_token: f64,
    /// Price per output token.
    #[serde(default = "default_output_token_rate")]
    pub output_token: f64,
    /// Price per synthesized character.
    #[serde(default = "default_output_char_rate")]
    pub output_char: f64,
    /// Price per second of session time.
    #[serde(default = "default_duration_rate")]
    pub duration_sec: f64,
}

fn default_currency() -> String {
    "INR".into()
}

fn default_input_token_rate() -> f64 {
    0.000225
}

fn default_output_token_rate() -> f64 {
    0.0009
}

fn default_output_char_rate() -> f64 {
    15.0 / 10_000.0
}

fn default_duration_rate() -> f64 {
    45.0 / 3_600.0
}

impl Default for UsageRates {
    fn default() -> Self {
        Self {
            currency: default_currency(),
            input_token: default_input_token_rate(),
            output_token: default_output_token_rate(),
            output_char: default_output_char_rate(),
            duration_sec: default_duration_rate(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub input_tokens: u64,
    pub input_words: u64,
    pub output_tokens: u64,
    pub output_words: u64,
    pub output_chars: u64,
    pub elapsed_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageCost {
    pub currency: String,
    pub input: f64,
    pub output: f64,
    pub speech: f64,
    pub duration: f64,
    pub total: f64,
}

impl UsageSnapshot {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn cost(&self, rates: &UsageRates) -> UsageCost {
        let input = self.input_tokens as f64 * rates.input_token;
        let output = self.output_tokens as f64 * rates.output_token;
        let speech = self.output_chars as f64 * rates.output_char;
        let duration = self.elapsed_secs as f64 * rates.duration_sec;
        UsageCost {
            currency: rates.currency.clone(),
            input,
            output,
            speech,
            duration,
            total: input + output + speech + duration,
        }
    }
}

/// Counts for the turn in flight, kept so vendor-reported totals can be reconciled.
#[derive(Debug, Clone, Copy, Default)]
struct TurnCounts {
    input_tokens: u64,
    output_tokens: u64,
    output_words: u64,
}

/// Accumulates usage for one session. Every counter is monotonically
/// non-decreasing until [`UsageAccumulator::reset`].
#[derive(Debug, Clone)]
pub struct UsageAccumulator {
    totals: UsageSnapshot,
    turn: TurnCounts,
    running: bool,
}

impl Default for UsageAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self {
            totals: UsageSnapshot::default(),
            turn: TurnCounts::default(),
            running: true,
        }
    }

    /// Record the prompt sent for a new turn. Returns `(tokens, words)` for that prompt.
    pub fn on_input_text(&mut self, text: &str) -> (u64, u64) {
        let tokens = estimate_tokens(text);
        let words = count_words(text);
        self.totals.input_tokens += tokens;
        self.totals.input_words += words;
        self.turn = TurnCounts {
            input_tokens: tokens,
            ..TurnCounts::default()
        };
        (tokens, words)
    }

    /// Record one streamed reply fragment.
    pub fn on_output_token_delta(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let tokens = estimate_tokens(text).max(1);
        let words = count_words(text);
        self.totals.output_tokens += tokens;
        self.totals.output_words += words;
        self.totals.output_chars += text.chars().count() as u64;
        self.turn.output_tokens += tokens;
        self.turn.output_words += words;
    }

    /// Reconcile the current turn with counts reported by the LLM. Totals only move up.
    pub fn on_final_counts(&mut self, input_tokens: u64, output_tokens: u64) {
        if input_tokens > self.turn.input_tokens {
            self.totals.input_tokens += input_tokens - self.turn.input_tokens;
            self.turn.input_tokens = input_tokens;
        }
        if output_tokens > self.turn.output_tokens {
            self.totals.output_tokens += output_tokens - self.turn.output_tokens;
            self.turn.output_tokens = output_tokens;
        }
    }

    /// Output counts for the turn in flight: `(tokens, words)`.
    pub fn turn_output(&self) -> (u64, u64) {
        (self.turn.output_tokens, self.turn.output_words)
    }

    /// Input tokens for the turn in flight.
    pub fn turn_input_tokens(&self) -> u64 {
        self.turn.input_tokens
    }

    /// Advance the elapsed-time counter by one second while running.
    pub fn tick(&mut self) {
        if self.running {
            self.totals.elapsed_secs += 1;
        }
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Zero every counter. The timer keeps its running state.
    pub fn reset(&mut self) {
        self.totals = UsageSnapshot::default();
        self.turn = TurnCounts::default();
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        self.totals
    }
}
