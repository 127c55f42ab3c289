//! Token estimation and per-run usage accounting.

use std::ops::AddAssign;
use std::sync::Mutex;

use tiktoken_rs::{CoreBPE, cl100k_base};

use crate::prelude::*;

/// The shared tokenizer. Building the BPE tables is expensive, so we do it
/// once per process.
fn encoder() -> &'static CoreBPE {
    static ENCODER: std::sync::OnceLock<CoreBPE> = std::sync::OnceLock::new();
    ENCODER.get_or_init(|| cl100k_base().expect("cl100k_base tables should load"))
}

/// Estimate how many tokens `text` will occupy for the target model family.
///
/// Deterministic for identical input. Used for the summarization threshold
/// and per-file accounting, not for billing.
pub fn estimate_tokens(text: &str) -> usize {
    encoder().encode_with_special_tokens(text).len()
}

/// Token usage.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    /// Tokens sent to the provider.
    pub input_tokens: u64,

    /// Tokens generated by the provider.
    pub output_tokens: u64,

    /// Tokens read from the provider's prompt cache.
    pub cache_read_tokens: u64,

    /// Tokens written to the provider's prompt cache.
    pub cache_write_tokens: u64,

    /// All tokens, input and output.
    pub total_tokens: u64,

    /// How many provider requests we made.
    pub requests: u64,

    /// How many results came from our own result cache. Cache hits contribute
    /// zero tokens but still count here.
    pub cached: u64,
}

impl UsageTotals {
    /// Usage for a single provider round trip.
    pub fn for_request(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            requests: 1,
            ..Self::default()
        }
    }

    /// Usage for a result served from the result cache.
    pub fn for_cache_hit() -> Self {
        Self {
            cached: 1,
            ..Self::default()
        }
    }

    /// Was our token usage zero?
    pub fn is_zero(&self) -> bool {
        self.total_tokens == 0 && self.requests == 0
    }
}

impl AddAssign<&UsageTotals> for UsageTotals {
    fn add_assign(&mut self, other: &UsageTotals) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
        self.total_tokens += other.total_tokens;
        self.requests += other.requests;
        self.cached += other.cached;
    }
}

/// A per-file token estimate, kept for the run report.
#[derive(Clone, Debug, Serialize)]
pub struct FileTokenEstimate {
    pub file: String,
    pub tokens: usize,
}

/// Aggregates token numbers for one run.
///
/// Shared between the dispatcher tasks, so updates go through a mutex. The
/// critical sections are a handful of integer additions.
#[derive(Debug, Default)]
pub struct UsageTracker {
    inner: Mutex<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    totals: UsageTotals,
    estimates: Vec<FileTokenEstimate>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a per-file input estimate before extraction.
    pub fn record_estimate(&self, file: &str, text: &str) -> usize {
        let tokens = estimate_tokens(text);
        debug!(file = %file, tokens, "estimated input tokens");
        let mut inner = self.inner.lock().expect("usage tracker lock poisoned");
        inner.estimates.push(FileTokenEstimate {
            file: file.to_string(),
            tokens,
        });
        tokens
    }

    /// Fold provider-reported usage into the run totals.
    pub fn record_usage(&self, usage: &UsageTotals) {
        let mut inner = self.inner.lock().expect("usage tracker lock poisoned");
        inner.totals += usage;
    }

    /// Snapshot the run totals.
    pub fn totals(&self) -> UsageTotals {
        self.inner
            .lock()
            .expect("usage tracker lock poisoned")
            .totals
            .clone()
    }

    /// Snapshot the per-file estimates.
    pub fn estimates(&self) -> Vec<FileTokenEstimate> {
        self.inner
            .lock()
            .expect("usage tracker lock poisoned")
            .estimates
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_are_deterministic_and_nonzero() {
        let text = "Hello Acme, invoice #42 for $100.";
        let first = estimate_tokens(text);
        let second = estimate_tokens(text);
        assert_eq!(first, second);
        assert!(first > 0);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn usage_totals_are_additive() {
        let mut totals = UsageTotals::default();
        totals += &UsageTotals::for_request(100, 20);
        totals += &UsageTotals::for_request(50, 10);
        totals += &UsageTotals::for_cache_hit();
        assert_eq!(totals.input_tokens, 150);
        assert_eq!(totals.output_tokens, 30);
        assert_eq!(totals.total_tokens, 180);
        assert_eq!(totals.requests, 2);
        assert_eq!(totals.cached, 1);
    }

    #[test]
    fn tracker_accumulates_estimates() {
        let tracker = UsageTracker::new();
        tracker.record_estimate("a.txt", "some words here");
        tracker.record_estimate("b.txt", "more words");
        assert_eq!(tracker.estimates().len(), 2);
        assert!(tracker.totals().is_zero());
    }
}
