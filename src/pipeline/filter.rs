use std::sync::{Arc, RwLock};
use std::time::Instant;

use tracing::{debug, warn};

use crate::models::{FilterDecision, FilterOutcome, IncomingMessage, PatternType};
use crate::pipeline::patterns::PatternSet;
use crate::pipeline::rate_limit::{RateDecision, RateLimitStore};

/// Deterministic pre-screen in front of the moderator. Serves two
/// purposes: cost control (obvious cases never reach the model) and a
/// safety net when the model is unavailable.
pub struct LightweightFilter {
    rate_limits: Arc<RateLimitStore>,
    patterns: RwLock<Arc<PatternSet>>,
    enabled: bool,
}

impl LightweightFilter {
    pub fn new(rate_limits: Arc<RateLimitStore>, patterns: Arc<PatternSet>, enabled: bool) -> Self {
        Self {
            rate_limits,
            patterns: RwLock::new(patterns),
            enabled,
        }
    }

    /// Swap in a new pattern snapshot. Readers see the old or new set,
    /// never a mix.
    #[allow(dead_code)]
    pub fn reload_patterns(&self, patterns: Arc<PatternSet>) {
        let mut guard = self
            .patterns
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = patterns;
    }

    fn patterns(&self) -> Arc<PatternSet> {
        self.patterns
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Evaluate a message. Decision ladder:
    /// rate limit exceeded, then hard pattern hits (banned word or
    /// toxic phrase, which skip the model), then PII hits (flagged but
    /// still sent on so the model can judge severity), then pass.
    pub async fn evaluate(&self, msg: &IncomingMessage) -> FilterOutcome {
        let started = Instant::now();

        if !self.enabled {
            return FilterOutcome::pass(started.elapsed().as_nanos() as u64);
        }

        if let RateDecision::Limited { retry_after } = self
            .rate_limits
            .check_and_record(&msg.user_id, started)
            .await
        {
            metrics::counter!("filter_decisions_total", 1, "decision" => "rate_limited");
            return FilterOutcome::rate_limited(retry_after, started.elapsed().as_nanos() as u64);
        }

        let report = match self.patterns().scan(&msg.body) {
            Ok(report) => report,
            Err(e) => {
                // Matcher faults fail open: prefer a model verdict over
                // a silent block.
                warn!(message_id = %msg.message_id, error = %e, "pattern matcher failed, passing through");
                metrics::counter!("filter_decisions_total", 1, "decision" => "fail_open");
                return FilterOutcome::pass(started.elapsed().as_nanos() as u64);
            }
        };

        let latency_ns = started.elapsed().as_nanos() as u64;

        let outcome = if report.banned_word || report.toxic {
            metrics::counter!("filter_decisions_total", 1, "decision" => "flagged_terminal");
            FilterOutcome {
                should_process: false,
                decision: FilterDecision::Flagged,
                confidence: 0.95,
                pattern_type: report.dominant_type(),
                matched_patterns: report.matched,
                latency_ns,
            }
        } else if report.pii {
            // PII alone is flagged but still adjudicated by the model.
            metrics::counter!("filter_decisions_total", 1, "decision" => "flagged_pii");
            FilterOutcome {
                should_process: true,
                decision: FilterDecision::Flagged,
                confidence: 0.8,
                pattern_type: PatternType::Pii,
                matched_patterns: report.matched,
                latency_ns,
            }
        } else {
            metrics::counter!("filter_decisions_total", 1, "decision" => "pass");
            FilterOutcome::pass(latency_ns)
        };

        debug!(
            message_id = %msg.message_id,
            decision = ?outcome.decision,
            should_process = outcome.should_process,
            "filter evaluated"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn filter_with_limit(max: usize) -> LightweightFilter {
        LightweightFilter::new(
            Arc::new(RateLimitStore::in_memory(Duration::from_secs(60), max)),
            Arc::new(PatternSet::builtin()),
            true,
        )
    }

    fn msg(user: &str, body: &str) -> IncomingMessage {
        IncomingMessage::new(
            user.to_string(),
            None,
            "general".to_string(),
            body.to_string(),
            None,
            HashMap::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn clean_message_passes() {
        let filter = filter_with_limit(10);
        let outcome = filter.evaluate(&msg("u1", "Hello everyone, how are you?")).await;
        assert_eq!(outcome.decision, FilterDecision::Pass);
        assert!(outcome.should_process);
    }

    #[tokio::test]
    async fn banned_word_is_terminal() {
        let filter = filter_with_limit(10);
        let outcome = filter.evaluate(&msg("u1", "you are such a noob")).await;
        assert_eq!(outcome.decision, FilterDecision::Flagged);
        assert!(!outcome.should_process);
        assert_eq!(outcome.pattern_type, PatternType::BannedWord);
    }

    #[tokio::test]
    async fn pii_only_still_goes_to_model() {
        let filter = filter_with_limit(10);
        let outcome = filter.evaluate(&msg("u1", "my email is a@b.example.com")).await;
        assert_eq!(outcome.decision, FilterDecision::Flagged);
        assert!(outcome.should_process);
        assert_eq!(outcome.pattern_type, PatternType::Pii);
    }

    #[tokio::test]
    async fn eleventh_message_is_rate_limited() {
        let filter = filter_with_limit(10);
        for _ in 0..10 {
            let outcome = filter.evaluate(&msg("u1", "hi there friends")).await;
            assert_ne!(outcome.decision, FilterDecision::RateLimited);
        }
        let outcome = filter.evaluate(&msg("u1", "hi again")).await;
        assert_eq!(outcome.decision, FilterDecision::RateLimited);
        assert!(!outcome.should_process);
        assert_eq!(outcome.confidence, 1.0);
    }

    #[tokio::test]
    async fn disabled_filter_passes_everything() {
        let filter = LightweightFilter::new(
            Arc::new(RateLimitStore::in_memory(Duration::from_secs(60), 1)),
            Arc::new(PatternSet::builtin()),
            false,
        );
        for _ in 0..5 {
            let outcome = filter.evaluate(&msg("u1", "you stupid loser")).await;
            assert_eq!(outcome.decision, FilterDecision::Pass);
        }
    }

    #[tokio::test]
    async fn should_process_tracks_decision() {
        let filter = filter_with_limit(100);
        for body in ["hello world", "you idiot", "mail me a@b.co", "kys"] {
            let outcome = filter.evaluate(&msg("u2", body)).await;
            match outcome.decision {
                FilterDecision::Pass => assert!(outcome.should_process),
                FilterDecision::RateLimited | FilterDecision::Blocked => {
                    assert!(!outcome.should_process)
                }
                FilterDecision::Flagged => {
                    // PII is the one flagged case that proceeds.
                    assert_eq!(
                        outcome.should_process,
                        outcome.pattern_type == PatternType::Pii
                    );
                }
            }
        }
    }
}
