use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;
use ulid::Ulid;

use crate::models::{
    FilterDecision, FilterOutcome, IncomingMessage, ModerationVerdict, PatternType, ProcessedEvent,
    SafetyLevel, VerdictKind,
};
use crate::pipeline::decision::DecisionHandler;
use crate::pipeline::filter::LightweightFilter;
use crate::pipeline::llm::{parse_verdict, CompletionOptions, LlmClient, LlmError, VerdictPayload};
use crate::pipeline::templates::{TemplateError, TemplateRegistry, STRICT_JSON_SUFFIX};
use crate::violation_store::ViolationStore;

/// How long a processed message is remembered for duplicate delivery.
const DEDUP_WINDOW: Duration = Duration::from_secs(60);

const DEFAULT_TEMPLATE: &str = "moderation_prompt";

#[derive(Debug, Clone, Default)]
pub struct ModerateOptions {
    pub template_name: Option<String>,
    pub deadline: Option<Duration>,
}

/// Coordinates the full pipeline for one message: filter, template,
/// upstream moderator, then policy and fan-out. Always yields a
/// ProcessedEvent within the deadline; only template-registry bugs
/// surface as errors.
pub struct Orchestrator {
    filter: Arc<LightweightFilter>,
    templates: Arc<TemplateRegistry>,
    llm: Arc<LlmClient>,
    decisions: Arc<DecisionHandler>,
    store: Arc<dyn ViolationStore>,
    dedup: Mutex<HashMap<Ulid, (Instant, ProcessedEvent)>>,
    default_deadline: Duration,
}

impl Orchestrator {
    pub fn new(
        filter: Arc<LightweightFilter>,
        templates: Arc<TemplateRegistry>,
        llm: Arc<LlmClient>,
        decisions: Arc<DecisionHandler>,
        store: Arc<dyn ViolationStore>,
        default_deadline: Duration,
    ) -> Self {
        Self {
            filter,
            templates,
            llm,
            decisions,
            store,
            dedup: Mutex::new(HashMap::new()),
            default_deadline,
        }
    }

    /// Run one message through the pipeline.
    pub async fn moderate(
        &self,
        msg: IncomingMessage,
        opts: ModerateOptions,
    ) -> Result<ProcessedEvent, TemplateError> {
        let started = Instant::now();
        let deadline = started + opts.deadline.unwrap_or(self.default_deadline);

        // Effectively-once processing: a duplicate message_id inside the
        // dedup window returns the original event untouched.
        if let Some(cached) = self.dedup_lookup(msg.message_id, started) {
            metrics::counter!("pipeline_dedup_hits_total", 1);
            return Ok(cached);
        }

        let filter_outcome = self.filter.evaluate(&msg).await;

        let verdict = if !filter_outcome.should_process {
            synthesize_from_filter(&filter_outcome, started.elapsed())
        } else if msg.body.trim().is_empty() {
            // Nothing to judge; skip the model entirely.
            ModerationVerdict {
                decision: VerdictKind::NonToxic,
                confidence: 1.0,
                reasoning: Some("empty message body".to_string()),
                template_version: "filter".to_string(),
                processing_ns: started.elapsed().as_nanos() as u64,
                categories: Default::default(),
            }
        } else {
            self.model_verdict(&msg, &opts, deadline, started).await?
        };

        let event = self
            .decisions
            .handle(&msg, filter_outcome, verdict, started)
            .await;

        metrics::histogram!(
            "pipeline_duration_seconds",
            started.elapsed().as_secs_f64()
        );
        self.dedup_store(event.clone(), started);
        Ok(event)
    }

    /// Template render plus moderator round trip. Upstream failures are
    /// folded into a fallback verdict here; template errors are a bug
    /// class and propagate.
    async fn model_verdict(
        &self,
        msg: &IncomingMessage,
        opts: &ModerateOptions,
        deadline: Instant,
        started: Instant,
    ) -> Result<ModerationVerdict, TemplateError> {
        let template_name = opts.template_name.as_deref().unwrap_or(DEFAULT_TEMPLATE);
        // Resolution doubles as the allowlist: names not registered at
        // startup cannot be selected by callers.
        let template = self.templates.get(template_name)?;

        let mut variables = HashMap::from([
            ("chat_message".to_string(), msg.body.clone()),
            ("channel_id".to_string(), msg.channel_id.clone()),
            ("user_id".to_string(), msg.user_id.clone()),
        ]);
        if template.safety_level == SafetyLevel::High
            && template.variables.iter().any(|v| v == "history_summary")
        {
            let summary = match self.store.counts(&msg.user_id).await {
                Ok(counts) => counts.summary(),
                Err(_) => "history unavailable".to_string(),
            };
            variables.insert("history_summary".to_string(), summary);
        }

        let prompt = self.templates.render(template_name, &variables)?;
        let llm_opts = CompletionOptions::with_deadline(deadline);

        let attempt = self.ask_model(&prompt, &llm_opts).await;
        let parsed = match attempt {
            Ok(parsed) => Ok(parsed),
            Err(LlmError::Unparseable(_)) => {
                // One reinforcement pass, then give up on parsing.
                let strict = format!("{prompt}{STRICT_JSON_SUFFIX}");
                self.ask_model(&strict, &llm_opts).await
            }
            Err(e) => Err(e),
        };

        Ok(match parsed {
            Ok((payload, duration)) => verdict_from_payload(payload, &template.version, duration),
            Err(e) => {
                warn!(message_id = %msg.message_id, error = %e, "moderator unavailable, using fallback verdict");
                ModerationVerdict::upstream_failure(e.kind_label(), started.elapsed().as_nanos() as u64)
            }
        })
    }

    async fn ask_model(
        &self,
        prompt: &str,
        opts: &CompletionOptions,
    ) -> Result<(VerdictPayload, Duration), LlmError> {
        let completion = self.llm.complete(prompt, opts).await?;
        let payload = parse_verdict(&completion.text)?;
        Ok((payload, completion.duration))
    }

    fn dedup_lookup(&self, message_id: Ulid, now: Instant) -> Option<ProcessedEvent> {
        let mut cache = self.lock_dedup();
        cache.retain(|_, (at, _)| now.duration_since(*at) < DEDUP_WINDOW);
        cache.get(&message_id).map(|(_, event)| event.clone())
    }

    fn dedup_store(&self, event: ProcessedEvent, now: Instant) {
        self.lock_dedup().insert(event.message_id, (now, event));
    }

    fn lock_dedup(&self) -> std::sync::MutexGuard<'_, HashMap<Ulid, (Instant, ProcessedEvent)>> {
        self.dedup
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Verdict for messages the filter decided terminally, without the
/// model. Confidence echoes the filter's.
fn synthesize_from_filter(outcome: &FilterOutcome, elapsed: Duration) -> ModerationVerdict {
    let (decision, reasoning) = match outcome.decision {
        FilterDecision::RateLimited => (
            VerdictKind::Unknown,
            "message rate limit exceeded".to_string(),
        ),
        FilterDecision::Flagged | FilterDecision::Blocked => match outcome.pattern_type {
            PatternType::Pii => (VerdictKind::Pii, "personal information pattern".to_string()),
            _ => (VerdictKind::Toxic, "matched hard filter pattern".to_string()),
        },
        FilterDecision::Pass => (VerdictKind::NonToxic, "filter pass".to_string()),
    };

    ModerationVerdict {
        decision,
        confidence: outcome.confidence,
        reasoning: Some(reasoning),
        template_version: "filter".to_string(),
        processing_ns: elapsed.as_nanos() as u64,
        categories: outcome
            .matched_patterns
            .iter()
            .map(|p| p.split(':').next().unwrap_or(p.as_str()).to_string())
            .collect(),
    }
}

fn verdict_from_payload(
    payload: VerdictPayload,
    template_version: &str,
    duration: Duration,
) -> ModerationVerdict {
    ModerationVerdict {
        decision: VerdictKind::from_label(&payload.decision),
        confidence: payload.confidence,
        reasoning: payload.reasoning,
        template_version: template_version.to_string(),
        processing_ns: duration.as_nanos() as u64,
        categories: payload.categories.unwrap_or_default().into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FilterDecision;

    #[test]
    fn rate_limited_synthesis_keeps_filter_confidence() {
        let outcome = FilterOutcome::rate_limited(Duration::from_secs(42), 10);
        let verdict = synthesize_from_filter(&outcome, Duration::from_micros(5));
        assert_eq!(verdict.decision, VerdictKind::Unknown);
        assert_eq!(verdict.confidence, 1.0);
        assert_eq!(verdict.template_version, "filter");
    }

    #[test]
    fn flagged_synthesis_maps_pattern_type() {
        let outcome = FilterOutcome {
            should_process: false,
            decision: FilterDecision::Flagged,
            confidence: 0.95,
            matched_patterns: vec!["banned:builtin-1:noob".to_string()],
            pattern_type: PatternType::BannedWord,
            latency_ns: 10,
        };
        let verdict = synthesize_from_filter(&outcome, Duration::from_micros(5));
        assert_eq!(verdict.decision, VerdictKind::Toxic);
        assert!(verdict.confidence >= 0.9);
        assert!(verdict.categories.contains("banned"));
    }

    #[test]
    fn payload_conversion_is_tolerant_of_labels() {
        let payload = VerdictPayload {
            decision: "harassment".to_string(),
            confidence: 0.88,
            reasoning: Some("targeted insults".to_string()),
            categories: Some(vec!["abuse".to_string()]),
        };
        let verdict = verdict_from_payload(payload, "1.2", Duration::from_millis(120));
        assert_eq!(verdict.decision, VerdictKind::Harassment);
        assert_eq!(verdict.template_version, "1.2");
        assert!(verdict.categories.contains("abuse"));
    }
}
