use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::hub::SessionHub;
use crate::models::{
    Action, EventType, FilterOutcome, IncomingMessage, ModerationVerdict, ProcessedEvent, Severity,
    UserViolation,
};
use crate::notifier::Notifier;
use crate::pipeline::policy;
use crate::violation_store::{ViolationCounts, ViolationStore};

/// Applies policy to a verdict: fetches history, decides, persists the
/// violation, publishes the event and escalates to moderators.
///
/// The handler always produces an event. A violation store outage
/// downgrades the action to `log` and marks the event rather than
/// failing the request: forward progress beats perfect bookkeeping.
pub struct DecisionHandler {
    store: Arc<dyn ViolationStore>,
    hub: SessionHub,
    notifier: Option<Notifier>,
}

impl DecisionHandler {
    pub fn new(store: Arc<dyn ViolationStore>, hub: SessionHub, notifier: Option<Notifier>) -> Self {
        Self {
            store,
            hub,
            notifier,
        }
    }

    pub async fn handle(
        &self,
        msg: &IncomingMessage,
        filter_outcome: FilterOutcome,
        verdict: ModerationVerdict,
        started: Instant,
    ) -> ProcessedEvent {
        let history = match self.store.counts(&msg.user_id).await {
            Ok(counts) => counts,
            Err(e) => {
                warn!(user_id = %msg.user_id, error = %e, "history unavailable, deciding without it");
                ViolationCounts::default()
            }
        };

        let mut action = policy::decide(&verdict, &filter_outcome, &history);
        let mut persistence_failure = false;

        if action.severity >= Severity::Medium {
            let violation = UserViolation::from_action(msg, &verdict, &action);
            if let Err(e) = self.store.record(&violation).await {
                warn!(
                    message_id = %msg.message_id,
                    error = %e,
                    "violation write failed, downgrading action to log"
                );
                persistence_failure = true;
                action = Action::log(
                    format!("{} (persistence unavailable)", action.reason),
                    true,
                );
            }
        }

        metrics::counter!(
            "decisions_total", 1,
            "action" => action.kind.as_str(),
            "severity" => action.severity.as_str()
        );

        let event = ProcessedEvent {
            event_type: EventType::ChatMessage,
            message_id: msg.message_id,
            channel_id: msg.channel_id.clone(),
            message: msg.clone(),
            filter_outcome,
            verdict,
            action,
            total_latency_ns: started.elapsed().as_nanos() as u64,
            persistence_failure,
        };

        self.hub.publish(event.clone());

        if event.action.notify_moderators {
            if let Some(notifier) = &self.notifier {
                notifier.notify(msg, &event.action).await;
            }
        }

        info!(
            message_id = %event.message_id,
            channel_id = %event.channel_id,
            verdict = event.verdict.decision.as_str(),
            action = event.action.kind.as_str(),
            latency_ms = event.total_latency_ns / 1_000_000,
            "message processed"
        );

        event
    }
}
