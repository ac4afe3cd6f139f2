use crate::models::{Action, FilterDecision, FilterOutcome, ModerationVerdict, VerdictKind};
use crate::violation_store::ViolationCounts;

/// Map a verdict plus user history onto an enforcement action.
///
/// Pure and deterministic: the table below is evaluated top-down and
/// the first matching row wins. No I/O happens here, which is what
/// makes the engine property-testable.
pub fn decide(
    verdict: &ModerationVerdict,
    filter: &FilterOutcome,
    history: &ViolationCounts,
) -> Action {
    // Clean verdict on a clean filter pass.
    if verdict.decision == VerdictKind::NonToxic && filter.decision == FilterDecision::Pass {
        return Action::allow();
    }

    // Rate-limited messages never reached the moderator, so their
    // synthesized verdict carries no judgement; handle them before the
    // Unknown row.
    if filter.decision == FilterDecision::RateLimited {
        return Action::timeout(60, "message rate limit exceeded", false);
    }

    // The moderator could not judge; never punish on infrastructure
    // failure alone.
    if verdict.decision == VerdictKind::Unknown {
        return Action::log("moderator unavailable or undecided", true);
    }

    if verdict.decision == VerdictKind::Pii && verdict.confidence >= 0.7 {
        return Action::flag("personal information shared in chat", true);
    }

    if verdict.decision == VerdictKind::Spam && history.spam_24h >= 3 {
        return Action::timeout(300, "repeated spam within 24 hours", false);
    }

    let toxic_like = matches!(
        verdict.decision,
        VerdictKind::Toxic | VerdictKind::Harassment
    );

    if toxic_like && verdict.confidence >= 0.9 && history.critical_30d >= 2 {
        return Action::ban("repeated severe violations within 30 days");
    }

    if toxic_like && verdict.confidence >= 0.9 {
        return Action::timeout(600, "high-confidence toxic content", true);
    }

    if toxic_like && verdict.confidence >= 0.7 {
        return Action::flag("probable toxic content", true);
    }

    Action::log(
        format!("low-confidence {} verdict", verdict.decision.as_str()),
        false,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionKind, PatternType, Severity};
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn verdict(decision: VerdictKind, confidence: f64) -> ModerationVerdict {
        ModerationVerdict {
            decision,
            confidence,
            reasoning: None,
            template_version: "1.2".to_string(),
            processing_ns: 1,
            categories: BTreeSet::new(),
        }
    }

    fn pass_filter() -> FilterOutcome {
        FilterOutcome::pass(1)
    }

    fn history(spam_24h: usize, critical_30d: usize) -> ViolationCounts {
        ViolationCounts {
            total: spam_24h + critical_30d,
            spam_24h,
            critical_30d,
            ..Default::default()
        }
    }

    #[test]
    fn clean_message_is_allowed() {
        let action = decide(
            &verdict(VerdictKind::NonToxic, 0.98),
            &pass_filter(),
            &history(0, 0),
        );
        assert_eq!(action.kind, ActionKind::Allow);
    }

    #[test]
    fn unknown_verdict_logs_for_review() {
        let action = decide(
            &verdict(VerdictKind::Unknown, 0.0),
            &pass_filter(),
            &history(0, 5),
        );
        assert_eq!(action.kind, ActionKind::Log);
        assert!(action.needs_review);
        assert_eq!(action.severity, Severity::Low);
    }

    #[test]
    fn rate_limited_gets_sixty_second_timeout() {
        let action = decide(
            &verdict(VerdictKind::Unknown, 1.0),
            &FilterOutcome::rate_limited(Duration::from_secs(30), 1),
            &history(0, 0),
        );
        assert_eq!(action.kind, ActionKind::Timeout);
        assert_eq!(action.timeout_secs, Some(60));
        assert_eq!(action.severity, Severity::High);
    }

    #[test]
    fn confident_pii_is_flagged_with_notify() {
        let action = decide(
            &verdict(VerdictKind::Pii, 0.8),
            &pass_filter(),
            &history(0, 0),
        );
        assert_eq!(action.kind, ActionKind::Flag);
        assert!(action.notify_moderators);
        assert_eq!(action.severity, Severity::Medium);
    }

    #[test]
    fn low_confidence_pii_only_logs() {
        let action = decide(
            &verdict(VerdictKind::Pii, 0.5),
            &pass_filter(),
            &history(0, 0),
        );
        assert_eq!(action.kind, ActionKind::Log);
    }

    #[test]
    fn repeat_spammer_gets_long_timeout() {
        let action = decide(
            &verdict(VerdictKind::Spam, 0.9),
            &pass_filter(),
            &history(3, 0),
        );
        assert_eq!(action.kind, ActionKind::Timeout);
        assert_eq!(action.timeout_secs, Some(300));
    }

    #[test]
    fn first_time_spam_logs() {
        let action = decide(
            &verdict(VerdictKind::Spam, 0.9),
            &pass_filter(),
            &history(0, 0),
        );
        assert_eq!(action.kind, ActionKind::Log);
    }

    #[test]
    fn repeat_critical_offender_is_banned() {
        let action = decide(
            &verdict(VerdictKind::Toxic, 0.95),
            &pass_filter(),
            &history(0, 2),
        );
        assert_eq!(action.kind, ActionKind::Ban);
        assert_eq!(action.severity, Severity::Critical);
        assert!(action.notify_moderators);
    }

    #[test]
    fn high_confidence_toxic_gets_timeout_and_notify() {
        let action = decide(
            &verdict(VerdictKind::Harassment, 0.92),
            &pass_filter(),
            &history(0, 1),
        );
        assert_eq!(action.kind, ActionKind::Timeout);
        assert_eq!(action.timeout_secs, Some(600));
        assert!(action.notify_moderators);
        assert_eq!(action.severity, Severity::High);
    }

    #[test]
    fn medium_confidence_toxic_is_flagged() {
        let action = decide(
            &verdict(VerdictKind::Toxic, 0.75),
            &pass_filter(),
            &history(0, 0),
        );
        assert_eq!(action.kind, ActionKind::Flag);
        assert!(action.notify_moderators);
    }

    #[test]
    fn low_confidence_toxic_logs() {
        let action = decide(
            &verdict(VerdictKind::Toxic, 0.4),
            &pass_filter(),
            &history(0, 0),
        );
        assert_eq!(action.kind, ActionKind::Log);
        assert!(!action.needs_review);
    }

    #[test]
    fn decision_is_deterministic() {
        // Same inputs, same action, across a grid of cases.
        let verdicts = [
            verdict(VerdictKind::Toxic, 0.95),
            verdict(VerdictKind::Spam, 0.6),
            verdict(VerdictKind::Pii, 0.71),
            verdict(VerdictKind::NonToxic, 0.99),
            verdict(VerdictKind::Unknown, 0.0),
        ];
        let filters = [
            pass_filter(),
            FilterOutcome::rate_limited(Duration::from_secs(10), 1),
        ];
        let histories = [history(0, 0), history(3, 2), history(5, 1)];

        for v in &verdicts {
            for f in &filters {
                for h in &histories {
                    let first = decide(v, f, h);
                    for _ in 0..10 {
                        let again = decide(v, f, h);
                        assert_eq!(first.kind, again.kind);
                        assert_eq!(first.severity, again.severity);
                        assert_eq!(first.timeout_secs, again.timeout_secs);
                        assert_eq!(first.notify_moderators, again.notify_moderators);
                    }
                }
            }
        }
    }

    #[test]
    fn severity_follows_action_kind() {
        let filter = pass_filter();
        let h = history(0, 0);
        assert_eq!(decide(&verdict(VerdictKind::Toxic, 0.3), &filter, &h).severity, Severity::Low);
        assert_eq!(decide(&verdict(VerdictKind::Toxic, 0.8), &filter, &h).severity, Severity::Medium);
        assert_eq!(decide(&verdict(VerdictKind::Toxic, 0.95), &filter, &h).severity, Severity::High);
        assert_eq!(
            decide(&verdict(VerdictKind::Toxic, 0.95), &filter, &history(0, 2)).severity,
            Severity::Critical
        );
    }

    #[test]
    fn flagged_filter_with_nontoxic_verdict_does_not_allow() {
        // A PII-flagged message judged Non-Toxic by the model falls
        // through to the catch-all log row, not to allow.
        let filter = FilterOutcome {
            should_process: true,
            decision: FilterDecision::Flagged,
            confidence: 0.8,
            matched_patterns: vec!["pii:email".to_string()],
            pattern_type: PatternType::Pii,
            latency_ns: 1,
        };
        let action = decide(&verdict(VerdictKind::NonToxic, 0.9), &filter, &history(0, 0));
        assert_eq!(action.kind, ActionKind::Log);
    }
}
