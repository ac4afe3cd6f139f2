use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

/// Maximum accepted message body, in bytes. Longer bodies are truncated
/// with an explicit marker so the verdict can reflect partial input.
pub const MAX_BODY_BYTES: usize = 4096;

/// Maximum number of metadata entries carried per message.
pub const MAX_METADATA_ENTRIES: usize = 32;

const TRUNCATION_MARKER: &str = " …[truncated]";

/// Rejections raised at the ingress boundary. These are the only errors
/// surfaced to callers as 400s; everything past validation degrades
/// internally instead of failing the request.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("user_id must be 1..=128 characters")]
    BadUserId,
    #[error("channel_id must be 1..=128 characters")]
    BadChannelId,
    #[error("metadata exceeds {MAX_METADATA_ENTRIES} entries")]
    TooMuchMetadata,
}

/// A chat message entering the pipeline. Immutable once constructed;
/// downstream records reference it by `message_id` only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub message_id: Ulid,
    pub user_id: String,
    pub username: String,
    pub channel_id: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub truncated: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl IncomingMessage {
    /// Build a validated message. The body is truncated (never rejected)
    /// past `MAX_BODY_BYTES`, respecting char boundaries.
    pub fn new(
        user_id: String,
        username: Option<String>,
        channel_id: String,
        body: String,
        timestamp: Option<DateTime<Utc>>,
        metadata: HashMap<String, String>,
    ) -> Result<Self, InputError> {
        if user_id.is_empty() || user_id.len() > 128 {
            return Err(InputError::BadUserId);
        }
        if channel_id.is_empty() || channel_id.len() > 128 {
            return Err(InputError::BadChannelId);
        }
        if metadata.len() > MAX_METADATA_ENTRIES {
            return Err(InputError::TooMuchMetadata);
        }

        let (body, truncated) = truncate_body(body);
        Ok(Self {
            message_id: Ulid::new(),
            username: username.unwrap_or_else(|| user_id.clone()),
            user_id,
            channel_id,
            body,
            timestamp: timestamp.unwrap_or_else(Utc::now),
            truncated,
            metadata,
        })
    }
}

fn truncate_body(body: String) -> (String, bool) {
    if body.len() <= MAX_BODY_BYTES {
        return (body, false);
    }
    let mut cut = MAX_BODY_BYTES;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut truncated = body[..cut].to_string();
    truncated.push_str(TRUNCATION_MARKER);
    (truncated, true)
}

/// Outcome of the deterministic pre-screen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterDecision {
    Pass,
    Flagged,
    RateLimited,
    Blocked,
}

/// Which rule set produced the match that decided the filter outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    None,
    BannedWord,
    Toxic,
    Pii,
    RateLimit,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilterOutcome {
    pub should_process: bool,
    pub decision: FilterDecision,
    pub confidence: f64,
    pub matched_patterns: Vec<String>,
    pub pattern_type: PatternType,
    pub latency_ns: u64,
}

impl FilterOutcome {
    pub fn pass(latency_ns: u64) -> Self {
        Self {
            should_process: true,
            decision: FilterDecision::Pass,
            confidence: 0.9,
            matched_patterns: Vec::new(),
            pattern_type: PatternType::None,
            latency_ns,
        }
    }

    pub fn rate_limited(retry_after: Duration, latency_ns: u64) -> Self {
        Self {
            should_process: false,
            decision: FilterDecision::RateLimited,
            confidence: 1.0,
            matched_patterns: vec![format!("rate_limit_retry_after_{}s", retry_after.as_secs())],
            pattern_type: PatternType::RateLimit,
            latency_ns,
        }
    }
}

/// Safety posture a prompt template declares; high-safety templates get
/// the caller's violation history rendered into the prompt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyLevel {
    Low,
    Medium,
    High,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    Text,
}

/// Classification produced by the moderator, or synthesized from the
/// filter when the model is skipped or unavailable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerdictKind {
    Toxic,
    #[serde(rename = "Non-Toxic")]
    NonToxic,
    Spam,
    #[serde(rename = "PII")]
    Pii,
    Harassment,
    Unknown,
}

impl VerdictKind {
    /// Tolerant mapping from upstream label text. Unrecognised labels map
    /// to `Unknown` so a misbehaving model cannot mint new verdicts.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "toxic" => Self::Toxic,
            "non-toxic" | "nontoxic" | "non_toxic" | "safe" | "clean" => Self::NonToxic,
            "spam" => Self::Spam,
            "pii" => Self::Pii,
            "harassment" => Self::Harassment,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Toxic => "Toxic",
            Self::NonToxic => "Non-Toxic",
            Self::Spam => "Spam",
            Self::Pii => "PII",
            Self::Harassment => "Harassment",
            Self::Unknown => "Unknown",
        }
    }
}

impl std::str::FromStr for VerdictKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_label(s))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModerationVerdict {
    pub decision: VerdictKind,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub template_version: String,
    pub processing_ns: u64,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub categories: BTreeSet<String>,
}

impl ModerationVerdict {
    /// Verdict used when the upstream moderator failed and no judgement
    /// was possible. Confidence is pinned to zero.
    pub fn upstream_failure(kind: &str, processing_ns: u64) -> Self {
        Self {
            decision: VerdictKind::Unknown,
            confidence: 0.0,
            reasoning: Some(format!("upstream failure: {kind}")),
            template_version: "fallback".to_string(),
            processing_ns,
            categories: BTreeSet::new(),
        }
    }
}

/// Enforcement intensity, ordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Allow,
    Log,
    Flag,
    Escalate,
    Timeout,
    Ban,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Log => "log",
            Self::Flag => "flag",
            Self::Escalate => "escalate",
            Self::Timeout => "timeout",
            Self::Ban => "ban",
        }
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Self::Allow),
            "log" => Ok(Self::Log),
            "flag" => Ok(Self::Flag),
            "escalate" => Ok(Self::Escalate),
            "timeout" => Ok(Self::Timeout),
            "ban" => Ok(Self::Ban),
            other => Err(format!("unknown action kind: {other}")),
        }
    }
}

/// Enforcement outcome chosen by the policy engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub severity: Severity,
    pub reason: String,
    pub notify_moderators: bool,
    #[serde(default)]
    pub needs_review: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Action {
    pub fn allow() -> Self {
        Self {
            kind: ActionKind::Allow,
            severity: Severity::Low,
            reason: "no policy violation".to_string(),
            notify_moderators: false,
            needs_review: false,
            timeout_secs: None,
            expires_at: None,
        }
    }

    pub fn log(reason: impl Into<String>, needs_review: bool) -> Self {
        Self {
            kind: ActionKind::Log,
            severity: Severity::Low,
            reason: reason.into(),
            notify_moderators: false,
            needs_review,
            timeout_secs: None,
            expires_at: None,
        }
    }

    pub fn flag(reason: impl Into<String>, notify_moderators: bool) -> Self {
        Self {
            kind: ActionKind::Flag,
            severity: Severity::Medium,
            reason: reason.into(),
            notify_moderators,
            needs_review: false,
            timeout_secs: None,
            expires_at: None,
        }
    }

    /// Timeouts always carry a positive duration and expire.
    pub fn timeout(secs: u64, reason: impl Into<String>, notify_moderators: bool) -> Self {
        let secs = secs.max(1);
        Self {
            kind: ActionKind::Timeout,
            severity: Severity::High,
            reason: reason.into(),
            notify_moderators,
            needs_review: false,
            timeout_secs: Some(secs),
            expires_at: Some(Utc::now() + chrono::Duration::seconds(secs as i64)),
        }
    }

    /// Bans are permanent unless policy supplies an expiry.
    pub fn ban(reason: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Ban,
            severity: Severity::Critical,
            reason: reason.into(),
            notify_moderators: true,
            needs_review: false,
            timeout_secs: None,
            expires_at: None,
        }
    }
}

/// A persisted record of a non-benign outcome.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserViolation {
    pub violation_id: Uuid,
    pub user_id: String,
    pub channel_id: String,
    pub message_id: Ulid,
    pub decision: VerdictKind,
    pub severity: Severity,
    pub action_taken: ActionKind,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl UserViolation {
    pub fn from_action(msg: &IncomingMessage, verdict: &ModerationVerdict, action: &Action) -> Self {
        Self {
            violation_id: Uuid::new_v4(),
            user_id: msg.user_id.clone(),
            channel_id: msg.channel_id.clone(),
            message_id: msg.message_id,
            decision: verdict.decision,
            severity: action.severity,
            action_taken: action.kind,
            reason: action.reason.clone(),
            created_at: Utc::now(),
            expires_at: action.expires_at,
        }
    }
}

/// The pipeline's final per-message record, published to subscribers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessedEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub message_id: Ulid,
    pub channel_id: String,
    pub message: IncomingMessage,
    pub filter_outcome: FilterOutcome,
    pub verdict: ModerationVerdict,
    pub action: Action,
    pub total_latency_ns: u64,
    #[serde(default)]
    pub persistence_failure: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ChatMessage,
}
