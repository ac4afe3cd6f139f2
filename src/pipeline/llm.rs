use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::pipeline::breaker::CircuitBreaker;

/// Hard cap on any single HTTP request, regardless of deadline budget.
const HARD_CAP: Duration = Duration::from_secs(30);

/// Backoff base for transient-error retries.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// p95 latency above this marks the upstream as pressured.
const SLOW_THRESHOLD: Duration = Duration::from_secs(5);

/// Rolling window for pressure signals.
const PRESSURE_WINDOW: Duration = Duration::from_secs(30);

/// Body substrings the upstream emits when its request queue is backed
/// up. Any of them counts as an overload signal.
const PENDING_QUEUE_MARKERS: &[&str] = &["pending_requests", "queue is full", "server overloaded"];

const SYSTEM_PROMPT: &str =
    "You are a content moderation assistant. Respond only in the requested JSON format.";

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("upstream deadline exceeded")]
    DeadlineExceeded,
    #[error("circuit open, retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },
    #[error("transient upstream failure: {0}")]
    Transient(String),
    #[error("upstream rejected request: {0}")]
    BadRequest(String),
    #[error("unparseable upstream response: {0}")]
    Unparseable(String),
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl LlmError {
    /// Stable label carried into fallback-verdict reasoning.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::DeadlineExceeded => "LLMDeadlineExceeded",
            Self::CircuitOpen { .. } => "LLMCircuitOpen",
            Self::Transient(_) => "LLMTransient",
            Self::BadRequest(_) => "LLMBadRequest",
            Self::Unparseable(_) => "LLMUnparseable",
            Self::Upstream(_) => "LLMUpstreamError",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub deadline: Instant,
}

impl CompletionOptions {
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            max_tokens: 500,
            temperature: 0.1,
            deadline,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub duration: Duration,
}

/// Raw reply from the transport layer.
#[derive(Debug, Clone)]
pub struct TransportReply {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
}

/// Seam between the client and the wire. The production implementation
/// speaks HTTP; tests script replies without a network.
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    async fn send(&self, payload: &Value, timeout: Duration) -> Result<TransportReply, TransportError>;
}

/// HTTP transport for OpenAI-compatible completion endpoints.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(endpoint: String, api_key: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HARD_CAP)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl CompletionTransport for HttpTransport {
    async fn send(&self, payload: &Value, timeout: Duration) -> Result<TransportReply, TransportError> {
        let mut request = self.client.post(&self.endpoint).json(payload).timeout(timeout);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                Ok(TransportReply { status, body })
            }
            Err(e) if e.is_timeout() => Err(TransportError::Timeout),
            Err(e) => Err(TransportError::Connect(e.to_string())),
        }
    }
}

/// Rolling view of upstream pressure: sustained slow responses or
/// explicit overload replies inject delay and shrink concurrency.
pub struct PressureMonitor {
    inner: Mutex<PressureInner>,
}

#[derive(Default)]
struct PressureInner {
    latencies: VecDeque<(Instant, Duration)>,
    overload_signals: VecDeque<Instant>,
}

impl PressureMonitor {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PressureInner::default()),
        }
    }

    pub fn note_latency(&self, latency: Duration) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.latencies.push_back((now, latency));
        Self::prune(&mut inner, now);
    }

    pub fn note_overload(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.overload_signals.push_back(now);
        Self::prune(&mut inner, now);
        metrics::counter!("llm_overload_signals_total", 1);
    }

    pub fn is_pressured(&self) -> bool {
        self.is_pressured_at(Instant::now())
    }

    fn is_pressured_at(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        Self::prune(&mut inner, now);
        if inner.overload_signals.len() >= 3 {
            return true;
        }
        Self::p95(&inner.latencies).map_or(false, |p95| p95 > SLOW_THRESHOLD)
    }

    /// Extra per-request delay while pressured, bounded at 2s.
    pub fn current_delay(&self) -> Duration {
        let now = Instant::now();
        if !self.is_pressured_at(now) {
            return Duration::ZERO;
        }
        let hits = self.lock().overload_signals.len().max(1);
        Duration::from_millis(250).saturating_mul(hits.min(8) as u32)
    }

    fn p95(latencies: &VecDeque<(Instant, Duration)>) -> Option<Duration> {
        if latencies.len() < 5 {
            return None;
        }
        let mut sorted: Vec<Duration> = latencies.iter().map(|(_, d)| *d).collect();
        sorted.sort();
        let idx = (sorted.len() as f64 * 0.95).ceil() as usize - 1;
        sorted.get(idx.min(sorted.len() - 1)).copied()
    }

    fn prune(inner: &mut PressureInner, now: Instant) {
        while let Some(&(at, _)) = inner.latencies.front() {
            if now.duration_since(at) > PRESSURE_WINDOW {
                inner.latencies.pop_front();
            } else {
                break;
            }
        }
        while let Some(&at) = inner.overload_signals.front() {
            if now.duration_since(at) > PRESSURE_WINDOW {
                inner.overload_signals.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PressureInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for PressureMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Parsed moderation payload extracted from the upstream reply.
#[derive(Debug, Clone, Deserialize)]
pub struct VerdictPayload {
    pub decision: String,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub categories: Option<Vec<String>>,
}

/// Bounded client for the upstream moderation oracle. Every call is
/// gated by the circuit breaker, a concurrency semaphore and an
/// absolute deadline; transient failures retry with jittered
/// exponential backoff inside that same deadline.
pub struct LlmClient {
    transport: Arc<dyn CompletionTransport>,
    breaker: Arc<CircuitBreaker>,
    semaphore: Arc<Semaphore>,
    pressure: PressureMonitor,
    model: String,
    max_retries: u32,
}

impl LlmClient {
    pub fn new(
        transport: Arc<dyn CompletionTransport>,
        breaker: Arc<CircuitBreaker>,
        model: String,
        concurrency: usize,
        max_retries: u32,
    ) -> Self {
        Self {
            transport,
            breaker,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            pressure: PressureMonitor::new(),
            model,
            max_retries,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// One completion round trip within `opts.deadline`.
    pub async fn complete(&self, prompt: &str, opts: &CompletionOptions) -> Result<Completion, LlmError> {
        if let Err(retry_after) = self.breaker.try_acquire() {
            metrics::counter!("llm_requests_total", 1, "outcome" => "circuit_open");
            return Err(LlmError::CircuitOpen { retry_after });
        }

        // Past this point the breaker has admitted the request (possibly
        // as a half-open probe), so every exit must report an outcome.
        let result = self.complete_admitted(prompt, opts).await;
        match &result {
            Ok(completion) => {
                self.breaker.on_success();
                self.pressure.note_latency(completion.duration);
                metrics::counter!("llm_requests_total", 1, "outcome" => "ok");
                metrics::histogram!(
                    "llm_request_duration_seconds",
                    completion.duration.as_secs_f64()
                );
            }
            // The upstream answered; only its content was unusable.
            Err(LlmError::BadRequest(_)) | Err(LlmError::Unparseable(_)) => {
                self.breaker.on_success();
                metrics::counter!("llm_requests_total", 1, "outcome" => "rejected");
            }
            Err(e) => {
                self.breaker.on_failure();
                metrics::counter!("llm_requests_total", 1, "outcome" => e.kind_label());
            }
        }
        result
    }

    async fn complete_admitted(
        &self,
        prompt: &str,
        opts: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        let started = Instant::now();
        let remaining = opts
            .deadline
            .checked_duration_since(started)
            .ok_or(LlmError::DeadlineExceeded)?;

        // While pressured each request holds two permits, halving
        // effective concurrency without reconfiguring the semaphore.
        let permits = if self.pressure.is_pressured() { 2 } else { 1 };
        let _permit = tokio::time::timeout(
            remaining,
            self.semaphore.clone().acquire_many_owned(permits),
        )
        .await
        .map_err(|_| LlmError::DeadlineExceeded)?
        .map_err(|_| LlmError::Transient("client shutting down".to_string()))?;

        let extra_delay = self.pressure.current_delay();
        if !extra_delay.is_zero() {
            let budget = self
                .deadline_budget(opts)
                .ok_or(LlmError::DeadlineExceeded)?;
            tokio::time::sleep(extra_delay.min(budget / 2)).await;
        }

        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
            "temperature": opts.temperature,
            "max_tokens": opts.max_tokens,
        });

        let mut last_transient = String::new();
        let mut saw_upstream_status = false;

        for attempt in 0..=self.max_retries {
            let remaining = match self.deadline_budget(opts) {
                Some(budget) => budget,
                None => return Err(LlmError::DeadlineExceeded),
            };
            let request_timeout = remaining.min(HARD_CAP);
            let deadline_bound = request_timeout == remaining;
            let attempt_started = Instant::now();

            match self.transport.send(&payload, request_timeout).await {
                Ok(reply) => {
                    self.note_queue_markers(&reply.body);
                    match reply.status {
                        200..=299 => {
                            let text = extract_content(&reply.body).ok_or_else(|| {
                                LlmError::Unparseable("no content field in upstream reply".into())
                            })?;
                            return Ok(Completion {
                                text,
                                duration: started.elapsed(),
                            });
                        }
                        429 | 503 => {
                            self.pressure.note_overload();
                            saw_upstream_status = true;
                            last_transient = format!("upstream status {}", reply.status);
                        }
                        408 | 425 => {
                            saw_upstream_status = true;
                            last_transient = format!("upstream status {}", reply.status);
                        }
                        400..=499 => {
                            return Err(LlmError::BadRequest(format!(
                                "upstream status {}",
                                reply.status
                            )));
                        }
                        _ => {
                            saw_upstream_status = true;
                            last_transient = format!("upstream status {}", reply.status);
                        }
                    }
                }
                Err(TransportError::Timeout) => {
                    self.pressure.note_latency(attempt_started.elapsed());
                    if deadline_bound {
                        return Err(LlmError::DeadlineExceeded);
                    }
                    last_transient = "request timeout".to_string();
                }
                Err(TransportError::Connect(reason)) => {
                    last_transient = reason;
                }
            }

            if attempt == self.max_retries {
                break;
            }
            let backoff = jittered_backoff(attempt);
            let budget = match self.deadline_budget(opts) {
                Some(budget) => budget,
                None => return Err(LlmError::DeadlineExceeded),
            };
            if backoff >= budget {
                return Err(LlmError::DeadlineExceeded);
            }
            debug!(attempt, backoff_ms = backoff.as_millis() as u64, "retrying upstream call");
            tokio::time::sleep(backoff).await;
        }

        if saw_upstream_status {
            Err(LlmError::Upstream(last_transient))
        } else {
            Err(LlmError::Transient(last_transient))
        }
    }

    fn deadline_budget(&self, opts: &CompletionOptions) -> Option<Duration> {
        opts.deadline.checked_duration_since(Instant::now())
    }

    fn note_queue_markers(&self, body: &str) {
        if PENDING_QUEUE_MARKERS.iter().any(|m| body.contains(m)) {
            warn!("upstream reported a pending queue, backing off");
            self.pressure.note_overload();
        }
    }
}

/// Exponential backoff `base * 2^attempt`, jittered by ±25%.
fn jittered_backoff(attempt: u32) -> Duration {
    let base = BACKOFF_BASE.as_millis() as u64 * 2u64.pow(attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_millis((base as f64 * jitter) as u64)
}

/// Pull the completion text out of a reply body. The canonical path is
/// `choices[0].message.content`; alternates cover the backends that
/// deviate from it.
fn extract_content(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let candidates = [
        &value["choices"][0]["message"]["content"],
        &value["choices"][0]["text"],
        &value["message"]["content"],
        &value["content"],
        &value["response"],
    ];
    candidates
        .iter()
        .find_map(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Parse free-form completion text that purports to contain a JSON
/// verdict: strip code fences, try a strict parse, then fall back to
/// the first balanced `{...}` block. Unknown fields are ignored.
pub fn parse_verdict(text: &str) -> Result<VerdictPayload, LlmError> {
    let trimmed = strip_fences(text.trim());

    if let Ok(payload) = serde_json::from_str::<VerdictPayload>(trimmed) {
        return Ok(validate(payload));
    }

    if let Some(block) = first_balanced_object(trimmed) {
        if let Ok(payload) = serde_json::from_str::<VerdictPayload>(block) {
            return Ok(validate(payload));
        }
    }

    let snippet: String = trimmed.chars().take(120).collect();
    Err(LlmError::Unparseable(format!(
        "no verdict object in reply: {snippet}"
    )))
}

fn validate(mut payload: VerdictPayload) -> VerdictPayload {
    payload.confidence = payload.confidence.clamp(0.0, 1.0);
    payload
}

fn strip_fences(text: &str) -> &str {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the fence line (which may carry a language tag) and the
    // closing fence.
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// First balanced top-level JSON object, tracking string literals so
/// braces inside values do not confuse the depth count.
fn first_balanced_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::breaker::{BreakerConfig, BreakerState};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        replies: Mutex<VecDeque<Result<TransportReply, TransportError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(replies: Vec<Result<TransportReply, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn ok(body: &str) -> Result<TransportReply, TransportError> {
            Ok(TransportReply {
                status: 200,
                body: body.to_string(),
            })
        }

        fn status(code: u16) -> Result<TransportReply, TransportError> {
            Ok(TransportReply {
                status: code,
                body: String::new(),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionTransport for Scripted {
        async fn send(&self, _payload: &Value, _timeout: Duration) -> Result<TransportReply, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(TransportError::Connect("script exhausted".into())))
        }
    }

    fn client(transport: Arc<Scripted>) -> LlmClient {
        LlmClient::new(
            transport,
            Arc::new(CircuitBreaker::new(BreakerConfig::default())),
            "test-model".to_string(),
            8,
            3,
        )
    }

    fn opts() -> CompletionOptions {
        CompletionOptions::with_deadline(Instant::now() + Duration::from_secs(30))
    }

    const GOOD_BODY: &str = r#"{"choices":[{"message":{"content":"{\"decision\":\"Non-Toxic\",\"confidence\":0.98,\"reasoning\":\"greeting\"}"}}]}"#;

    #[tokio::test]
    async fn successful_completion_extracts_content() {
        let transport = Scripted::new(vec![Scripted::ok(GOOD_BODY)]);
        let client = client(transport.clone());
        let completion = client.complete("hi", &opts()).await.unwrap();
        assert!(completion.text.contains("Non-Toxic"));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_then_succeed() {
        let transport = Scripted::new(vec![
            Scripted::status(503),
            Err(TransportError::Connect("refused".into())),
            Scripted::ok(GOOD_BODY),
        ]);
        let client = client(transport.clone());
        let completion = client.complete("hi", &opts()).await.unwrap();
        assert!(completion.text.contains("confidence"));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhausted_on_5xx_is_upstream_error() {
        let transport = Scripted::new(vec![
            Scripted::status(503),
            Scripted::status(503),
            Scripted::status(503),
            Scripted::status(503),
        ]);
        let client = client(transport.clone());
        let err = client.complete("hi", &opts()).await.unwrap_err();
        assert!(matches!(err, LlmError::Upstream(_)));
        assert_eq!(transport.calls(), 4); // initial + 3 retries
    }

    #[tokio::test]
    async fn bad_request_is_not_retried() {
        let transport = Scripted::new(vec![Scripted::status(422), Scripted::ok(GOOD_BODY)]);
        let client = client(transport.clone());
        let err = client.complete("hi", &opts()).await.unwrap_err();
        assert!(matches!(err, LlmError::BadRequest(_)));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn open_circuit_short_circuits_without_http() {
        let transport = Scripted::new(vec![]);
        let client = client(transport.clone());
        for _ in 0..5 {
            client.breaker().on_failure();
        }
        assert_eq!(client.breaker().state(), BreakerState::Open);

        for _ in 0..10 {
            let err = client.complete("hi", &opts()).await.unwrap_err();
            assert!(matches!(err, LlmError::CircuitOpen { .. }));
        }
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn expired_deadline_fails_fast() {
        let transport = Scripted::new(vec![Scripted::ok(GOOD_BODY)]);
        let client = client(transport.clone());
        let expired = CompletionOptions::with_deadline(Instant::now() - Duration::from_millis(1));
        let err = client.complete("hi", &expired).await.unwrap_err();
        assert!(matches!(err, LlmError::DeadlineExceeded));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn deadline_bound_timeout_maps_to_deadline_exceeded() {
        let transport = Scripted::new(vec![Err(TransportError::Timeout)]);
        let client = client(transport.clone());
        // Deadline shorter than the hard cap: the request timeout is the
        // whole remaining budget.
        let short = CompletionOptions::with_deadline(Instant::now() + Duration::from_secs(2));
        let err = client.complete("hi", &short).await.unwrap_err();
        assert!(matches!(err, LlmError::DeadlineExceeded));
        assert_eq!(client.breaker().state(), BreakerState::Closed);
    }

    #[test]
    fn parse_strict_json() {
        let payload = parse_verdict(r#"{"decision":"Toxic","confidence":0.91}"#).unwrap();
        assert_eq!(payload.decision, "Toxic");
        assert_eq!(payload.confidence, 0.91);
    }

    #[test]
    fn parse_fenced_json() {
        let payload = parse_verdict(
            "```json\n{\"decision\":\"Spam\",\"confidence\":0.8,\"reasoning\":\"links\"}\n```",
        )
        .unwrap();
        assert_eq!(payload.decision, "Spam");
        assert_eq!(payload.reasoning.as_deref(), Some("links"));
    }

    #[test]
    fn parse_embedded_object_in_prose() {
        let text = "Sure! Here is my assessment: {\"decision\":\"Toxic\",\"confidence\":0.91} \
                    as requested.";
        let payload = parse_verdict(text).unwrap();
        assert_eq!(payload.decision, "Toxic");
        assert_eq!(payload.confidence, 0.91);
    }

    #[test]
    fn parse_handles_braces_inside_strings() {
        let text = r#"note {"decision":"Toxic","confidence":0.9,"reasoning":"used \"}\" oddly"} end"#;
        let payload = parse_verdict(text).unwrap();
        assert_eq!(payload.decision, "Toxic");
    }

    #[test]
    fn parse_rejects_missing_required_fields() {
        let err = parse_verdict(r#"{"confidence":0.9}"#).unwrap_err();
        assert!(matches!(err, LlmError::Unparseable(_)));
        let err = parse_verdict("complete prose with no json at all").unwrap_err();
        assert!(matches!(err, LlmError::Unparseable(_)));
    }

    #[test]
    fn parse_clamps_confidence() {
        let payload = parse_verdict(r#"{"decision":"Toxic","confidence":3.5}"#).unwrap();
        assert_eq!(payload.confidence, 1.0);
    }

    #[test]
    fn extract_content_falls_back_across_paths() {
        assert_eq!(
            extract_content(r#"{"choices":[{"text":"hello"}]}"#).as_deref(),
            Some("hello")
        );
        assert_eq!(
            extract_content(r#"{"response":"hi"}"#).as_deref(),
            Some("hi")
        );
        assert!(extract_content(r#"{"usage":{}}"#).is_none());
        assert!(extract_content("not json").is_none());
    }

    #[test]
    fn backoff_is_jittered_within_bounds() {
        for attempt in 0..3 {
            let base = 1000u64 * 2u64.pow(attempt);
            for _ in 0..20 {
                let backoff = jittered_backoff(attempt).as_millis() as u64;
                assert!(backoff >= base * 3 / 4, "{backoff} < {}", base * 3 / 4);
                assert!(backoff <= base * 5 / 4 + 1, "{backoff} > {}", base * 5 / 4);
            }
        }
    }

    #[test]
    fn pressure_monitor_reports_overload() {
        let monitor = PressureMonitor::new();
        assert!(!monitor.is_pressured());
        for _ in 0..3 {
            monitor.note_overload();
        }
        assert!(monitor.is_pressured());
        assert!(monitor.current_delay() > Duration::ZERO);
        assert!(monitor.current_delay() <= Duration::from_secs(2));
    }
}
