use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::info;

/// Rolling window over which failure ratios are computed.
const SAMPLE_WINDOW: Duration = Duration::from_secs(30);

/// Consecutive-failure trip threshold.
const CONSECUTIVE_TRIP: u32 = 5;

/// Cooldown doubles on each failed probe round, up to this multiple of
/// the configured base.
const COOLDOWN_CEILING_FACTOR: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_ratio: f64,
    pub min_samples: usize,
    pub cooldown: Duration,
    pub probe_max: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio: 0.5,
            min_samples: 20,
            cooldown: Duration::from_secs(15),
            probe_max: 3,
        }
    }
}

struct Inner {
    state: BreakerState,
    samples: VecDeque<(Instant, bool)>,
    consecutive_failures: u32,
    opened_at: Instant,
    cooldown: Duration,
    probes_in_flight: u32,
    probe_successes: u32,
}

/// Circuit breaker in front of the upstream moderator.
///
/// Closed counts outcomes in a rolling window and trips Open when the
/// failure ratio crosses the threshold with enough samples, or on a
/// consecutive-failure burst. Open rejects everything until the
/// cooldown elapses, then HalfOpen admits a bounded number of probes.
/// All probes succeeding closes the circuit; any probe failing reopens
/// it with a doubled cooldown, up to a ceiling.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let now = Instant::now();
        let cooldown = config.cooldown;
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                samples: VecDeque::new(),
                consecutive_failures: 0,
                opened_at: now,
                cooldown,
                probes_in_flight: 0,
                probe_successes: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Ask to pass a request through. `Err(retry_after)` means the
    /// circuit is open and no request may be sent.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> Result<(), Duration> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = now.duration_since(inner.opened_at);
                if elapsed >= inner.cooldown {
                    info!("circuit breaker half-open, admitting probes");
                    inner.state = BreakerState::HalfOpen;
                    inner.probes_in_flight = 1;
                    inner.probe_successes = 0;
                    metrics::gauge!("llm_circuit_state", 2.0);
                    Ok(())
                } else {
                    Err(inner.cooldown - elapsed)
                }
            }
            BreakerState::HalfOpen => {
                if inner.probes_in_flight < self.config.probe_max {
                    inner.probes_in_flight += 1;
                    Ok(())
                } else {
                    Err(Duration::from_secs(1))
                }
            }
        }
    }

    pub fn on_success(&self) {
        self.on_success_at(Instant::now())
    }

    pub fn on_success_at(&self, now: Instant) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
                inner.samples.push_back((now, true));
                prune(&mut inner.samples, now);
            }
            BreakerState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                inner.probe_successes += 1;
                if inner.probe_successes >= self.config.probe_max {
                    info!("circuit breaker closed after successful probes");
                    inner.state = BreakerState::Closed;
                    inner.samples.clear();
                    inner.consecutive_failures = 0;
                    inner.cooldown = self.config.cooldown;
                    metrics::gauge!("llm_circuit_state", 0.0);
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn on_failure(&self) {
        self.on_failure_at(Instant::now())
    }

    pub fn on_failure_at(&self, now: Instant) {
        let mut inner = self.lock();
        metrics::counter!("llm_circuit_failures_total", 1);
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                inner.samples.push_back((now, false));
                prune(&mut inner.samples, now);

                let failures = inner.samples.iter().filter(|sample| !sample.1).count();
                let total = inner.samples.len();
                let ratio_tripped = total >= self.config.min_samples
                    && failures as f64 / total as f64 > self.config.failure_ratio;

                if ratio_tripped || inner.consecutive_failures >= CONSECUTIVE_TRIP {
                    info!(
                        failures,
                        total,
                        consecutive = inner.consecutive_failures,
                        "circuit breaker opened"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = now;
                    metrics::gauge!("llm_circuit_state", 1.0);
                }
            }
            BreakerState::HalfOpen => {
                // A failed probe reopens immediately with a longer cooldown.
                let ceiling = self.config.cooldown * COOLDOWN_CEILING_FACTOR;
                inner.cooldown = (inner.cooldown * 2).min(ceiling);
                inner.state = BreakerState::Open;
                inner.opened_at = now;
                inner.probes_in_flight = 0;
                inner.probe_successes = 0;
                info!(cooldown_s = inner.cooldown.as_secs(), "probe failed, circuit reopened");
                metrics::gauge!("llm_circuit_state", 1.0);
            }
            BreakerState::Open => {}
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn prune(samples: &mut VecDeque<(Instant, bool)>, now: Instant) {
    while let Some(&(at, _)) = samples.front() {
        if now.duration_since(at) > SAMPLE_WINDOW {
            samples.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig::default())
    }

    #[test]
    fn stays_closed_under_occasional_failures() {
        let cb = breaker();
        let t = Instant::now();
        for i in 0..20 {
            cb.try_acquire_at(t).unwrap();
            if i % 4 == 0 {
                cb.on_failure_at(t);
            } else {
                cb.on_success_at(t);
            }
        }
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn consecutive_failures_trip_the_circuit() {
        let cb = breaker();
        let t = Instant::now();
        for _ in 0..5 {
            cb.on_failure_at(t);
        }
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(cb.try_acquire_at(t).is_err());
    }

    #[test]
    fn failure_ratio_trips_with_enough_samples() {
        let cb = breaker();
        let t = Instant::now();
        // 11 failures / 21 samples > 0.5, never 5 consecutive.
        for _ in 0..10 {
            cb.on_failure_at(t);
            cb.on_success_at(t);
        }
        cb.on_failure_at(t);
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn open_rejects_until_cooldown_then_probes() {
        let cb = breaker();
        let t = Instant::now();
        for _ in 0..5 {
            cb.on_failure_at(t);
        }
        assert!(cb.try_acquire_at(t + Duration::from_secs(5)).is_err());

        // After cooldown the first caller becomes a probe.
        let after = t + Duration::from_secs(16);
        assert!(cb.try_acquire_at(after).is_ok());
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        // probe_max concurrent probes, not more.
        assert!(cb.try_acquire_at(after).is_ok());
        assert!(cb.try_acquire_at(after).is_ok());
        assert!(cb.try_acquire_at(after).is_err());
    }

    #[test]
    fn all_probes_succeeding_closes() {
        let cb = breaker();
        let t = Instant::now();
        for _ in 0..5 {
            cb.on_failure_at(t);
        }
        let after = t + Duration::from_secs(16);
        for _ in 0..3 {
            cb.try_acquire_at(after).unwrap();
            cb.on_success_at(after);
        }
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.try_acquire_at(after).is_ok());
    }

    #[test]
    fn failed_probe_reopens_with_doubled_cooldown() {
        let cb = breaker();
        let t = Instant::now();
        for _ in 0..5 {
            cb.on_failure_at(t);
        }
        let after = t + Duration::from_secs(16);
        cb.try_acquire_at(after).unwrap();
        cb.on_failure_at(after);
        assert_eq!(cb.state(), BreakerState::Open);

        // Base cooldown (15s) no longer suffices; doubled to 30s.
        assert!(cb.try_acquire_at(after + Duration::from_secs(16)).is_err());
        assert!(cb.try_acquire_at(after + Duration::from_secs(31)).is_ok());
    }

    #[test]
    fn old_samples_age_out_of_the_window() {
        let cb = breaker();
        let t = Instant::now();
        // 4 failures now, one more much later: consecutive counter would
        // trip, so interleave a success to reset it.
        for _ in 0..4 {
            cb.on_failure_at(t);
        }
        cb.on_success_at(t);
        let later = t + Duration::from_secs(60);
        for _ in 0..4 {
            cb.on_failure_at(later);
        }
        // Only 4 recent failures and 4 consecutive: still closed.
        assert_eq!(cb.state(), BreakerState::Closed);
    }
}
