use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::redis_client::RedisClient;

const STRIPES: usize = 16;

/// Result of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after: Duration },
}

impl RateDecision {
    #[allow(dead_code)]
    pub fn is_limited(&self) -> bool {
        matches!(self, RateDecision::Limited { .. })
    }
}

/// Per-user sliding-window counter. The window holds at most
/// `max_events` events over `window`; further events are limited until
/// the oldest event ages out.
///
/// Backed either by a lock-striped in-process map (default, state resets
/// on restart) or by Redis sorted sets when a shared cache is
/// configured. Redis errors fail open so a cache outage never blocks
/// chat.
pub struct RateLimitStore {
    window: Duration,
    max_events: usize,
    backing: Backing,
}

enum Backing {
    Memory(Vec<Mutex<HashMap<String, VecDeque<Instant>>>>),
    Redis(RedisClient),
}

impl RateLimitStore {
    pub fn in_memory(window: Duration, max_events: usize) -> Self {
        let stripes = (0..STRIPES).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            window,
            max_events,
            backing: Backing::Memory(stripes),
        }
    }

    pub fn redis_backed(client: RedisClient, window: Duration, max_events: usize) -> Self {
        Self {
            window,
            max_events,
            backing: Backing::Redis(client),
        }
    }

    /// Record one event for `user_id` and report whether it is allowed.
    pub async fn check_and_record(&self, user_id: &str, now: Instant) -> RateDecision {
        match &self.backing {
            Backing::Memory(stripes) => self.check_memory(stripes, user_id, now),
            Backing::Redis(client) => match self.check_redis(client, user_id).await {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(user_id, error = %e, "rate-limit backing unavailable, failing open");
                    RateDecision::Allowed
                }
            },
        }
    }

    fn check_memory(
        &self,
        stripes: &[Mutex<HashMap<String, VecDeque<Instant>>>],
        user_id: &str,
        now: Instant,
    ) -> RateDecision {
        let mut events = stripes[stripe_of(user_id)]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let window = events.entry(user_id.to_string()).or_default();

        while let Some(&oldest) = window.front() {
            if now.duration_since(oldest) >= self.window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= self.max_events {
            let oldest = *window.front().unwrap_or(&now);
            let retry_after = self.window.saturating_sub(now.duration_since(oldest));
            return RateDecision::Limited { retry_after };
        }

        window.push_back(now);
        RateDecision::Allowed
    }

    async fn check_redis(
        &self,
        client: &RedisClient,
        user_id: &str,
    ) -> Result<RateDecision, redis::RedisError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let window_secs = self.window.as_secs_f64();
        let key = format!("ratelimit:chat:{user_id}");
        let window_start = now - window_secs;

        client.zrembyscore(&key, 0.0, window_start).await?;
        let current = client.zcount(&key, window_start, now).await?;

        if current >= self.max_events as i64 {
            let oldest = client.zrange_withscores(&key, 0, 0).await.unwrap_or_default();
            let retry_after = oldest
                .first()
                .map(|(_, ts)| Duration::from_secs_f64((ts + window_secs - now).max(0.0)))
                .unwrap_or(self.window);
            return Ok(RateDecision::Limited { retry_after });
        }

        client.zadd(&key, now, &now.to_string()).await?;
        client
            .expire(&key, self.window.as_secs() as i64 + 10)
            .await?;
        Ok(RateDecision::Allowed)
    }
}

fn stripe_of(user_id: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    user_id.hash(&mut hasher);
    (hasher.finish() as usize) % STRIPES
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max: usize) -> RateLimitStore {
        RateLimitStore::in_memory(Duration::from_secs(60), max)
    }

    #[tokio::test]
    async fn allows_up_to_max_events() {
        let store = store(10);
        let now = Instant::now();
        for _ in 0..10 {
            assert_eq!(store.check_and_record("u1", now).await, RateDecision::Allowed);
        }
    }

    #[tokio::test]
    async fn limits_event_past_max_within_window() {
        let store = store(10);
        let now = Instant::now();
        for _ in 0..10 {
            store.check_and_record("u1", now).await;
        }
        let decision = store.check_and_record("u1", now).await;
        assert!(decision.is_limited());
        if let RateDecision::Limited { retry_after } = decision {
            assert!(retry_after <= Duration::from_secs(60));
            assert!(retry_after > Duration::from_secs(55));
        }
    }

    #[tokio::test]
    async fn window_slides_as_events_age_out() {
        let store = store(2);
        let t0 = Instant::now();
        store.check_and_record("u1", t0).await;
        store.check_and_record("u1", t0 + Duration::from_secs(30)).await;
        assert!(store
            .check_and_record("u1", t0 + Duration::from_secs(45))
            .await
            .is_limited());
        // First event is now outside the 60s window.
        assert_eq!(
            store
                .check_and_record("u1", t0 + Duration::from_secs(61))
                .await,
            RateDecision::Allowed
        );
    }

    #[tokio::test]
    async fn users_are_independent() {
        let store = store(1);
        let now = Instant::now();
        assert_eq!(store.check_and_record("u1", now).await, RateDecision::Allowed);
        assert!(store.check_and_record("u1", now).await.is_limited());
        assert_eq!(store.check_and_record("u2", now).await, RateDecision::Allowed);
    }
}
