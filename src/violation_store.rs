use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use ulid::Ulid;
use uuid::Uuid;

use crate::models::{ActionKind, Severity, UserViolation, VerdictKind};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt violation row: {0}")]
    Corrupt(String),
}

/// Aggregated history used by the policy engine.
#[derive(Debug, Clone, Default)]
pub struct ViolationCounts {
    pub total: usize,
    pub by_severity: HashMap<Severity, usize>,
    pub spam_24h: usize,
    pub critical_30d: usize,
}

impl ViolationCounts {
    /// Short prose form rendered into high-safety prompts.
    pub fn summary(&self) -> String {
        if self.total == 0 {
            return "no prior violations".to_string();
        }
        format!(
            "{} violations in retention window ({} critical in last 30 days, {} spam in last 24 hours)",
            self.total, self.critical_30d, self.spam_24h
        )
    }
}

/// Durable per-user violation log. Writes complete before the decision
/// handler reports success; reads apply the retention window.
#[async_trait]
pub trait ViolationStore: Send + Sync {
    async fn record(&self, violation: &UserViolation) -> Result<(), StoreError>;

    async fn recent(&self, user_id: &str, window: Duration) -> Result<Vec<UserViolation>, StoreError>;

    async fn counts(&self, user_id: &str) -> Result<ViolationCounts, StoreError>;

    /// Liveness probe for the health endpoint.
    async fn ping(&self) -> bool;
}

fn fold_counts(violations: &[UserViolation], now: DateTime<Utc>) -> ViolationCounts {
    let day_ago = now - chrono::Duration::hours(24);
    let month_ago = now - chrono::Duration::days(30);

    let mut counts = ViolationCounts {
        total: violations.len(),
        ..Default::default()
    };
    for v in violations {
        *counts.by_severity.entry(v.severity).or_default() += 1;
        if v.decision == VerdictKind::Spam && v.created_at >= day_ago {
            counts.spam_24h += 1;
        }
        if v.severity == Severity::Critical && v.created_at >= month_ago {
            counts.critical_30d += 1;
        }
    }
    counts
}

/// Postgres-backed store. Append-only table indexed on
/// `(user_id, created_at DESC)`.
pub struct PgViolationStore {
    pool: PgPool,
    retention: chrono::Duration,
}

impl PgViolationStore {
    pub async fn connect(url: &str, pool_size: u32, retention_days: i64) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .connect(url)
            .await?;
        let store = Self {
            pool,
            retention: chrono::Duration::days(retention_days),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS violations (
                id UUID PRIMARY KEY,
                message_id VARCHAR(26) NOT NULL,
                user_id VARCHAR(128) NOT NULL,
                channel_id VARCHAR(128) NOT NULL,
                decision VARCHAR(32) NOT NULL,
                severity VARCHAR(16) NOT NULL,
                action_kind VARCHAR(16) NOT NULL,
                reason TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_violations_user_created
             ON violations (user_id, created_at DESC)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_violation(row: &sqlx::postgres::PgRow) -> Result<UserViolation, StoreError> {
        let message_id: String = row.try_get("message_id")?;
        let decision: String = row.try_get("decision")?;
        let severity: String = row.try_get("severity")?;
        let action: String = row.try_get("action_kind")?;

        Ok(UserViolation {
            violation_id: row.try_get::<Uuid, _>("id")?,
            message_id: Ulid::from_string(&message_id)
                .map_err(|e| StoreError::Corrupt(format!("bad message_id: {e}")))?,
            user_id: row.try_get("user_id")?,
            channel_id: row.try_get("channel_id")?,
            decision: VerdictKind::from_label(&decision),
            severity: Severity::from_str(&severity).map_err(StoreError::Corrupt)?,
            action_taken: ActionKind::from_str(&action).map_err(StoreError::Corrupt)?,
            reason: row.try_get("reason")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }

    async fn fetch_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<UserViolation>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, message_id, user_id, channel_id, decision, severity,
                    action_kind, reason, created_at, expires_at
             FROM violations
             WHERE user_id = $1 AND created_at > $2
             ORDER BY created_at DESC",
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_violation).collect()
    }
}

#[async_trait]
impl ViolationStore for PgViolationStore {
    async fn record(&self, v: &UserViolation) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO violations
             (id, message_id, user_id, channel_id, decision, severity,
              action_kind, reason, created_at, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(v.violation_id)
        .bind(v.message_id.to_string())
        .bind(&v.user_id)
        .bind(&v.channel_id)
        .bind(v.decision.as_str())
        .bind(v.severity.as_str())
        .bind(v.action_taken.as_str())
        .bind(&v.reason)
        .bind(v.created_at)
        .bind(v.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent(&self, user_id: &str, window: Duration) -> Result<Vec<UserViolation>, StoreError> {
        let now = Utc::now();
        let window = chrono::Duration::from_std(window).unwrap_or(self.retention);
        let since = now - window.min(self.retention);
        self.fetch_since(user_id, since).await
    }

    async fn counts(&self, user_id: &str) -> Result<ViolationCounts, StoreError> {
        let now = Utc::now();
        let violations = self.fetch_since(user_id, now - self.retention).await?;
        Ok(fold_counts(&violations, now))
    }

    async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

/// In-process store for tests and store-less deployments. Not durable
/// across restarts.
pub struct MemoryViolationStore {
    rows: Mutex<Vec<UserViolation>>,
    retention: chrono::Duration,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryViolationStore {
    pub fn new(retention_days: i64) -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            retention: chrono::Duration::days(retention_days),
            fail_writes: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Test hook: make subsequent writes fail as if the store were down.
    #[allow(dead_code)]
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<UserViolation>> {
        self.rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryViolationStore {
    fn default() -> Self {
        Self::new(90)
    }
}

#[async_trait]
impl ViolationStore for MemoryViolationStore {
    async fn record(&self, violation: &UserViolation) -> Result<(), StoreError> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
        }
        self.lock().push(violation.clone());
        Ok(())
    }

    async fn recent(&self, user_id: &str, window: Duration) -> Result<Vec<UserViolation>, StoreError> {
        let now = Utc::now();
        let window = chrono::Duration::from_std(window)
            .unwrap_or(self.retention)
            .min(self.retention);
        let since = now - window;
        let mut matching: Vec<UserViolation> = self
            .lock()
            .iter()
            .filter(|v| v.user_id == user_id && v.created_at > since)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching)
    }

    async fn counts(&self, user_id: &str) -> Result<ViolationCounts, StoreError> {
        let now = Utc::now();
        let since = now - self.retention;
        let rows = self.lock();
        let violations: Vec<UserViolation> = rows
            .iter()
            .filter(|v| v.user_id == user_id && v.created_at > since)
            .cloned()
            .collect();
        Ok(fold_counts(&violations, now))
    }

    async fn ping(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(user: &str, decision: VerdictKind, severity: Severity, age: chrono::Duration) -> UserViolation {
        UserViolation {
            violation_id: Uuid::new_v4(),
            user_id: user.to_string(),
            channel_id: "general".to_string(),
            message_id: Ulid::new(),
            decision,
            severity,
            action_taken: ActionKind::Flag,
            reason: "test".to_string(),
            created_at: Utc::now() - age,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn counts_fold_by_severity_and_window() {
        let store = MemoryViolationStore::default();
        store
            .record(&violation("u1", VerdictKind::Spam, Severity::Medium, chrono::Duration::hours(1)))
            .await
            .unwrap();
        store
            .record(&violation("u1", VerdictKind::Spam, Severity::Medium, chrono::Duration::hours(30)))
            .await
            .unwrap();
        store
            .record(&violation("u1", VerdictKind::Toxic, Severity::Critical, chrono::Duration::days(2)))
            .await
            .unwrap();
        store
            .record(&violation("u2", VerdictKind::Toxic, Severity::High, chrono::Duration::hours(1)))
            .await
            .unwrap();

        let counts = store.counts("u1").await.unwrap();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.spam_24h, 1); // the 30h-old spam row is outside 24h
        assert_eq!(counts.critical_30d, 1);
        assert_eq!(counts.by_severity[&Severity::Medium], 2);
    }

    #[tokio::test]
    async fn retention_bounds_reads() {
        let store = MemoryViolationStore::new(90);
        store
            .record(&violation("u1", VerdictKind::Toxic, Severity::High, chrono::Duration::days(120)))
            .await
            .unwrap();
        let counts = store.counts("u1").await.unwrap();
        assert_eq!(counts.total, 0);
        let recent = store.recent("u1", Duration::from_secs(86_400 * 365)).await.unwrap();
        assert!(recent.is_empty());
    }

    #[tokio::test]
    async fn recent_is_newest_first() {
        let store = MemoryViolationStore::default();
        store
            .record(&violation("u1", VerdictKind::Toxic, Severity::High, chrono::Duration::hours(5)))
            .await
            .unwrap();
        store
            .record(&violation("u1", VerdictKind::Spam, Severity::Medium, chrono::Duration::hours(1)))
            .await
            .unwrap();
        let recent = store.recent("u1", Duration::from_secs(86_400)).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].created_at > recent[1].created_at);
    }

    #[tokio::test]
    async fn write_failures_surface_as_store_errors() {
        let store = MemoryViolationStore::default();
        store.set_fail_writes(true);
        let err = store
            .record(&violation("u1", VerdictKind::Toxic, Severity::High, chrono::Duration::zero()))
            .await;
        assert!(err.is_err());
    }

    #[test]
    fn empty_history_summary_reads_clean() {
        assert_eq!(ViolationCounts::default().summary(), "no prior violations");
    }
}
