use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;
use crate::hub::SessionHub;
use crate::notifier::Notifier;
use crate::pipeline::{
    BreakerConfig, CircuitBreaker, DecisionHandler, HttpTransport, LightweightFilter, LlmClient,
    Orchestrator, PatternSet, RateLimitStore, TemplateRegistry,
};
use crate::redis_client::RedisClient;
use crate::simulator::Simulator;
use crate::violation_store::{MemoryViolationStore, PgViolationStore, ViolationStore};

/// Shared application state wiring every pipeline component together.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub filter: Arc<LightweightFilter>,
    pub templates: Arc<TemplateRegistry>,
    pub llm: Arc<LlmClient>,
    pub store: Arc<dyn ViolationStore>,
    pub decisions: Arc<DecisionHandler>,
    pub orchestrator: Arc<Orchestrator>,
    pub hub: SessionHub,
    pub simulator: Arc<Simulator>,
    pub redis: Option<RedisClient>,
}

impl AppState {
    /// Build the full pipeline. Failures here are startup dependency
    /// failures (exit code 2): an unreachable violation store, a bad
    /// template or pattern file, an unreachable Redis.
    pub async fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        let redis = match &config.redis_url {
            Some(url) => Some(
                RedisClient::connect(url)
                    .await
                    .context("rate-limit Redis backing unavailable")?,
            ),
            None => None,
        };

        let rate_limits = Arc::new(match &redis {
            Some(client) => RateLimitStore::redis_backed(
                client.clone(),
                config.filter_window,
                config.filter_max_per_window,
            ),
            None => RateLimitStore::in_memory(config.filter_window, config.filter_max_per_window),
        });

        let patterns = match &config.pattern_file {
            Some(path) => Arc::new(
                PatternSet::from_file(path).context("pattern rule file failed to load")?,
            ),
            None => Arc::new(PatternSet::builtin()),
        };
        let filter = Arc::new(LightweightFilter::new(
            rate_limits,
            patterns,
            config.enable_lightweight_filter,
        ));

        let templates = match &config.template_file {
            Some(path) => Arc::new(
                TemplateRegistry::from_file(path).context("template file failed to load")?,
            ),
            None => Arc::new(TemplateRegistry::builtin()),
        };

        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_ratio: config.circuit_failure_ratio,
            min_samples: config.circuit_min_samples,
            cooldown: config.circuit_cooldown,
            probe_max: 3,
        }));
        let transport = Arc::new(
            HttpTransport::new(config.llm_endpoint.clone(), config.llm_api_key.clone())
                .context("failed to build upstream transport")?,
        );
        let llm = Arc::new(LlmClient::new(
            transport,
            breaker,
            config.llm_model.clone(),
            config.llm_concurrency,
            config.llm_max_retries,
        ));

        let store: Arc<dyn ViolationStore> = match &config.violation_store_url {
            Some(url) => {
                let store =
                    PgViolationStore::connect(url, config.store_pool_size(), config.retention_days)
                        .await
                        .context("violation store unavailable")?;
                info!("violation store connected");
                Arc::new(store)
            }
            None => {
                info!("no violation store configured, using in-memory history");
                Arc::new(MemoryViolationStore::new(config.retention_days))
            }
        };

        let notifier = if config.enable_notifications {
            let url = config
                .notification_webhook_url
                .clone()
                .context("notifications enabled without a webhook URL")?;
            Some(Notifier::new(url)?)
        } else {
            None
        };

        let hub = SessionHub::new(config.session_queue_size);
        let decisions = Arc::new(DecisionHandler::new(store.clone(), hub.clone(), notifier));

        let orchestrator = Arc::new(Orchestrator::new(
            filter.clone(),
            templates.clone(),
            llm.clone(),
            decisions.clone(),
            store.clone(),
            config.llm_timeout,
        ));

        let simulator = Arc::new(Simulator::new(
            orchestrator.clone(),
            config.simulator_interval,
        ));

        Ok(Self {
            config,
            filter,
            templates,
            llm,
            store,
            decisions,
            orchestrator,
            hub,
            simulator,
            redis,
        })
    }
}
