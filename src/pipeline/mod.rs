pub mod breaker;
pub mod decision;
pub mod filter;
pub mod llm;
pub mod orchestrator;
pub mod patterns;
pub mod policy;
pub mod rate_limit;
pub mod templates;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use decision::DecisionHandler;
pub use filter::LightweightFilter;
pub use llm::{CompletionTransport, HttpTransport, LlmClient};
pub use orchestrator::{ModerateOptions, Orchestrator};
pub use patterns::PatternSet;
pub use rate_limit::RateLimitStore;
pub use templates::TemplateRegistry;
