//! Runtime - turns an effect into a result.
//!
//! Design:
//! - A runtime owns the base provider and its config; it is cheap to clone.
//! - Every run gets its own `Context`, so nothing resolved in one run is
//!   visible to the next.
//! - Requirements are checked before anything executes.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span};

use crate::context::Context;
use crate::effect::{Effect, Env, execute, take};
use crate::error::Failure;
use crate::id::RunId;
use crate::provider::Provider;

/// Runtime settings, usually loaded from JSON.
///
/// ```ignore
/// let config = RuntimeConfig::from_json(r#"{ "label": "billing", "deadline_ms": 5000 }"#)?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Recorded on the span of every run.
    pub label: String,

    /// Whole-run timeout.
    pub deadline_ms: Option<u64>,

    /// Concurrency cap for `all` nodes that do not set their own.
    pub default_concurrency: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            label: "weft".to_string(),
            deadline_ms: None,
            default_concurrency: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> Result<(), BuildError> {
        if self.default_concurrency == Some(0) {
            return Err(BuildError::InvalidConfig(
                "default_concurrency must be at least 1".to_string(),
            ));
        }
        if self.deadline_ms == Some(0) {
            return Err(BuildError::InvalidConfig(
                "deadline_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// External cancellation; a fresh token is used when absent.
    pub signal: Option<CancellationToken>,
}

impl RunOptions {
    pub fn with_signal(signal: CancellationToken) -> Self {
        Self {
            signal: Some(signal),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Runtime {
    provider: Provider,
    config: RuntimeConfig,
}

impl Runtime {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            config: RuntimeConfig::default(),
        }
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub async fn run<T: Send + 'static>(&self, effect: Effect<T>) -> Result<T, Failure> {
        self.run_with(effect, RunOptions::default()).await
    }

    /// Run `effect` against a fresh context built from the base provider.
    ///
    /// Fails with `MissingRequirements` before executing anything when the
    /// provider does not bind every token the effect declares.
    pub async fn run_with<T: Send + 'static>(
        &self,
        effect: Effect<T>,
        options: RunOptions,
    ) -> Result<T, Failure> {
        let run_id = RunId::generate();
        let span = info_span!("weft.run", run_id = %run_id, label = %self.config.label);

        async move {
            let ctx = Context::new(self.provider.clone(), options.signal.unwrap_or_default());
            let missing: Vec<String> = effect
                .node
                .requires()
                .iter()
                .filter(|key| !ctx.provides(key))
                .cloned()
                .collect();
            if !missing.is_empty() {
                debug!(missing = ?missing, "requirements not provided, run refused");
                return Err(Failure::MissingRequirements { keys: missing });
            }

            let env = Env::new(ctx, self.config.default_concurrency);
            let effect = match self.config.deadline() {
                Some(deadline) => effect.timeout(deadline),
                None => effect,
            };

            debug!("run started");
            let exit = execute(effect.node, env).await;
            match &exit {
                Ok(_) => debug!("run succeeded"),
                Err(failure) => debug!(error = %failure, key = failure.key(), "run failed"),
            }
            exit.and_then(take::<T>)
        }
        .instrument(span)
        .await
    }

    /// Run `effect`, panicking with the failure's message if it fails.
    pub async fn run_unwrap<T: Send + 'static>(&self, effect: Effect<T>) -> T {
        match self.run(effect).await {
            Ok(value) => value,
            Err(failure) => panic!("effect failed: {failure}"),
        }
    }
}

/// Builds a [`Runtime`], checking the wiring up front.
///
/// ```ignore
/// let runtime = Runtime::builder()
///     .provide(&provider)
///     .expect_tokens(&[CONFIG.key(), SERVICE.key()])
///     .build()?;
/// ```
#[derive(Debug, Default)]
pub struct RuntimeBuilder {
    provider: Provider,
    config: RuntimeConfig,
    expected_tokens: Option<Vec<String>>,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Missing tokens: {0:?}. These tokens were expected but not provided.")]
    MissingTokens(Vec<String>),

    #[error("Invalid runtime config: {0}")]
    InvalidConfig(String),
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `provider` into the base provider; later bindings win.
    pub fn provide(mut self, provider: &Provider) -> Self {
        self.provider = self.provider.merge(provider);
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Tokens the base provider must bind for `build` to succeed.
    pub fn expect_tokens(mut self, keys: &[&str]) -> Self {
        self.expected_tokens = Some(keys.iter().map(|key| key.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Runtime, BuildError> {
        if let Some(expected) = &self.expected_tokens {
            let missing: Vec<String> = expected
                .iter()
                .filter(|key| !self.provider.contains(key))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingTokens(missing));
            }
        }
        self.config.validate()?;
        Ok(Runtime {
            provider: self.provider,
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::keys;
    use crate::token::Token;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CONFIG: Token<String> = Token::new("Config");
    const CLIENT: Token<String> = Token::new("Client");

    #[tokio::test]
    async fn default_runtime_runs_effects() {
        let runtime = Runtime::default();
        assert_eq!(runtime.run(Effect::succeed("ok")).await.unwrap(), "ok");
        assert_eq!(runtime.run_unwrap(Effect::succeed(3)).await, 3);
        assert_eq!(Effect::succeed(4).run_unwrap().await, 4);
    }

    #[tokio::test]
    #[should_panic(expected = "effect failed: Boom")]
    async fn run_unwrap_panics_on_failure() {
        Runtime::default()
            .run_unwrap(Effect::<u32>::fail(crate::error::TypedError::new("Boom")))
            .await;
    }

    #[test]
    fn build_succeeds_when_expected_tokens_are_bound() {
        let runtime = Runtime::builder()
            .provide(&Provider::new().value(CONFIG, "x".to_string()))
            .expect_tokens(&[CONFIG.key()])
            .build();
        assert!(runtime.is_ok());
    }

    #[test]
    fn build_reports_missing_tokens() {
        let runtime = Runtime::builder()
            .provide(&Provider::new().value(CONFIG, "x".to_string()))
            .expect_tokens(&[CONFIG.key(), CLIENT.key()])
            .build();
        assert!(matches!(
            runtime,
            Err(BuildError::MissingTokens(missing)) if missing == vec![CLIENT.key().to_string()]
        ));
    }

    #[test]
    fn build_rejects_zero_concurrency() {
        let config = RuntimeConfig {
            default_concurrency: Some(0),
            ..RuntimeConfig::default()
        };
        let runtime = Runtime::builder().config(config).build();
        assert!(matches!(runtime, Err(BuildError::InvalidConfig(_))));
    }

    #[test]
    fn config_from_json_fills_defaults() {
        let config = RuntimeConfig::from_json(r#"{ "deadline_ms": 250 }"#).unwrap();
        assert_eq!(config.label, "weft");
        assert_eq!(config.deadline(), Some(Duration::from_millis(250)));
        assert_eq!(config.default_concurrency, None);

        assert!(RuntimeConfig::from_json(r#"{ "deadline_ms": "soon" }"#).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_bounds_the_whole_run() {
        let runtime = Runtime::builder()
            .config(RuntimeConfig::from_json(r#"{ "label": "slow", "deadline_ms": 20 }"#).unwrap())
            .build()
            .unwrap();
        let slow = Effect::sleep(Duration::from_secs(5)).map(|_| 1);
        let err = runtime.run(slow).await.unwrap_err();
        assert_eq!(err.key(), keys::TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn default_concurrency_caps_all() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tracked = || {
            let (in_flight, peak) = (Arc::clone(&in_flight), Arc::clone(&peak));
            Effect::from_future(move || {
                let (in_flight, peak) = (Arc::clone(&in_flight), Arc::clone(&peak));
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };
        let runtime = Runtime::builder()
            .config(RuntimeConfig {
                default_concurrency: Some(3),
                ..RuntimeConfig::default()
            })
            .build()
            .unwrap();

        runtime.run(Effect::all((0..8).map(|_| tracked()))).await.unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn requirement_check_uses_the_base_provider() {
        let effect = Effect::service(CONFIG).map(|c| c.len());
        let err = Runtime::default().run(effect.clone()).await.unwrap_err();
        assert_eq!(err.key(), keys::MISSING_REQUIREMENTS);

        let runtime = Runtime::new(Provider::new().value(CONFIG, "four".to_string()));
        assert_eq!(runtime.run(effect).await.unwrap(), 4);
    }
}
