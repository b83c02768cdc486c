//! weft-core
//!
//! Lazy, composable effects with typed failures and per-run dependency
//! resolution.
//!
//! # Modules
//! - **token / error**: typed identities for capabilities and failures
//! - **provider**: immutable token -> factory registry
//! - **context**: per-run, caching, cycle-safe resolution
//! - **effect**: effect descriptions, the engine and the all/any/race combinators
//! - **retry**: retry policy (attempts, backoff, jitter)
//! - **tracer**: span boundary plus a `tracing` adapter
//! - **runtime**: run entry points, config and builder

pub mod context;
pub mod effect;
pub mod error;
pub mod id;
pub mod provider;
pub mod retry;
pub mod runtime;
pub mod token;
pub mod tracer;

pub use context::{Context, Resolver};
pub use effect::{CatchMap, Effect};
pub use error::{ErrorTag, Failure, TypedError};
pub use id::RunId;
pub use provider::Provider;
pub use retry::RetryPolicy;
pub use runtime::{BuildError, RunOptions, Runtime, RuntimeBuilder, RuntimeConfig};
pub use token::Token;
pub use tracer::{SpanBody, SpanOutcome, TRACER, Tracer, TracingTracer};
