//! Tracer boundary used by `Effect::span`.
//!
//! The runtime never talks to a tracing backend directly. A span step
//! resolves the [`TRACER`] token and hands the upstream computation to it as
//! a [`SpanBody`]; the tracer decides what to record around it.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::Instrument;

use crate::effect::Exit;
use crate::error::Failure;
use crate::token::Token;

/// Identity under which a tracer is bound (see `Provider::tracer`).
pub const TRACER: Token<Arc<dyn Tracer>> = Token::new("Tracer");

/// Wraps the traced computation.
#[async_trait]
pub trait Tracer: Send + Sync {
    /// Run `body` inside a span called `name`.
    ///
    /// Implementations must either await `body` and return its outcome, or
    /// return [`SpanOutcome::failed`] without running it.
    async fn span(&self, name: &str, attributes: &[(String, String)], body: SpanBody) -> SpanOutcome;
}

/// The computation a tracer is asked to wrap.
pub struct SpanBody(BoxFuture<'static, Exit>);

impl SpanBody {
    pub(crate) fn new(body: BoxFuture<'static, Exit>) -> Self {
        Self(body)
    }
}

impl Future for SpanBody {
    type Output = SpanOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.poll_unpin(cx).map(SpanOutcome)
    }
}

impl fmt::Debug for SpanBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SpanBody")
    }
}

/// Opaque settlement of a [`SpanBody`].
pub struct SpanOutcome(Exit);

impl SpanOutcome {
    /// Settle the span without running its body.
    pub fn failed(failure: Failure) -> Self {
        Self(Err(failure))
    }

    pub fn is_success(&self) -> bool {
        self.0.is_ok()
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.0.as_ref().err()
    }

    pub(crate) fn into_exit(self) -> Exit {
        self.0
    }
}

impl fmt::Debug for SpanOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Ok(_) => f.write_str("SpanOutcome(Ok(..))"),
            Err(failure) => f.debug_tuple("SpanOutcome").field(failure).finish(),
        }
    }
}

/// [`Tracer`] backed by the `tracing` crate.
///
/// Every span is an `info` span named `weft.span`; the effect's span name and
/// attributes are recorded as fields, the outcome key is recorded on exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTracer;

#[async_trait]
impl Tracer for TracingTracer {
    async fn span(&self, name: &str, attributes: &[(String, String)], body: SpanBody) -> SpanOutcome {
        let span = tracing::info_span!(
            "weft.span",
            span.name = %name,
            attributes = ?attributes,
            outcome = tracing::field::Empty,
        );
        let outcome = body.instrument(span.clone()).await;
        let key = outcome.failure().map_or("ok", Failure::key);
        span.record("outcome", key);
        outcome
    }
}
