//! Untyped effect nodes.
//!
//! An effect is a persistent linked chain: a source at the bottom, one
//! `Step` per attached continuation on top. Values travel type-erased
//! between steps; `Effect<T>` restores the types at its API boundary.

use std::any::{Any, type_name};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::Failure;
use crate::provider::Provider;
use crate::retry::RetryPolicy;

pub(crate) type Value = Box<dyn Any + Send>;

/// Settlement of one node.
pub(crate) type Exit = Result<Value, Failure>;

/// What a source or continuation hands back to the engine.
pub(crate) enum Next {
    Value(Value),
    Fail(Failure),
    /// Leaf future; the engine races it against the signal.
    Future(BoxFuture<'static, Exit>),
    /// Future that observes the signal itself and settles on its own.
    Cooperative(BoxFuture<'static, Exit>),
    /// Nested effect, executed with the current environment.
    Effect(Arc<Node>),
}

pub(crate) type SourceFn = Arc<dyn Fn(&Env) -> Next + Send + Sync>;
pub(crate) type TransformFn = Arc<dyn Fn(Value, &Env) -> Next + Send + Sync>;
/// `Err` hands the failure back unchanged (handler does not apply).
pub(crate) type RecoverFn = Arc<dyn Fn(Failure, &Env) -> Result<Next, Failure> + Send + Sync>;
pub(crate) type TapFn = Arc<dyn Fn(&Value, &Env) -> Next + Send + Sync>;
pub(crate) type TapErrorFn = Arc<dyn Fn(&Failure, &Env) -> Next + Send + Sync>;
pub(crate) type FinalizerFn = Arc<dyn Fn(&Env) -> Next + Send + Sync>;

pub(crate) enum Node {
    Source {
        source: SourceFn,
        requires: BTreeSet<String>,
    },
    Step {
        upstream: Arc<Node>,
        step: Step,
        requires: BTreeSet<String>,
    },
}

impl Node {
    pub(crate) fn requires(&self) -> &BTreeSet<String> {
        match self {
            Node::Source { requires, .. } | Node::Step { requires, .. } => requires,
        }
    }
}

pub(crate) enum Step {
    Map(TransformFn),
    Catch(RecoverFn),
    Tap(TapFn),
    TapError(TapErrorFn),
    Finally(FinalizerFn),
    Timeout {
        after: Duration,
        fallback: Option<Arc<Node>>,
    },
    Retry(RetryPolicy),
    Provide(Provider),
    Span {
        name: String,
        attributes: Vec<(String, String)>,
    },
}

/// Execution environment threaded through a run.
#[derive(Clone)]
pub(crate) struct Env {
    pub(crate) ctx: Context,
    pub(crate) signal: CancellationToken,
    pub(crate) default_concurrency: Option<usize>,
}

impl Env {
    pub(crate) fn new(ctx: Context, default_concurrency: Option<usize>) -> Self {
        let signal = ctx.signal().clone();
        Self {
            ctx,
            signal,
            default_concurrency,
        }
    }

    pub(crate) fn with_signal(&self, signal: CancellationToken) -> Self {
        Self {
            signal,
            ..self.clone()
        }
    }

    pub(crate) fn with_context(&self, ctx: Context) -> Self {
        Self {
            ctx,
            ..self.clone()
        }
    }

    /// Environment for cleanup: same context, a signal nobody cancels.
    pub(crate) fn detached(&self) -> Self {
        self.with_signal(CancellationToken::new())
    }
}

/// Recover a typed value from an erased one.
pub(crate) fn take<T: 'static>(value: Value) -> Result<T, Failure> {
    value.downcast::<T>().map(|boxed| *boxed).map_err(|_| {
        Failure::unexpected(format!(
            "effect produced a value of another type (expected {})",
            type_name::<T>()
        ))
    })
}

pub(crate) fn settled<T: Send + 'static>(result: Result<T, Failure>) -> Next {
    match result {
        Ok(value) => Next::Value(Box::new(value)),
        Err(failure) => Next::Fail(failure),
    }
}
