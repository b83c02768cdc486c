//! Effect - lazy, composable description of a computation.
//!
//! Building an effect never runs anything. Every builder consumes the effect
//! and returns a new one whose node points at the previous node, so shared
//! prefixes are reused and nothing is ever mutated.
//!
//! Design:
//! - `Effect<T>` is a typed handle over an untyped [`node::Node`] chain.
//! - Each node carries the set of token keys it needs; `Runtime::run`
//!   refuses to start when the base provider does not cover them.
//! - Continuations run strictly in the order they were attached.

mod combinators;
mod engine;
mod node;

use std::any::type_name;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

pub(crate) use self::engine::execute;
pub(crate) use self::node::{Env, Exit, take};
use self::node::{Next, Node, RecoverFn, Step, Value, settled};
use crate::error::{ErrorTag, Failure};
use crate::provider::Provider;
use crate::retry::RetryPolicy;
use crate::runtime::Runtime;
use crate::token::Token;
use crate::tracer::TRACER;

/// A computation producing `T` or failing with a [`Failure`].
pub struct Effect<T> {
    pub(crate) node: Arc<Node>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Effect<T> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Effect<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("output", &type_name::<T>())
            .field("requires", self.node.requires())
            .finish()
    }
}

impl<T: Send + 'static> Effect<T> {
    fn from_node(node: Node) -> Self {
        Self {
            node: Arc::new(node),
            _marker: PhantomData,
        }
    }

    fn source<F>(requires: BTreeSet<String>, source: F) -> Self
    where
        F: Fn(&Env) -> Next + Send + Sync + 'static,
    {
        Self::from_node(Node::Source {
            source: Arc::new(source),
            requires,
        })
    }

    fn then<U: Send + 'static>(self, step: Step, requires: BTreeSet<String>) -> Effect<U> {
        Effect::from_node(Node::Step {
            upstream: self.node,
            step,
            requires,
        })
    }

    fn extend<U: Send + 'static>(self, step: Step, extra: impl IntoIterator<Item = String>) -> Effect<U> {
        let mut requires = self.node.requires().clone();
        requires.extend(extra);
        self.then(step, requires)
    }

    /// Token keys this effect needs from the run's provider.
    pub fn requirements(&self) -> Vec<&str> {
        self.node.requires().iter().map(String::as_str).collect()
    }

    // ---- sources ----

    pub fn succeed(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::source(BTreeSet::new(), move |_| Next::Value(Box::new(value.clone())))
    }

    pub fn fail(failure: impl Into<Failure>) -> Self {
        let failure = failure.into();
        Self::source(BTreeSet::new(), move |_| Next::Fail(failure.clone()))
    }

    /// Synchronous computation, re-evaluated on every run (and every retry).
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn() -> Result<T, Failure> + Send + Sync + 'static,
    {
        Self::source(BTreeSet::new(), move |_| settled(f()))
    }

    /// Asynchronous computation; cancelling the run abandons it with `Abort`.
    pub fn from_future<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, Failure>> + Send + 'static,
    {
        Self::source(BTreeSet::new(), move |_| {
            let future = f();
            Next::Future(async move { future.await.map(|v| Box::new(v) as Value) }.boxed())
        })
    }

    /// Asynchronous computation with a foreign error type.
    ///
    /// The error is not part of the domain model and surfaces as
    /// `UnexpectedError` with the original error as its source.
    pub fn try_future<F, Fut, E>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::source(BTreeSet::new(), move |_| {
            let future = f();
            Next::Future(
                async move {
                    future
                        .await
                        .map(|v| Box::new(v) as Value)
                        .map_err(Failure::from_error)
                }
                .boxed(),
            )
        })
    }

    /// Asynchronous computation that observes cancellation itself.
    ///
    /// The future receives the current signal and is awaited to completion;
    /// it decides how to wind down once the signal fires.
    pub fn cancellable<F, Fut>(f: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, Failure>> + Send + 'static,
    {
        Self::source(BTreeSet::new(), move |env| {
            let future = f(env.signal.clone());
            Next::Cooperative(async move { future.await.map(|v| Box::new(v) as Value) }.boxed())
        })
    }

    /// Build the effect only when it runs.
    pub fn suspend<F>(f: F) -> Self
    where
        F: Fn() -> Effect<T> + Send + Sync + 'static,
    {
        Self::source(BTreeSet::new(), move |_| Next::Effect(f().node))
    }

    // ---- combinators ----

    /// Run every effect; succeed with all values in input order.
    pub fn all<I>(effects: I) -> Effect<Vec<T>>
    where
        I: IntoIterator<Item = Effect<T>>,
    {
        Self::gather(effects, None)
    }

    /// Like [`Effect::all`], with at most `concurrency` effects in flight.
    ///
    /// # Panics
    ///
    /// When `concurrency` is zero.
    pub fn all_with_concurrency<I>(effects: I, concurrency: usize) -> Effect<Vec<T>>
    where
        I: IntoIterator<Item = Effect<T>>,
    {
        assert!(concurrency > 0, "Effect::all concurrency must be at least 1");
        Self::gather(effects, Some(concurrency))
    }

    fn gather<I>(effects: I, concurrency: Option<usize>) -> Effect<Vec<T>>
    where
        I: IntoIterator<Item = Effect<T>>,
    {
        let nodes = collect_nodes(effects);
        let requires = union_requirements(&nodes);
        let gathered = Effect::<Vec<Value>>::source(requires.clone(), move |env| {
            Next::Cooperative(combinators::all(Arc::clone(&nodes), concurrency, env.clone()).boxed())
        });
        gathered.then(
            Step::Map(Arc::new(|values: Value, _: &Env| {
                let typed = take::<Vec<Value>>(values)
                    .and_then(|values| values.into_iter().map(take::<T>).collect::<Result<Vec<T>, _>>());
                settled(typed)
            })),
            requires,
        )
    }

    /// First success wins; the others are cancelled.
    ///
    /// # Panics
    ///
    /// When `effects` is empty.
    pub fn any<I>(effects: I) -> Self
    where
        I: IntoIterator<Item = Effect<T>>,
    {
        let nodes = collect_nodes(effects);
        assert!(!nodes.is_empty(), "Effect::any needs at least one effect");
        let requires = union_requirements(&nodes);
        Self::source(requires, move |env| {
            Next::Cooperative(combinators::any(Arc::clone(&nodes), env.clone()).boxed())
        })
    }

    /// First settlement wins; the others are cancelled.
    ///
    /// # Panics
    ///
    /// When `effects` is empty.
    pub fn race<I>(effects: I) -> Self
    where
        I: IntoIterator<Item = Effect<T>>,
    {
        let nodes = collect_nodes(effects);
        assert!(!nodes.is_empty(), "Effect::race needs at least one effect");
        let requires = union_requirements(&nodes);
        Self::source(requires, move |env| {
            Next::Cooperative(combinators::race(Arc::clone(&nodes), env.clone()).boxed())
        })
    }

    // ---- value continuations ----

    pub fn map<U, F>(self, f: F) -> Effect<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.extend(
            Step::Map(Arc::new(move |value: Value, _: &Env| settled(take::<T>(value).map(&f)))),
            [],
        )
    }

    pub fn try_map<U, F>(self, f: F) -> Effect<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Result<U, Failure> + Send + Sync + 'static,
    {
        self.extend(
            Step::Map(Arc::new(move |value: Value, _: &Env| settled(take::<T>(value).and_then(&f)))),
            [],
        )
    }

    pub fn then_future<U, F, Fut>(self, f: F) -> Effect<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<U, Failure>> + Send + 'static,
    {
        self.extend(
            Step::Map(Arc::new(move |value: Value, _: &Env| match take::<T>(value) {
                Ok(value) => {
                    let future = f(value);
                    Next::Future(async move { future.await.map(|v| Box::new(v) as Value) }.boxed())
                }
                Err(failure) => Next::Fail(failure),
            })),
            [],
        )
    }

    pub fn and_then<U, F>(self, f: F) -> Effect<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Effect<U> + Send + Sync + 'static,
    {
        self.extend(
            Step::Map(Arc::new(move |value: Value, _: &Env| match take::<T>(value) {
                Ok(value) => Next::Effect(f(value).node),
                Err(failure) => Next::Fail(failure),
            })),
            [],
        )
    }

    /// Continue with an instance of `token` resolved from the run's context.
    pub fn with_service<S, U, F>(self, token: Token<S>, f: F) -> Effect<U>
    where
        S: Send + Sync + 'static,
        U: Send + 'static,
        F: Fn(T, Arc<S>) -> Effect<U> + Send + Sync + 'static,
    {
        let with_instance: Effect<(T, Arc<S>)> = self.extend(
            Step::Map(Arc::new(move |value: Value, env: &Env| {
                let ctx = env.ctx.clone();
                Next::Future(
                    async move {
                        let value = take::<T>(value)?;
                        let service = ctx.get(token).await?;
                        Ok(Box::new((value, service)) as Value)
                    }
                    .boxed(),
                )
            })),
            [token.key().to_string()],
        );
        with_instance.and_then(move |(value, service)| f(value, service))
    }

    // ---- failure continuations ----

    /// Recover from any non-defect failure.
    pub fn catch_all<F>(self, handler: F) -> Self
    where
        F: Fn(Failure) -> Effect<T> + Send + Sync + 'static,
    {
        self.recover(move |failure| Ok(handler(failure)))
    }

    /// Recover from failures whose key is `key`.
    pub fn catch<F>(self, key: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Failure) -> Effect<T> + Send + Sync + 'static,
    {
        let key = key.into();
        self.recover(move |failure| {
            if failure.key() == key {
                Ok(handler(failure))
            } else {
                Err(failure)
            }
        })
    }

    /// Recover from failures of `tag`, with access to the typed payload.
    pub fn catch_tag<P, F>(self, tag: ErrorTag<P>, handler: F) -> Self
    where
        P: Send + Sync + 'static,
        F: Fn(&P) -> Effect<T> + Send + Sync + 'static,
    {
        self.recover(move |failure| match tag.payload(&failure) {
            Some(payload) => Ok(handler(payload)),
            None => Err(failure),
        })
    }

    /// Recover with one handler per failure key.
    pub fn catch_tags(self, handlers: CatchMap<T>) -> Self {
        self.recover(move |failure| match handlers.handlers.get(failure.key()) {
            Some(handler) => handler(failure),
            None => Err(failure),
        })
    }

    fn recover<F>(self, handler: F) -> Self
    where
        F: Fn(Failure) -> Result<Effect<T>, Failure> + Send + Sync + 'static,
    {
        let recover: RecoverFn = Arc::new(move |failure: Failure, _: &Env| handler(failure).map(|effect| Next::Effect(effect.node)));
        self.extend(Step::Catch(recover), [])
    }

    // ---- side effects ----

    /// Run `f` after a success; its value is dropped, its failure replaces ours.
    pub fn tap<U, F>(self, f: F) -> Self
    where
        U: Send + 'static,
        F: Fn(&T) -> Effect<U> + Send + Sync + 'static,
    {
        self.extend(
            Step::Tap(Arc::new(move |value: &Value, _: &Env| match value.downcast_ref::<T>() {
                Some(value) => Next::Effect(f(value).node),
                None => Next::Fail(Failure::unexpected(format!(
                    "tap expected a value of type {}",
                    type_name::<T>()
                ))),
            })),
            [],
        )
    }

    /// Run `f` after any failure, defects included.
    pub fn tap_error<U, F>(self, f: F) -> Self
    where
        U: Send + 'static,
        F: Fn(&Failure) -> Effect<U> + Send + Sync + 'static,
    {
        self.extend(
            Step::TapError(Arc::new(move |failure: &Failure, _: &Env| Next::Effect(f(failure).node))),
            [],
        )
    }

    /// Run `f` exactly once when this effect settles, however it settles.
    ///
    /// A failing finalizer turns a success into its failure; after an
    /// upstream failure the upstream failure is kept.
    pub fn finally<U, F>(self, f: F) -> Self
    where
        U: Send + 'static,
        F: Fn() -> Effect<U> + Send + Sync + 'static,
    {
        self.extend(Step::Finally(Arc::new(move |_: &Env| Next::Effect(f().node))), [])
    }

    // ---- scheduling ----

    pub fn timeout(self, after: Duration) -> Self {
        self.extend(
            Step::Timeout {
                after,
                fallback: None,
            },
            [],
        )
    }

    /// On expiry settle with `fallback` instead of `TimeoutError`.
    pub fn timeout_or(self, after: Duration, fallback: Effect<T>) -> Self {
        let extra: Vec<String> = fallback.node.requires().iter().cloned().collect();
        self.extend(
            Step::Timeout {
                after,
                fallback: Some(fallback.node),
            },
            extra,
        )
    }

    pub fn retry(self, policy: RetryPolicy) -> Self {
        self.extend(Step::Retry(policy), [])
    }

    // ---- environment ----

    /// Layer `provider` over the run's context for this effect only.
    pub fn provide(self, provider: &Provider) -> Self {
        let requires = self
            .node
            .requires()
            .iter()
            .filter(|key| !provider.contains(key))
            .cloned()
            .collect();
        self.then(Step::Provide(provider.clone()), requires)
    }

    /// Run this effect inside a span of the bound [`crate::tracer::Tracer`].
    pub fn span<I, K, V>(self, name: impl Into<String>, attributes: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let attributes = attributes
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.extend(
            Step::Span {
                name: name.into(),
                attributes,
            },
            [TRACER.key().to_string()],
        )
    }

    // ---- running ----

    /// Run with a default runtime (empty provider).
    pub async fn run(self) -> Result<T, Failure> {
        Runtime::default().run(self).await
    }

    /// Run with a default runtime, panicking on failure.
    pub async fn run_unwrap(self) -> T {
        Runtime::default().run_unwrap(self).await
    }
}

impl Effect<()> {
    pub fn sleep(duration: Duration) -> Self {
        Self::source(BTreeSet::new(), move |_| {
            Next::Future(
                async move {
                    tokio::time::sleep(duration).await;
                    Ok(Box::new(()) as Value)
                }
                .boxed(),
            )
        })
    }
}

impl<S: Send + Sync + 'static> Effect<Arc<S>> {
    /// The instance bound to `token` in the run's context.
    pub fn service(token: Token<S>) -> Self {
        let requires = BTreeSet::from([token.key().to_string()]);
        Self::source(requires, move |env| {
            let ctx = env.ctx.clone();
            Next::Future(async move { ctx.get(token).await.map(|s| Box::new(s) as Value) }.boxed())
        })
    }
}

fn collect_nodes<T, I>(effects: I) -> Arc<[Arc<Node>]>
where
    I: IntoIterator<Item = Effect<T>>,
{
    effects.into_iter().map(|effect| effect.node).collect()
}

fn union_requirements(nodes: &[Arc<Node>]) -> BTreeSet<String> {
    nodes
        .iter()
        .flat_map(|node| node.requires().iter().cloned())
        .collect()
}

type CatchHandler<T> = Arc<dyn Fn(Failure) -> Result<Effect<T>, Failure> + Send + Sync>;

/// Failure key -> handler table for [`Effect::catch_tags`].
pub struct CatchMap<T> {
    handlers: HashMap<String, CatchHandler<T>>,
}

impl<T: Send + 'static> CatchMap<T> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn on<F>(mut self, key: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Failure) -> Effect<T> + Send + Sync + 'static,
    {
        self.handlers
            .insert(key.into(), Arc::new(move |failure: Failure| Ok(handler(failure))));
        self
    }

    pub fn on_tag<P, F>(mut self, tag: ErrorTag<P>, handler: F) -> Self
    where
        P: Send + Sync + 'static,
        F: Fn(&P) -> Effect<T> + Send + Sync + 'static,
    {
        self.handlers.insert(
            tag.key().to_string(),
            Arc::new(move |failure: Failure| match tag.payload(&failure) {
                Some(payload) => Ok(handler(payload)),
                None => Err(failure),
            }),
        );
        self
    }
}

impl<T: Send + 'static> Default for CatchMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CatchMap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatchMap")
            .field("keys", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
