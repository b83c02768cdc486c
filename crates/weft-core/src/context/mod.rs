//! Context - per-run resolution environment.
//!
//! A context is created for exactly one run. It lazily invokes provider
//! factories, caches what they produce, and refuses dependency cycles.
//!
//! Design:
//! - `slots` maps an identity to its in-flight (or finished) resolution,
//!   a `Shared` future, so concurrent callers all await the one factory call.
//! - `waiting` tracks which identity is currently waiting on which; a new
//!   wait that would close a loop is answered with `CircularDependency`
//!   instead of deadlocking.
//! - `layers` memoizes the child context of each scoped provider, so a
//!   `provide` step that runs twice (retry, `all`) reuses one cache.
//! - All of it lives behind one `std::sync::Mutex`; it is never held across
//!   an `.await`.
//! - Everything reachable from `slots` or `layers` points back up with a
//!   `Weak`, so an abandoned resolution cannot keep the run alive.

mod graph;

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::FutureExt;
use futures::future::{self, BoxFuture, Shared};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use self::graph::DependencyGraph;
use crate::error::Failure;
use crate::provider::Provider;
use crate::token::{Instance, Token};

type Resolution = Shared<BoxFuture<'static, Result<Instance, Failure>>>;

struct ResolutionState {
    slots: HashMap<String, Resolution>,
    waiting: DependencyGraph,
    layers: HashMap<usize, Context>,
}

struct ContextInner {
    provider: Provider,
    parent: Option<Weak<ContextInner>>,
    signal: CancellationToken,
    state: Mutex<ResolutionState>,
}

/// Per-run resolution environment.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn new(provider: Provider, signal: CancellationToken) -> Self {
        Self::build(provider, None, signal)
    }

    /// Child context: `provider` shadows this one, unbound keys fall through.
    ///
    /// One child per provider for the lifetime of this context; the entry
    /// keeps the provider alive, so its identity is never reused meanwhile.
    pub(crate) fn layer(&self, provider: &Provider) -> Self {
        self.lock_state()
            .layers
            .entry(provider.identity())
            .or_insert_with(|| {
                trace!(keys = ?provider.keys(), "opening provider layer");
                Self::build(
                    provider.clone(),
                    Some(Arc::downgrade(&self.inner)),
                    self.inner.signal.clone(),
                )
            })
            .clone()
    }

    fn build(
        provider: Provider,
        parent: Option<Weak<ContextInner>>,
        signal: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                provider,
                parent,
                signal,
                state: Mutex::new(ResolutionState {
                    slots: HashMap::new(),
                    waiting: DependencyGraph::new(),
                    layers: HashMap::new(),
                }),
            }),
        }
    }

    pub fn signal(&self) -> &CancellationToken {
        &self.inner.signal
    }

    fn parent(&self) -> Option<Context> {
        let inner = self.inner.parent.as_ref()?.upgrade()?;
        Some(Context { inner })
    }

    /// Is `key` bound in this context or any layer below it?
    pub(crate) fn provides(&self, key: &str) -> bool {
        self.inner.provider.contains(key) || self.parent().is_some_and(|p| p.provides(key))
    }

    /// Has `key` already been resolved (successfully or not)?
    #[cfg(test)]
    fn is_resolved(&self, key: &str) -> bool {
        if self.inner.provider.contains(key) {
            return self
                .lock_state()
                .slots
                .get(key)
                .is_some_and(|slot| slot.peek().is_some());
        }
        self.parent().is_some_and(|p| p.is_resolved(key))
    }

    /// Resolve `token`, invoking its factory at most once per context.
    pub async fn get<T: Send + Sync + 'static>(&self, token: Token<T>) -> Result<Arc<T>, Failure> {
        let instance = self.resolve(token.key(), None).await?;
        token.downcast(instance)
    }

    pub(crate) fn resolve(
        &self,
        key: &str,
        requester: Option<&str>,
    ) -> BoxFuture<'static, Result<Instance, Failure>> {
        let Some(factory) = self.inner.provider.factory(key) else {
            // Bindings of lower layers never see keys of this one, so the
            // requester's wait edge stays local.
            return match self.parent() {
                Some(parent) => parent.resolve(key, None),
                // The run that owned the lower layers is gone.
                None if self.inner.parent.is_some() => {
                    future::ready(Err(Failure::aborted())).boxed()
                }
                None => future::ready(Err(Failure::TokenNotProvided {
                    key: key.to_string(),
                }))
                .boxed(),
            };
        };

        let mut state = self.lock_state();
        if let Some(waiting) = requester {
            if let Some(cycle) = state.waiting.cycle_through(waiting, key) {
                trace!(key, waiting, "refusing circular resolution");
                return future::ready(Err(Failure::CircularDependency { cycle })).boxed();
            }
            state.waiting.add_dependency(waiting, key);
        }

        let resolution = match state.slots.get(key) {
            Some(existing) => {
                trace!(key, "joining resolution");
                existing.clone()
            }
            None => {
                trace!(key, "invoking factory");
                let resolver = Resolver {
                    ctx: Arc::downgrade(&self.inner),
                    signal: self.inner.signal.clone(),
                    key: Arc::from(key),
                };
                let resolution = AssertUnwindSafe(async move { factory(resolver).await })
                    .catch_unwind()
                    .map(|caught| caught.unwrap_or_else(|panic| Err(Failure::from_panic(panic))))
                    .boxed()
                    .shared();
                state.slots.insert(key.to_string(), resolution.clone());
                resolution
            }
        };
        drop(state);

        let edge = requester.map(|waiting| WaitEdge {
            ctx: Arc::downgrade(&self.inner),
            waiting: waiting.to_string(),
            awaited: key.to_string(),
        });
        async move {
            let outcome = resolution.await;
            drop(edge);
            outcome
        }
        .boxed()
    }

    fn lock_state(&self) -> MutexGuard<'_, ResolutionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("provider", &self.inner.provider)
            .field("layered", &self.inner.parent.is_some())
            .field("layers", &self.lock_state().layers.len())
            .finish()
    }
}

/// Removes a wait edge once the wait is over, even when the waiter is dropped.
///
/// It lives inside a cached factory future, hence the `Weak`.
struct WaitEdge {
    ctx: Weak<ContextInner>,
    waiting: String,
    awaited: String,
}

impl Drop for WaitEdge {
    fn drop(&mut self) {
        if let Some(inner) = self.ctx.upgrade() {
            Context { inner }
                .lock_state()
                .waiting
                .remove_dependency(&self.waiting, &self.awaited);
        }
    }
}

/// Read-only view handed to a factory while it constructs `key`.
#[derive(Clone)]
pub struct Resolver {
    ctx: Weak<ContextInner>,
    signal: CancellationToken,
    key: Arc<str>,
}

impl Resolver {
    /// Identity currently being constructed.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn signal(&self) -> &CancellationToken {
        &self.signal
    }

    /// Resolve another identity from inside a factory.
    pub async fn get<T: Send + Sync + 'static>(&self, token: Token<T>) -> Result<Arc<T>, Failure> {
        let Some(inner) = self.ctx.upgrade() else {
            return Err(Failure::aborted());
        };
        // No strong handle may live across the await: this future is cached
        // inside the context it reads from.
        let resolution = Context { inner }.resolve(token.key(), Some(&*self.key));
        token.downcast(resolution.await?)
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").field("key", &self.key).finish()
    }
}
