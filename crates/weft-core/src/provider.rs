//! Provider - immutable registry of token factories.
//!
//! Design:
//! - Every mutator returns a new `Provider`; the receiver is left untouched.
//! - Bindings live in an `Arc<Vec<_>>`, so cloning a provider is cheap and
//!   a mutation copies only the (small) binding list.
//! - Nothing here ever invokes a factory; that happens in a `Context`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::context::Resolver;
use crate::error::Failure;
use crate::token::{Instance, Token};
use crate::tracer::{TRACER, Tracer};

pub(crate) type Factory =
    Arc<dyn Fn(Resolver) -> BoxFuture<'static, Result<Instance, Failure>> + Send + Sync>;

#[derive(Clone)]
struct Binding {
    key: Arc<str>,
    factory: Factory,
}

/// Ordered key -> factory mapping.
#[derive(Clone, Default)]
pub struct Provider {
    bindings: Arc<Vec<Binding>>,
}

impl Provider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `token` to an async factory.
    ///
    /// The factory receives a [`Resolver`] and may read any other identity
    /// visible to the context it runs in.
    ///
    /// ```ignore
    /// let provider = Provider::new()
    ///     .value(CONFIG, Config { url: "X".into() })
    ///     .provide(SERVICE, |r| async move {
    ///         let config = r.get(CONFIG).await?;
    ///         Ok(Service::connect(&config.url))
    ///     });
    /// ```
    pub fn provide<T, F, Fut>(&self, token: Token<T>, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(Resolver) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, Failure>> + Send + 'static,
    {
        let factory = Arc::new(factory);
        self.bind(
            token.key(),
            Arc::new(move |resolver: Resolver| {
                let factory = Arc::clone(&factory);
                async move {
                    let value = factory(resolver).await?;
                    Ok(Token::erase(Arc::new(value)))
                }
                .boxed()
            }),
        )
    }

    /// Bind `token` to a synchronous factory.
    pub fn provide_fn<T, F>(&self, token: Token<T>, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&Resolver) -> Result<T, Failure> + Send + Sync + 'static,
    {
        let factory = Arc::new(factory);
        self.bind(
            token.key(),
            Arc::new(move |resolver: Resolver| {
                let factory = Arc::clone(&factory);
                async move {
                    let value = factory(&resolver)?;
                    Ok(Token::erase(Arc::new(value)))
                }
                .boxed()
            }),
        )
    }

    /// Bind `token` to a constant.
    ///
    /// The same `Arc` is handed out by every context built from this provider.
    pub fn value<T: Send + Sync + 'static>(&self, token: Token<T>, value: T) -> Self {
        let instance = Token::erase(Arc::new(value));
        self.bind(
            token.key(),
            Arc::new(move |_resolver: Resolver| {
                let instance = Arc::clone(&instance);
                async move { Ok(instance) }.boxed()
            }),
        )
    }

    /// Bind the tracer capability used by `Effect::span`.
    pub fn tracer<R: Tracer + 'static>(&self, tracer: R) -> Self {
        let tracer: Arc<dyn Tracer> = Arc::new(tracer);
        self.value(TRACER, tracer)
    }

    /// Union of both providers; on a key collision `other` wins.
    pub fn merge(&self, other: &Provider) -> Self {
        let mut merged = self.clone();
        for binding in other.bindings.iter() {
            merged = merged.bind(&binding.key, Arc::clone(&binding.factory));
        }
        merged
    }

    /// Keep only the listed keys.
    pub fn pick<I, K>(&self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let keys: Vec<K> = keys.into_iter().collect();
        self.filtered(|key| keys.iter().any(|k| k.as_ref() == key))
    }

    /// Drop the listed keys.
    pub fn omit<I, K>(&self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let keys: Vec<K> = keys.into_iter().collect();
        self.filtered(|key| keys.iter().all(|k| k.as_ref() != key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.bindings.iter().any(|b| &*b.key == key)
    }

    /// Bound keys in binding order.
    pub fn keys(&self) -> Vec<&str> {
        self.bindings.iter().map(|b| &*b.key).collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Identity of the binding list; clones of one provider share it.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.bindings) as usize
    }

    pub(crate) fn factory(&self, key: &str) -> Option<Factory> {
        self.bindings
            .iter()
            .find(|b| &*b.key == key)
            .map(|b| Arc::clone(&b.factory))
    }

    /// Rebinding a key replaces the factory in place so the order stays stable.
    fn bind(&self, key: &str, factory: Factory) -> Self {
        let mut bindings = Vec::clone(&self.bindings);
        match bindings.iter_mut().find(|b| &*b.key == key) {
            Some(existing) => existing.factory = factory,
            None => bindings.push(Binding {
                key: Arc::from(key),
                factory,
            }),
        }
        Self {
            bindings: Arc::new(bindings),
        }
    }

    fn filtered(&self, keep: impl Fn(&str) -> bool) -> Self {
        let bindings = self
            .bindings
            .iter()
            .filter(|b| keep(&b.key))
            .cloned()
            .collect();
        Self {
            bindings: Arc::new(bindings),
        }
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider").field("keys", &self.keys()).finish()
    }
}
