//! Failure model: typed domain errors plus the runtime's own failure cases.
//!
//! Every effect settles with `Result<T, Failure>`. Domain failures carry a
//! [`TypedError`] whose key is the discriminator used by `catch`; everything
//! else is produced by the runtime itself (timeouts, aborts, resolution).

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Payload attached to a [`TypedError`].
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Foreign error preserved as the cause of an [`Failure::Unexpected`].
pub type Cause = Arc<dyn std::error::Error + Send + Sync>;

/// Discriminators for the failures the runtime produces on its own.
pub mod keys {
    pub const UNEXPECTED: &str = "UnexpectedError";
    pub const TIMEOUT: &str = "TimeoutError";
    pub const ABORT: &str = "AbortError";
    pub const AGGREGATE: &str = "AggregateError";
    pub const TOKEN_NOT_PROVIDED: &str = "TokenNotProvidedError";
    pub const CIRCULAR_DEPENDENCY: &str = "CircularDependencyError";
    pub const MISSING_REQUIREMENTS: &str = "MissingRequirementsError";
}

/// A named, discriminable domain failure.
///
/// The key is the stable identity (`"NotFound"`, `"Billing.Declined"`, ...).
/// Message, payload and cause are optional.
#[derive(Clone, Error)]
#[error("{key}{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
pub struct TypedError {
    key: Arc<str>,
    message: Option<String>,
    payload: Option<Payload>,
    #[source]
    cause: Option<Arc<Failure>>,
}

impl TypedError {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self {
            key: key.into(),
            message: None,
            payload: None,
            cause: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_payload<P: Send + Sync + 'static>(mut self, payload: P) -> Self {
        self.payload = Some(Arc::new(payload));
        self
    }

    pub fn with_cause(mut self, cause: Failure) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn cause(&self) -> Option<&Failure> {
        self.cause.as_deref()
    }

    /// Borrow the payload as `P`, if one of that type was attached.
    pub fn payload<P: 'static>(&self) -> Option<&P> {
        self.payload.as_deref().and_then(|p| p.downcast_ref::<P>())
    }
}

impl fmt::Debug for TypedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedError")
            .field("key", &self.key)
            .field("message", &self.message)
            .field("has_payload", &self.payload.is_some())
            .field("cause", &self.cause)
            .finish()
    }
}

/// Typed identity for a family of domain failures with payload `P`.
///
/// ```ignore
/// struct NotFound { id: u64 }
/// const NOT_FOUND: ErrorTag<NotFound> = ErrorTag::new("NotFound");
///
/// let effect = Effect::<u64>::fail(NOT_FOUND.failure(NotFound { id: 7 }));
/// ```
pub struct ErrorTag<P> {
    key: &'static str,
    _marker: PhantomData<fn() -> P>,
}

impl<P> ErrorTag<P> {
    pub const fn new(key: &'static str) -> Self {
        Self {
            key,
            _marker: PhantomData,
        }
    }

    pub const fn key(&self) -> &'static str {
        self.key
    }

    /// Does `failure` belong to this tag?
    pub fn matches(&self, failure: &Failure) -> bool {
        failure.key() == self.key
    }
}

impl<P: Send + Sync + 'static> ErrorTag<P> {
    pub fn error(&self, payload: P) -> TypedError {
        TypedError::new(self.key).with_payload(payload)
    }

    pub fn failure(&self, payload: P) -> Failure {
        Failure::Domain(self.error(payload))
    }

    /// Borrow the typed payload of `failure` when it carries this tag.
    pub fn payload<'a>(&self, failure: &'a Failure) -> Option<&'a P> {
        match failure {
            Failure::Domain(err) if err.key() == self.key => err.payload::<P>(),
            _ => None,
        }
    }
}

impl<P> Clone for ErrorTag<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P> Copy for ErrorTag<P> {}

impl<P> fmt::Debug for ErrorTag<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ErrorTag").field(&self.key).finish()
    }
}

/// Terminal failure of an effect.
#[derive(Debug, Clone, Error)]
pub enum Failure {
    /// Explicit domain failure.
    #[error(transparent)]
    Domain(TypedError),

    /// Anything the program did not describe: panics, foreign errors.
    #[error("unexpected error: {message}")]
    Unexpected {
        message: String,
        #[source]
        cause: Option<Cause>,
    },

    #[error("timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("aborted: {reason}")]
    Abort { reason: String },

    /// Every alternative of an `any` failed; errors are in input order.
    #[error("all {} alternatives failed", .0.len())]
    Aggregate(Vec<Failure>),

    #[error("token not provided: {key}")]
    TokenNotProvided { key: String },

    #[error("circular dependency: {}", .cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    #[error("missing requirements: {}", .keys.join(", "))]
    MissingRequirements { keys: Vec<String> },
}

impl Failure {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Failure::Unexpected {
            message: message.into(),
            cause: None,
        }
    }

    /// Wrap a foreign error, keeping it as the cause.
    pub fn from_error<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Failure::Unexpected {
            message: error.to_string(),
            cause: Some(Arc::new(error)),
        }
    }

    /// Convert a caught panic payload.
    pub fn from_panic(panic: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = panic.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Failure::unexpected(format!("panicked: {message}"))
    }

    pub fn aborted() -> Self {
        Failure::Abort {
            reason: "cancellation requested".to_string(),
        }
    }

    /// Stable discriminator used by `catch` and by logs.
    pub fn key(&self) -> &str {
        match self {
            Failure::Domain(err) => err.key(),
            Failure::Unexpected { .. } => keys::UNEXPECTED,
            Failure::Timeout { .. } => keys::TIMEOUT,
            Failure::Abort { .. } => keys::ABORT,
            Failure::Aggregate(_) => keys::AGGREGATE,
            Failure::TokenNotProvided { .. } => keys::TOKEN_NOT_PROVIDED,
            Failure::CircularDependency { .. } => keys::CIRCULAR_DEPENDENCY,
            Failure::MissingRequirements { .. } => keys::MISSING_REQUIREMENTS,
        }
    }

    /// Defects bypass `catch` and `retry`: aborts and resolution-time errors.
    pub fn is_defect(&self) -> bool {
        matches!(
            self,
            Failure::Abort { .. }
                | Failure::TokenNotProvided { .. }
                | Failure::CircularDependency { .. }
                | Failure::MissingRequirements { .. }
        )
    }

    pub fn as_typed(&self) -> Option<&TypedError> {
        match self {
            Failure::Domain(err) => Some(err),
            _ => None,
        }
    }

    /// Children of an aggregate, empty for every other case.
    pub fn errors(&self) -> &[Failure] {
        match self {
            Failure::Aggregate(errors) => errors,
            _ => &[],
        }
    }
}

impl From<TypedError> for Failure {
    fn from(err: TypedError) -> Self {
        Failure::Domain(err)
    }
}
