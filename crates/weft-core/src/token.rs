//! Token - typed identity for an injectable capability.
//!
//! Same phantom-type trick as the ids: the key is a plain string, the type
//! parameter only exists at compile time so `Token<Config>` and
//! `Token<Database>` cannot be mixed up.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::Failure;

/// A resolved instance as stored in a context cache.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Named identity for a capability of type `T`.
///
/// ```ignore
/// struct Config { url: String }
/// const CONFIG: Token<Config> = Token::new("Config");
/// ```
///
/// Keys must be unique within a provider; two tokens with the same key are
/// the same identity as far as resolution is concerned.
pub struct Token<T> {
    key: &'static str,
    _marker: PhantomData<fn() -> Arc<T>>,
}

impl<T> Token<T> {
    pub const fn new(key: &'static str) -> Self {
        Self {
            key,
            _marker: PhantomData,
        }
    }

    pub const fn key(&self) -> &'static str {
        self.key
    }
}

impl<T: Send + Sync + 'static> Token<T> {
    pub(crate) fn erase(value: Arc<T>) -> Instance {
        value
    }

    /// Recover the typed instance; a binding of another type is a bug in the
    /// wiring, reported as an unexpected failure.
    pub(crate) fn downcast(&self, instance: Instance) -> Result<Arc<T>, Failure> {
        instance.downcast::<T>().map_err(|_| {
            Failure::unexpected(format!(
                "token {} is bound to a value of another type (expected {})",
                self.key,
                std::any::type_name::<T>()
            ))
        })
    }
}

impl<T> Clone for Token<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Token<T> {}

impl<T> PartialEq for Token<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T> Eq for Token<T> {}

impl<T> Hash for Token<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl<T> AsRef<str> for Token<T> {
    fn as_ref(&self) -> &str {
        self.key
    }
}

impl<T> fmt::Debug for Token<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Token").field(&self.key).finish()
    }
}

impl<T> fmt::Display for Token<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Config;
    #[derive(Debug)]
    struct Database;

    const CONFIG: Token<Config> = Token::new("Config");

    #[test]
    fn downcast_roundtrip_keeps_identity() {
        let value = Arc::new(Config);
        let instance = Token::erase(Arc::clone(&value));
        let back = CONFIG.downcast(instance).unwrap();
        assert!(Arc::ptr_eq(&value, &back));
    }

    #[test]
    fn downcast_to_wrong_type_is_unexpected() {
        let db: Token<Database> = Token::new("Config");
        let instance = Token::erase(Arc::new(Config));
        let err = db.downcast(instance).unwrap_err();
        assert_eq!(err.key(), crate::error::keys::UNEXPECTED);
        assert!(err.to_string().contains("Config"));
    }

    #[test]
    fn tokens_compare_by_key() {
        let again: Token<Config> = Token::new("Config");
        assert_eq!(CONFIG, again);
        assert_eq!(CONFIG.to_string(), "Config");
    }
}
