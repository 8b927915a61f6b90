use crate::cache::{CacheRetrieveMode, CacheStoreMode, SharedCacheMode};
use crate::core::{PersistenceError, Result};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::str::FromStr;
use tracing::trace;

pub const SHARED_CACHE_MODE: &str = "jakarta.persistence.sharedCache.mode";
pub const CACHE_RETRIEVE_MODE: &str = "jakarta.persistence.cache.retrieveMode";
pub const CACHE_STORE_MODE: &str = "jakarta.persistence.cache.storeMode";
pub const CACHE_CAPACITY: &str = "rustmemorm.cache.capacity";
pub const CONTEXT_TYPE: &str = "rustmemorm.context.type";

/// Lifetime of the persistence contexts created by a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistenceContextType {
    /// Cleared at the end of every transaction; mutating operations need an
    /// active transaction.
    #[default]
    Transaction,
    /// Instances stay managed across transactions; only flush needs one.
    Extended,
}

impl FromStr for PersistenceContextType {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TRANSACTION" => Ok(Self::Transaction),
            "EXTENDED" => Ok(Self::Extended),
            other => Err(PersistenceError::Configuration(format!(
                "Unknown persistence context type '{}'",
                other
            ))),
        }
    }
}

/// Persistence unit configuration
///
/// Mirrors the properties of a `persistence.xml` unit.
#[derive(Debug, Clone)]
pub struct PersistenceUnitConfig {
    /// Unit name
    pub name: String,

    /// Which entity types the second-level cache holds
    pub shared_cache_mode: SharedCacheMode,

    /// Maximum number of cached entries; `None` is unbounded
    pub cache_capacity: Option<NonZeroUsize>,

    /// Lifetime of created persistence contexts
    pub context_type: PersistenceContextType,

    /// Default cache retrieve mode of created contexts
    pub retrieve_mode: CacheRetrieveMode,

    /// Default cache store mode of created contexts
    pub store_mode: CacheStoreMode,
}

impl PersistenceUnitConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            shared_cache_mode: SharedCacheMode::default(),
            cache_capacity: None,
            context_type: PersistenceContextType::default(),
            retrieve_mode: CacheRetrieveMode::default(),
            store_mode: CacheStoreMode::default(),
        }
    }

    pub fn shared_cache_mode(mut self, mode: SharedCacheMode) -> Self {
        self.shared_cache_mode = mode;
        self
    }

    /// Bound the cache; a capacity of zero leaves it unbounded
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = NonZeroUsize::new(capacity);
        self
    }

    pub fn context_type(mut self, context_type: PersistenceContextType) -> Self {
        self.context_type = context_type;
        self
    }

    pub fn retrieve_mode(mut self, mode: CacheRetrieveMode) -> Self {
        self.retrieve_mode = mode;
        self
    }

    pub fn store_mode(mut self, mode: CacheStoreMode) -> Self {
        self.store_mode = mode;
        self
    }

    /// Parse from unit properties
    ///
    /// Unknown keys are ignored; malformed values are `Configuration` errors.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let config = PersistenceUnitConfig::from_properties("orders", &[
    ///     ("jakarta.persistence.sharedCache.mode", "ENABLE_SELECTIVE"),
    ///     ("rustmemorm.cache.capacity", "1000"),
    /// ])?;
    /// ```
    pub fn from_properties<K, V>(name: &str, properties: &[(K, V)]) -> Result<Self>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::new(name);
        for (key, value) in properties {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                SHARED_CACHE_MODE => config.shared_cache_mode = value.parse()?,
                CACHE_RETRIEVE_MODE => config.retrieve_mode = value.parse()?,
                CACHE_STORE_MODE => config.store_mode = value.parse()?,
                CONTEXT_TYPE => config.context_type = value.parse()?,
                CACHE_CAPACITY => {
                    let capacity: usize = value.trim().parse().map_err(|_| {
                        PersistenceError::Configuration(format!(
                            "{} must be a positive integer, got '{}'",
                            CACHE_CAPACITY, value
                        ))
                    })?;
                    config.cache_capacity = Some(NonZeroUsize::new(capacity).ok_or_else(|| {
                        PersistenceError::Configuration(format!(
                            "{} must be a positive integer, got '{}'",
                            CACHE_CAPACITY, value
                        ))
                    })?);
                }
                other => trace!(key = other, "ignoring unknown persistence unit property"),
            }
        }
        Ok(config)
    }

    pub fn from_map(name: &str, properties: &HashMap<String, String>) -> Result<Self> {
        let pairs: Vec<(&String, &String)> = properties.iter().collect();
        Self::from_properties(name, &pairs)
    }
}

impl Default for PersistenceUnitConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PersistenceUnitConfig::default();
        assert_eq!(config.shared_cache_mode, SharedCacheMode::Unspecified);
        assert_eq!(config.context_type, PersistenceContextType::Transaction);
        assert!(config.cache_capacity.is_none());
    }

    #[test]
    fn test_builder() {
        let config = PersistenceUnitConfig::new("orders")
            .shared_cache_mode(SharedCacheMode::All)
            .cache_capacity(16)
            .context_type(PersistenceContextType::Extended)
            .store_mode(CacheStoreMode::Refresh);
        assert_eq!(config.name, "orders");
        assert_eq!(config.cache_capacity, NonZeroUsize::new(16));
        assert_eq!(config.context_type, PersistenceContextType::Extended);
        assert_eq!(config.store_mode, CacheStoreMode::Refresh);
    }

    #[test]
    fn test_from_properties() {
        let config = PersistenceUnitConfig::from_properties(
            "orders",
            &[
                (SHARED_CACHE_MODE, "DISABLE_SELECTIVE"),
                (CACHE_RETRIEVE_MODE, "BYPASS"),
                (CACHE_CAPACITY, "128"),
                (CONTEXT_TYPE, "extended"),
                ("hibernate.show_sql", "true"),
            ],
        )
        .unwrap();
        assert_eq!(config.shared_cache_mode, SharedCacheMode::DisableSelective);
        assert_eq!(config.retrieve_mode, CacheRetrieveMode::Bypass);
        assert_eq!(config.cache_capacity, NonZeroUsize::new(128));
        assert_eq!(config.context_type, PersistenceContextType::Extended);
    }

    #[test]
    fn test_malformed_properties() {
        for (key, value) in [
            (CACHE_CAPACITY, "0"),
            (CACHE_CAPACITY, "lots"),
            (SHARED_CACHE_MODE, "SOMETIMES"),
            (CONTEXT_TYPE, "FOREVER"),
        ] {
            let err = PersistenceUnitConfig::from_properties("u", &[(key, value)]).unwrap_err();
            assert!(matches!(err, PersistenceError::Configuration(_)), "{key}={value}");
        }
    }
}
