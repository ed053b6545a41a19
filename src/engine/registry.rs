//! Process-wide engine registry.
//!
//! Maps an engine tag to its provider capability table. The global registry
//! is populated once from the compiled-in provider list; there is no dynamic
//! loading. Tests may build private registries with injected providers.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use super::{Engine, EngineTag};

static GLOBAL: LazyLock<Registry> = LazyLock::new(Registry::builtin);

/// Mapping from engine tag to provider.
pub struct Registry {
    providers: HashMap<EngineTag, Arc<dyn Engine>>,
}

impl Registry {
    /// The process-wide registry of compiled-in providers.
    #[must_use]
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Registry holding every provider enabled at compile time.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self {
            providers: HashMap::new(),
        };
        cfg_if::cfg_if! {
            if #[cfg(feature = "postgres")] {
                registry.register(Arc::new(super::postgres::PostgresEngine));
            }
        }
        cfg_if::cfg_if! {
            if #[cfg(feature = "mysql")] {
                registry.register(Arc::new(super::mysql::MysqlEngine));
            }
        }
        cfg_if::cfg_if! {
            if #[cfg(feature = "sqlite")] {
                registry.register(Arc::new(super::sqlite::SqliteEngine));
            }
        }
        cfg_if::cfg_if! {
            if #[cfg(feature = "db2")] {
                registry.register(Arc::new(super::db2::Db2Engine));
            }
        }
        registry
    }

    /// Empty registry, for tests that inject their own providers.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Register a provider under its own tag, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn Engine>) {
        self.providers.insert(provider.tag(), provider);
    }

    /// Look up the provider for a tag.
    #[must_use]
    pub fn get(&self, tag: EngineTag) -> Option<Arc<dyn Engine>> {
        self.providers.get(&tag).cloned()
    }

    /// Tags with a registered provider, in no particular order.
    #[must_use]
    pub fn tags(&self) -> Vec<EngineTag> {
        self.providers.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_matches_compiled_features() {
        let registry = Registry::builtin();
        assert_eq!(
            registry.get(EngineTag::Sqlite).is_some(),
            cfg!(feature = "sqlite")
        );
        assert_eq!(
            registry.get(EngineTag::Postgres).is_some(),
            cfg!(feature = "postgres")
        );
        assert_eq!(
            registry.get(EngineTag::Mysql).is_some(),
            cfg!(feature = "mysql")
        );
        assert_eq!(registry.get(EngineTag::Db2).is_some(), cfg!(feature = "db2"));
    }

    #[test]
    fn empty_registry_has_no_providers() {
        assert!(Registry::empty().get(EngineTag::Sqlite).is_none());
    }
}
