//! The in-memory queries table.
//!
//! Query references are stable integers that resolve to SQL templates with
//! a declared tier and parameter schema. The table is populated during the
//! migration load phase and published as an immutable snapshot once the
//! owning DQM enters `Running`, so reads never take a lock.

use std::collections::HashMap;

use serde::Deserialize;

use crate::dqm::Tier;

/// One resolvable query definition.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryDef {
    /// Stable reference callers submit.
    #[serde(rename = "ref")]
    pub query_ref: i64,
    /// Human-readable name, for logs.
    pub name: String,
    /// SQL template with `?` placeholders.
    pub sql: String,
    /// Queue tier the query is served from.
    #[serde(default)]
    pub tier: Tier,
    /// Declared parameter names, bound in order from the request object.
    #[serde(default)]
    pub params: Vec<String>,
    /// Whether execution is wrapped in a transaction.
    #[serde(default)]
    pub transactional: bool,
}

/// Mapping from query reference to definition.
#[derive(Debug, Clone, Default)]
pub struct QueriesTable {
    entries: HashMap<i64, QueryDef>,
}

impl QueriesTable {
    /// Resolve a reference.
    #[must_use]
    pub fn get(&self, query_ref: i64) -> Option<&QueryDef> {
        self.entries.get(&query_ref)
    }

    /// Number of definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table holds no definitions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a definition, replacing any previous holder of the reference.
    pub fn insert(&mut self, def: QueryDef) {
        self.entries.insert(def.query_ref, def);
    }

    /// Fold another table into this one; later definitions win.
    pub fn merge(&mut self, other: Self) {
        self.entries.extend(other.entries);
    }
}
