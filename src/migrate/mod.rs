//! The migration engine.
//!
//! Engine-agnostic templates are expanded into engine-specific SQL by the
//! template engine, payload blocks are encoded (and compressed past the
//! threshold), and the executor applies the result as per-ordinal
//! transactions with restart integrity enforced through content hashes.

pub(crate) mod executor;
mod payload;
mod queries;
mod source;
mod template;

use std::path::PathBuf;

use thiserror::Error;

use crate::engine::EngineTag;

pub use executor::{MigrationSet, APPLIED_TABLE};
pub use payload::{encode_payloads, reindent};
pub use queries::{QueriesTable, QueryDef};
pub use source::{
    content_hash, load_sources, split_statements, MigrationRecord, MigrationStatus,
};
pub use template::{expand, TemplateContext};

/// Errors raised by the migration engine.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// A `${MACRO}` reference survived the final expansion pass.
    #[error("unresolved macro '${{{name}}}'")]
    UnresolvedMacro {
        /// The macro name.
        name: String,
    },
    /// A payload needed compression the runtime could not provide.
    #[error("payload compression unavailable: {0}")]
    CompressionUnavailable(String),
    /// A template needs an engine-specific entry this engine lacks.
    #[error("no {engine} entry for macro '${{{name}}}'")]
    EngineUnsupported {
        /// The macro name.
        name: String,
        /// The engine missing the entry.
        engine: EngineTag,
    },
    /// Applying (or reversing) an ordinal failed; later ordinals were not
    /// attempted.
    #[error("migration {ordinal} failed: {cause}")]
    MigrationFailed {
        /// The ordinal that failed.
        ordinal: u32,
        /// What went wrong.
        cause: String,
    },
    /// An applied ordinal's stored hash disagrees with the rendered source.
    #[error("content hash mismatch for applied migration {ordinal}")]
    HashMismatch {
        /// The offending ordinal.
        ordinal: u32,
    },
    /// A reverse migration would drop a table holding rows it did not add.
    #[error("reverse of migration {ordinal} would drop table '{table}' holding rows it did not add")]
    ReverseUnsafe {
        /// The offending ordinal.
        ordinal: u32,
        /// The table the reverse refused to drop.
        table: String,
    },
    /// A migration source file is malformed.
    #[error("bad migration source {path}: {cause}")]
    Source {
        /// Path of the offending file.
        path: PathBuf,
        /// What is wrong with it.
        cause: String,
    },
    /// The source directory could not be read.
    #[error("failed to read migration sources: {0}")]
    Io(#[from] std::io::Error),
}
