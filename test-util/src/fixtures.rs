//! Fixtures: database descriptors and migration source trees.

#![allow(clippy::unwrap_used, reason = "fixture setup may panic")]

use std::path::{Path, PathBuf};

use hydrogen::config::{DatabaseDescriptor, Endpoint};
use hydrogen::engine::EngineTag;

/// Descriptor for an in-memory style database served by a scripted engine.
#[must_use]
pub fn memory_descriptor(name: &str, workers: usize) -> DatabaseDescriptor {
    DatabaseDescriptor {
        name: name.to_owned(),
        engine: EngineTag::Sqlite,
        endpoint: Endpoint {
            database: Some(":memory:".to_owned()),
            ..Endpoint::default()
        },
        workers,
        max_queries_per_request: 5,
        queue_capacity: 256,
        migrations: None,
        schema: "main".to_owned(),
    }
}

/// Descriptor for a real SQLite database file, optionally with a migration
/// source directory.
#[must_use]
pub fn sqlite_file_descriptor(
    name: &str,
    file: &Path,
    migrations: Option<PathBuf>,
) -> DatabaseDescriptor {
    DatabaseDescriptor {
        name: name.to_owned(),
        engine: EngineTag::Sqlite,
        endpoint: Endpoint {
            database: Some(file.display().to_string()),
            ..Endpoint::default()
        },
        workers: 1,
        max_queries_per_request: 5,
        queue_capacity: 256,
        migrations,
        schema: "main".to_owned(),
    }
}

/// Write the standard two-migration tree used by the lifecycle tests:
/// ordinal 1 creates `gadgets` (with a lookup query), ordinal 2 adds a
/// `description` column.
pub fn write_basic_migrations(dir: &Path) {
    let design = dir.join("workshop");
    std::fs::create_dir_all(&design).unwrap();
    std::fs::write(
        design.join("0001_gadgets.toml"),
        r#"
ordinal = 1
forward = """
CREATE TABLE ${IF_NOT_EXISTS} gadgets (
    id ${TYPE_PK},
    name ${TYPE_TEXT} NOT NULL
)
"""
reverse = "DROP TABLE gadgets"

[[queries]]
ref = 101
name = "gadget_names"
tier = "fast"
sql = "SELECT id, name FROM gadgets ORDER BY id"

[[queries]]
ref = 102
name = "add_gadget"
tier = "medium"
sql = "INSERT INTO gadgets (name) VALUES (?)"
params = ["name"]
transactional = true
"#,
    )
    .unwrap();
    std::fs::write(
        design.join("0002_descriptions.toml"),
        r#"
ordinal = 2
forward = "ALTER TABLE gadgets ADD COLUMN description ${TYPE_TEXT}"
reverse = "ALTER TABLE gadgets DROP COLUMN description"
"#,
    )
    .unwrap();
}

/// Write a single migration that creates (and on reverse drops) `spares`.
pub fn write_single_migration(dir: &Path) {
    let design = dir.join("workshop");
    std::fs::create_dir_all(&design).unwrap();
    std::fs::write(
        design.join("0001_spares.toml"),
        r#"
ordinal = 1
forward = "CREATE TABLE spares (id ${TYPE_PK}, label ${TYPE_TEXT})"
reverse = "DROP TABLE spares"
"#,
    )
    .unwrap();
}
