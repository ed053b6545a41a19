//! Migration source discovery and rendering.
//!
//! Sources live under a per-database directory, grouped by design name,
//! one TOML file per migration: `migrations/<design>/NNNN_label.toml`.
//! Each file declares its ordinal, status, forward and reverse templates,
//! and the query definitions it contributes to the queries table. The
//! embedded ordinal is authoritative and must agree with the filename
//! prefix.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::engine::EngineTag;

use super::payload::{encode_payloads, reindent};
use super::queries::{QueriesTable, QueryDef};
use super::template::{expand, TemplateContext};
use super::MigrateError;

/// Declared status of a migration source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    /// Eligible for apply.
    #[default]
    Active,
    /// Present on disk but held back; later ordinals wait behind it.
    Inactive,
}

#[derive(Debug, Deserialize)]
struct SourceFile {
    ordinal: u32,
    #[serde(default)]
    design: Option<String>,
    #[serde(default)]
    status: MigrationStatus,
    forward: String,
    reverse: String,
    #[serde(default)]
    queries: Vec<QueryDef>,
}

/// A migration rendered for one engine.
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    /// Monotonic ordinal, starting at 1.
    pub ordinal: u32,
    /// Design name the migration belongs to.
    pub design: String,
    /// Declared status.
    pub status: MigrationStatus,
    /// Rendered forward SQL.
    pub forward: String,
    /// Rendered reverse SQL.
    pub reverse: String,
    /// Hex SHA-256 over rendered forward and reverse SQL.
    pub content_hash: String,
}

/// Discover and render every migration under `dir` for `engine`.
///
/// Returns records sorted by ordinal plus the queries table collected from
/// their metadata.
///
/// # Errors
/// Source errors for unreadable files, ordinal/filename disagreements,
/// duplicate or non-contiguous ordinals, and template errors from
/// rendering.
pub fn load_sources(
    dir: &Path,
    engine: EngineTag,
    schema: &str,
) -> Result<(Vec<MigrationRecord>, QueriesTable), MigrateError> {
    let mut files = discover(dir)?;
    files.sort();
    let mut records = Vec::with_capacity(files.len());
    let mut queries = QueriesTable::default();
    for path in files {
        let (record, defs) = load_one(&path, engine, schema)?;
        for def in defs {
            queries.insert(def);
        }
        records.push(record);
    }
    records.sort_by_key(|r| r.ordinal);
    validate_ordinals(&records, dir)?;
    Ok((records, queries))
}

fn discover(dir: &Path) -> Result<Vec<PathBuf>, MigrateError> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            // A design-name subdirectory.
            for inner in std::fs::read_dir(&path)? {
                let inner = inner?.path();
                if inner.extension().is_some_and(|e| e == "toml") {
                    out.push(inner);
                }
            }
        } else if path.extension().is_some_and(|e| e == "toml") {
            out.push(path);
        }
    }
    Ok(out)
}

fn load_one(
    path: &Path,
    engine: EngineTag,
    schema: &str,
) -> Result<(MigrationRecord, Vec<QueryDef>), MigrateError> {
    let source_error = |cause: String| MigrateError::Source {
        path: path.to_path_buf(),
        cause,
    };
    let text = std::fs::read_to_string(path)?;
    let file: SourceFile = toml::from_str(&text).map_err(|e| source_error(e.to_string()))?;
    if let Some(prefix) = filename_ordinal(path) {
        if prefix != file.ordinal {
            return Err(source_error(format!(
                "filename prefix {prefix} disagrees with declared ordinal {}",
                file.ordinal
            )));
        }
    }
    if file.ordinal == 0 {
        return Err(source_error("ordinals start at 1".to_owned()));
    }
    let design = file.design.unwrap_or_else(|| design_from_path(path));
    let ctx = TemplateContext {
        engine,
        design: &design,
        schema,
    };
    let forward = render(&file.forward, &ctx, path)?;
    let reverse = render(&file.reverse, &ctx, path)?;
    let content_hash = content_hash(&forward, &reverse);
    let queries = file
        .queries
        .into_iter()
        .map(|def| {
            Ok(QueryDef {
                sql: expand(&def.sql, &ctx)?,
                ..def
            })
        })
        .collect::<Result<Vec<_>, MigrateError>>()?;
    Ok((
        MigrationRecord {
            ordinal: file.ordinal,
            design,
            status: file.status,
            forward,
            reverse,
            content_hash,
        },
        queries,
    ))
}

/// Full rendering pipeline: macros, then payload blocks, then indentation.
fn render(
    template: &str,
    ctx: &TemplateContext<'_>,
    path: &Path,
) -> Result<String, MigrateError> {
    let expanded = expand(template, ctx)?;
    let encoded = encode_payloads(&expanded, ctx.engine, path)?;
    Ok(reindent(&encoded))
}

/// Stable digest over the rendered forward and reverse SQL.
#[must_use]
pub fn content_hash(forward: &str, reverse: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(forward.as_bytes());
    hasher.update(b"\n--\n");
    hasher.update(reverse.as_bytes());
    hex::encode(hasher.finalize())
}

fn filename_ordinal(path: &Path) -> Option<u32> {
    let stem = path.file_stem()?.to_str()?;
    let digits: String = stem.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

fn design_from_path(path: &Path) -> String {
    path.parent()
        .and_then(Path::file_name)
        .and_then(|n| n.to_str())
        .unwrap_or("default")
        .to_owned()
}

fn validate_ordinals(records: &[MigrationRecord], dir: &Path) -> Result<(), MigrateError> {
    for (index, record) in records.iter().enumerate() {
        let expected = u32::try_from(index).unwrap_or(u32::MAX) + 1;
        if record.ordinal != expected {
            return Err(MigrateError::Source {
                path: dir.to_path_buf(),
                cause: format!(
                    "ordinals must form 1..n without gaps; found {} where {expected} was expected",
                    record.ordinal
                ),
            });
        }
    }
    Ok(())
}

/// Split a rendered script into individual statements on `;` boundaries,
/// honouring quoted literals and line comments.
#[must_use]
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_comment = false;
    let mut chars = sql.chars().peekable();
    while let Some(ch) = chars.next() {
        if in_comment {
            current.push(ch);
            if ch == '\n' {
                in_comment = false;
            }
            continue;
        }
        if let Some(q) = quote {
            current.push(ch);
            if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => {
                quote = Some(ch);
                current.push(ch);
            }
            '-' if chars.peek() == Some(&'-') => {
                in_comment = true;
                current.push(ch);
            }
            ';' => {
                let trimmed = current.trim();
                if !trimmed.is_empty() {
                    statements.push(trimmed.to_owned());
                }
                current.clear();
            }
            c => current.push(c),
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_owned());
    }
    statements
}
