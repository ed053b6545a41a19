//! Macro expansion for migration templates.
//!
//! Templates are engine-agnostic SQL carrying `${MACRO}` references. Each
//! reference resolves against the engine-specific table first, then the
//! common table, then the process environment. Expansion re-runs up to five
//! passes so macros may expand to further macros; anything left unresolved
//! after pass five is an error.

#![allow(
    clippy::string_slice,
    reason = "macro offsets come from find() on the same text"
)]

use crate::engine::EngineTag;

use super::MigrateError;

/// Maximum number of nested expansion passes.
const MAX_PASSES: usize = 5;

/// Context a template is rendered in.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    /// Engine the output SQL targets.
    pub engine: EngineTag,
    /// Design name the migration belongs to.
    pub design: &'a str,
    /// Schema name for qualified identifiers.
    pub schema: &'a str,
}

/// Engine-specific macro table: types, functions, and dialect fragments.
fn engine_macro(engine: EngineTag, name: &str) -> Option<&'static str> {
    use EngineTag::{Db2, Mysql, Postgres, Sqlite};
    match (name, engine) {
        ("TYPE_PK", Postgres) => Some("BIGSERIAL PRIMARY KEY"),
        ("TYPE_PK", Mysql) => Some("BIGINT AUTO_INCREMENT PRIMARY KEY"),
        ("TYPE_PK", Sqlite) => Some("INTEGER PRIMARY KEY AUTOINCREMENT"),
        ("TYPE_PK", Db2) => Some("BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY"),

        ("TYPE_INT", Postgres | Mysql | Db2) => Some("BIGINT"),
        ("TYPE_INT", Sqlite) => Some("INTEGER"),

        ("TYPE_TEXT", Postgres | Mysql | Sqlite) => Some("TEXT"),
        ("TYPE_TEXT", Db2) => Some("VARCHAR(4096)"),

        ("TYPE_BOOL", Postgres) => Some("BOOLEAN"),
        ("TYPE_BOOL", Mysql) => Some("TINYINT(1)"),
        ("TYPE_BOOL", Sqlite) => Some("INTEGER"),
        ("TYPE_BOOL", Db2) => Some("SMALLINT"),

        ("TYPE_TIMESTAMP", Postgres) => Some("TIMESTAMPTZ"),
        ("TYPE_TIMESTAMP", Mysql) => Some("DATETIME"),
        ("TYPE_TIMESTAMP", Sqlite) => Some("TEXT"),
        ("TYPE_TIMESTAMP", Db2) => Some("TIMESTAMP"),

        ("TYPE_JSON", Postgres) => Some("JSONB"),
        ("TYPE_JSON", Mysql) => Some("JSON"),
        ("TYPE_JSON", Sqlite) => Some("TEXT"),
        // DB2 has no JSON column type in the dialect Hydrogen targets.

        ("NOW", Postgres | Mysql) => Some("NOW()"),
        ("NOW", Sqlite) => Some("CURRENT_TIMESTAMP"),
        ("NOW", Db2) => Some("CURRENT TIMESTAMP"),

        ("IF_NOT_EXISTS", Postgres | Mysql | Sqlite) => Some("IF NOT EXISTS"),
        ("IF_NOT_EXISTS", Db2) => Some(""),

        _ => None,
    }
}

/// Whether `name` belongs to the engine-specific namespace at all. A macro
/// known here but absent from [`engine_macro`] for the requested engine is
/// an `EngineUnsupported` error rather than an environment lookup.
fn is_engine_macro(name: &str) -> bool {
    matches!(
        name,
        "TYPE_PK"
            | "TYPE_INT"
            | "TYPE_TEXT"
            | "TYPE_BOOL"
            | "TYPE_TIMESTAMP"
            | "TYPE_JSON"
            | "NOW"
            | "IF_NOT_EXISTS"
    )
}

/// Common macro table: schema, design, and bookkeeping names.
fn common_macro(name: &str, ctx: &TemplateContext<'_>) -> Option<String> {
    match name {
        "SCHEMA" => Some(ctx.schema.to_owned()),
        "DESIGN" => Some(ctx.design.to_owned()),
        "MIGRATIONS_TABLE" => Some(super::executor::APPLIED_TABLE.to_owned()),
        // SQLite has no schemas; the prefix collapses to nothing there.
        "SCHEMA_PREFIX" => Some(if ctx.engine == EngineTag::Sqlite {
            String::new()
        } else {
            format!("{}.", ctx.schema)
        }),
        _ => None,
    }
}

fn resolve(name: &str, ctx: &TemplateContext<'_>) -> Result<Option<String>, MigrateError> {
    if let Some(value) = engine_macro(ctx.engine, name) {
        return Ok(Some(value.to_owned()));
    }
    if is_engine_macro(name) {
        return Err(MigrateError::EngineUnsupported {
            name: name.to_owned(),
            engine: ctx.engine,
        });
    }
    if let Some(value) = common_macro(name, ctx) {
        return Ok(Some(value));
    }
    Ok(std::env::var(name).ok())
}

/// Expand every `${MACRO}` reference, re-running up to five passes to
/// support nested macros.
///
/// # Errors
/// [`MigrateError::UnresolvedMacro`] when a reference survives pass five,
/// [`MigrateError::EngineUnsupported`] when a template needs an
/// engine-specific entry the target engine does not have.
pub fn expand(template: &str, ctx: &TemplateContext<'_>) -> Result<String, MigrateError> {
    let mut text = template.to_owned();
    for _ in 0..MAX_PASSES {
        let (expanded, replaced) = expand_once(&text, ctx)?;
        text = expanded;
        if !replaced {
            break;
        }
    }
    match first_macro(&text) {
        Some(name) => Err(MigrateError::UnresolvedMacro { name }),
        None => Ok(text),
    }
}

/// One expansion pass. Returns the new text and whether anything changed.
fn expand_once(text: &str, ctx: &TemplateContext<'_>) -> Result<(String, bool), MigrateError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut replaced = false;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return Ok((out, replaced));
        };
        let name = &after[..end];
        match resolve(name, ctx)? {
            Some(value) => {
                out.push_str(&value);
                replaced = true;
            }
            None => {
                // Leave it in place; a later pass may not help, in which
                // case expand() reports it.
                out.push_str(&rest[start..start + 2 + end + 1]);
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok((out, replaced))
}

fn first_macro(text: &str) -> Option<String> {
    let start = text.find("${")?;
    let after = &text[start + 2..];
    let end = after.find('}')?;
    Some(after[..end].to_owned())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn ctx(engine: EngineTag) -> TemplateContext<'static> {
        TemplateContext {
            engine,
            design: "acuranzo",
            schema: "app",
        }
    }

    #[rstest]
    #[case(EngineTag::Postgres, "id BIGSERIAL PRIMARY KEY")]
    #[case(EngineTag::Sqlite, "id INTEGER PRIMARY KEY AUTOINCREMENT")]
    #[case(EngineTag::Mysql, "id BIGINT AUTO_INCREMENT PRIMARY KEY")]
    fn engine_types_expand(#[case] engine: EngineTag, #[case] expected: &str) {
        let result = expand("id ${TYPE_PK}", &ctx(engine)).unwrap();
        assert_eq!(result, expected);
    }

    #[rstest]
    fn schema_prefix_collapses_for_sqlite() {
        assert_eq!(
            expand("SELECT * FROM ${SCHEMA_PREFIX}users", &ctx(EngineTag::Sqlite)).unwrap(),
            "SELECT * FROM users"
        );
        assert_eq!(
            expand("SELECT * FROM ${SCHEMA_PREFIX}users", &ctx(EngineTag::Postgres)).unwrap(),
            "SELECT * FROM app.users"
        );
    }

    #[rstest]
    fn unresolved_macro_is_reported_after_five_passes() {
        let err = expand("SELECT ${NO_SUCH_MACRO_ANYWHERE}", &ctx(EngineTag::Sqlite)).unwrap_err();
        assert!(matches!(
            err,
            MigrateError::UnresolvedMacro { ref name } if name == "NO_SUCH_MACRO_ANYWHERE"
        ));
    }

    #[rstest]
    fn missing_engine_entry_is_engine_unsupported() {
        let err = expand("payload ${TYPE_JSON}", &ctx(EngineTag::Db2)).unwrap_err();
        assert!(matches!(
            err,
            MigrateError::EngineUnsupported { ref name, engine }
                if name == "TYPE_JSON" && engine == EngineTag::Db2
        ));
    }

    #[rstest]
    fn nested_macros_expand_through_the_environment() {
        // Environment values may themselves reference macros.
        // The variable name is unique to this test to avoid collisions.
        unsafe { std::env::set_var("HYDROGEN_TPL_TEST_NESTED", "${TYPE_TEXT}") };
        let result = expand("c ${HYDROGEN_TPL_TEST_NESTED}", &ctx(EngineTag::Postgres)).unwrap();
        assert_eq!(result, "c TEXT");
        unsafe { std::env::remove_var("HYDROGEN_TPL_TEST_NESTED") };
    }

    #[rstest]
    fn design_and_migrations_table_resolve() {
        let result = expand("${DESIGN} ${MIGRATIONS_TABLE}", &ctx(EngineTag::Mysql)).unwrap();
        assert_eq!(result, "acuranzo hydrogen_migrations");
    }
}
