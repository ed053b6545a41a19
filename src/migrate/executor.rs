//! The migration executor: apply, reverse, and restart integrity.
//!
//! The apply phase runs on the lead connection before the DQM starts its
//! workers: each pending ordinal executes as one transaction that also
//! inserts the applied-migration row, and the walk halts at the first
//! failure. The reverse phase runs later, through the Slow queue, while
//! the remaining workers keep serving the read tiers.

#![allow(
    clippy::string_slice,
    reason = "match offsets come from match_indices on the same text"
)]

use std::path::Path;

use tracing::{info, warn};

use crate::dqm::{Dqm, Submission};
use crate::engine::{EngineConnection, EngineError, EngineTag, ExecTarget, Isolation, Param, QueryOutcome};

use super::queries::QueriesTable;
use super::source::{load_sources, split_statements, MigrationRecord, MigrationStatus};
use super::MigrateError;

/// Name of the per-database applied-migration table.
pub const APPLIED_TABLE: &str = "hydrogen_migrations";

/// The rendered migrations of one database, ready to apply.
#[derive(Debug, Clone)]
pub struct MigrationSet {
    engine: EngineTag,
    records: Vec<MigrationRecord>,
    queries: QueriesTable,
}

impl MigrationSet {
    /// Discover and render every migration under `dir` for `engine`.
    ///
    /// # Errors
    /// Source and template errors from [`load_sources`].
    pub fn load(dir: &Path, engine: EngineTag, schema: &str) -> Result<Self, MigrateError> {
        let (records, queries) = load_sources(dir, engine, schema)?;
        Ok(Self {
            engine,
            records,
            queries,
        })
    }

    /// Build a set from already-rendered records; used by hosts that keep
    /// migrations somewhere other than the filesystem.
    #[must_use]
    pub fn from_records(
        engine: EngineTag,
        records: Vec<MigrationRecord>,
        queries: QueriesTable,
    ) -> Self {
        Self {
            engine,
            records,
            queries,
        }
    }

    /// The rendered records, ascending by ordinal.
    #[must_use]
    pub fn records(&self) -> &[MigrationRecord] {
        &self.records
    }

    /// Queries table collected from migration metadata.
    #[must_use]
    pub fn queries_table(&self) -> QueriesTable {
        self.queries.clone()
    }

    fn record(&self, ordinal: u32) -> Option<&MigrationRecord> {
        self.records.iter().find(|r| r.ordinal == ordinal)
    }

    /// Apply every pending migration in ascending ordinal order on the
    /// lead connection.
    ///
    /// Restart integrity is checked first: for every applied ordinal also
    /// present on disk, the stored content hash must match the rendered
    /// one. Returns the number of migrations applied.
    ///
    /// # Errors
    /// [`MigrateError::HashMismatch`] on integrity violations and
    /// [`MigrateError::MigrationFailed`] when an ordinal fails to apply;
    /// later ordinals are not attempted.
    pub async fn apply_pending(
        &self,
        conn: &mut dyn EngineConnection,
    ) -> Result<usize, MigrateError> {
        ensure_applied_table(conn, self.engine).await?;
        let applied = read_applied(conn).await?;
        self.verify_integrity(&applied)?;
        let next = u32::try_from(applied.len()).unwrap_or(u32::MAX) + 1;

        // Migration DDL runs with the statement timeout lifted on this
        // connection only.
        conn.set_statement_timeout(None)
            .await
            .map_err(|e| migration_failed(next, &e))?;
        let mut count = 0usize;
        let mut result = Ok(());
        for record in self.records.iter().filter(|r| r.ordinal >= next) {
            if record.status == MigrationStatus::Inactive {
                info!(
                    ordinal = record.ordinal,
                    design = %record.design,
                    "migration is inactive; holding this and later ordinals"
                );
                break;
            }
            if let Err(error) = self.apply_one(conn, record).await {
                result = Err(error);
                break;
            }
            count += 1;
        }
        let _ = conn
            .set_statement_timeout(Some(std::time::Duration::from_secs(30)))
            .await;
        result.map(|()| count)
    }

    async fn apply_one(
        &self,
        conn: &mut dyn EngineConnection,
        record: &MigrationRecord,
    ) -> Result<(), MigrateError> {
        let ordinal = record.ordinal;
        let fail = |e: &EngineError| migration_failed(ordinal, e);
        conn.begin(Isolation::ReadCommitted).await.map_err(|e| fail(&e))?;
        for statement in split_statements(&record.forward) {
            if let Err(error) = conn.execute(ExecTarget::Sql(&statement), &[], None).await {
                let _ = conn.rollback().await;
                return Err(fail(&error));
            }
        }
        let insert = format!(
            "INSERT INTO {APPLIED_TABLE} (ordinal, content_hash, applied_at, engine) \
             VALUES (?, ?, {}, ?)",
            now_expr(self.engine)
        );
        let params = [
            Param::Int(i64::from(ordinal)),
            Param::Text(record.content_hash.clone()),
            Param::Text(self.engine.as_str().to_owned()),
        ];
        if let Err(error) = conn.execute(ExecTarget::Sql(&insert), &params, None).await {
            let _ = conn.rollback().await;
            return Err(fail(&error));
        }
        conn.commit().await.map_err(|e| fail(&e))?;
        info!(ordinal, design = %record.design, "migration applied");
        Ok(())
    }

    fn verify_integrity(&self, applied: &[(u32, String)]) -> Result<(), MigrateError> {
        for (index, (ordinal, _)) in applied.iter().enumerate() {
            let expected = u32::try_from(index).unwrap_or(u32::MAX) + 1;
            if *ordinal != expected {
                return Err(MigrateError::MigrationFailed {
                    ordinal: *ordinal,
                    cause: format!(
                        "applied ordinals must form a strict prefix; found {ordinal} where {expected} was expected"
                    ),
                });
            }
        }
        for (ordinal, stored_hash) in applied {
            if let Some(record) = self.record(*ordinal) {
                if record.content_hash != *stored_hash {
                    return Err(MigrateError::HashMismatch { ordinal: *ordinal });
                }
            }
        }
        Ok(())
    }

    /// Reverse every applied migration in descending ordinal order through
    /// the DQM's Slow queue.
    ///
    /// Each reversal is its own transaction that also deletes the applied
    /// row. A reverse statement that would drop a table still holding rows
    /// its own forward SQL did not insert is refused. Errors halt the
    /// phase; reversals already committed stay committed and the DQM keeps
    /// running.
    ///
    /// # Errors
    /// [`MigrateError::ReverseUnsafe`] on a refused drop and
    /// [`MigrateError::MigrationFailed`] for SQL failures.
    pub async fn reverse_all(&self, dqm: &Dqm) -> Result<usize, MigrateError> {
        dqm.open_migration_window();
        let result = self.reverse_inner(dqm).await;
        dqm.close_migration_window();
        result
    }

    async fn reverse_inner(&self, dqm: &Dqm) -> Result<usize, MigrateError> {
        let applied = {
            let submission = dqm
                .submit_lead_query(
                    format!(
                        "SELECT ordinal, content_hash FROM {APPLIED_TABLE} ORDER BY ordinal"
                    ),
                    None,
                )
                .map_err(|e| migration_failed_msg(0, &e.to_string()))?;
            parse_applied(await_outcome(submission, 0).await?)
                .map_err(|cause| migration_failed_msg(0, &cause))?
        };
        let mut count = 0usize;
        for (ordinal, _) in applied.iter().rev() {
            let record = self.record(*ordinal).ok_or_else(|| {
                migration_failed_msg(*ordinal, "no on-disk source for applied ordinal")
            })?;
            let statements = split_statements(&record.reverse);
            self.check_reverse_safety(dqm, record, &statements).await?;
            let mut batch = statements;
            batch.push(format!(
                "DELETE FROM {APPLIED_TABLE} WHERE ordinal = {ordinal}"
            ));
            let submission = dqm
                .submit_batch(batch, None)
                .map_err(|e| migration_failed_msg(*ordinal, &e.to_string()))?;
            await_outcome(submission, *ordinal).await?;
            info!(ordinal, design = %record.design, "migration reversed");
            count += 1;
        }
        Ok(count)
    }

    async fn check_reverse_safety(
        &self,
        dqm: &Dqm,
        record: &MigrationRecord,
        statements: &[String],
    ) -> Result<(), MigrateError> {
        for statement in statements {
            let Some(table) = parse_drop_table(statement) else {
                continue;
            };
            if forward_inserts_into(&record.forward, &table) {
                // The forward migration seeded this table; its rows are the
                // migration's own to take away.
                continue;
            }
            let submission = dqm
                .submit_lead_query(format!("SELECT COUNT(*) FROM {table}"), None)
                .map_err(|e| migration_failed_msg(record.ordinal, &e.to_string()))?;
            let outcome = await_outcome(submission, record.ordinal).await?;
            let rows = match outcome {
                QueryOutcome::Rows { rows, .. } => rows,
                QueryOutcome::RowCount(_) => Vec::new(),
            };
            let count = rows
                .first()
                .and_then(|row| row.first())
                .and_then(serde_json::Value::as_i64)
                .unwrap_or(0);
            if count > 0 {
                warn!(
                    ordinal = record.ordinal,
                    %table, count, "reverse refused: table holds foreign rows"
                );
                return Err(MigrateError::ReverseUnsafe {
                    ordinal: record.ordinal,
                    table,
                });
            }
        }
        Ok(())
    }
}

async fn await_outcome(submission: Submission, ordinal: u32) -> Result<QueryOutcome, MigrateError> {
    match submission.receiver.await {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(error)) => Err(migration_failed_msg(ordinal, &error.to_string())),
        Err(_) => Err(migration_failed_msg(ordinal, "worker went away")),
    }
}

async fn ensure_applied_table(
    conn: &mut dyn EngineConnection,
    engine: EngineTag,
) -> Result<(), MigrateError> {
    let ddl = match engine {
        EngineTag::Db2 => format!(
            "CREATE TABLE {APPLIED_TABLE} (\
             ordinal BIGINT NOT NULL PRIMARY KEY, \
             content_hash VARCHAR(64) NOT NULL, \
             applied_at TIMESTAMP NOT NULL, \
             engine VARCHAR(16) NOT NULL)"
        ),
        _ => format!(
            "CREATE TABLE IF NOT EXISTS {APPLIED_TABLE} (\
             ordinal BIGINT NOT NULL PRIMARY KEY, \
             content_hash VARCHAR(64) NOT NULL, \
             applied_at TIMESTAMP NOT NULL, \
             engine VARCHAR(16) NOT NULL)"
        ),
    };
    match conn.execute(ExecTarget::Sql(&ddl), &[], None).await {
        Ok(_) => Ok(()),
        // DB2 has no IF NOT EXISTS; an existing table reports SQL0601.
        Err(EngineError::ExecFailed(message))
            if engine == EngineTag::Db2 && message.contains("SQL0601") =>
        {
            Ok(())
        }
        Err(error) => Err(migration_failed(0, &error)),
    }
}

async fn read_applied(
    conn: &mut dyn EngineConnection,
) -> Result<Vec<(u32, String)>, MigrateError> {
    let sql = format!("SELECT ordinal, content_hash FROM {APPLIED_TABLE} ORDER BY ordinal");
    let outcome = conn
        .execute(ExecTarget::Sql(&sql), &[], None)
        .await
        .map_err(|e| migration_failed(0, &e))?;
    parse_applied(outcome).map_err(|cause| migration_failed_msg(0, &cause))
}

fn parse_applied(outcome: QueryOutcome) -> Result<Vec<(u32, String)>, String> {
    let rows = match outcome {
        QueryOutcome::Rows { rows, .. } => rows,
        QueryOutcome::RowCount(_) => Vec::new(),
    };
    rows.into_iter()
        .map(|row| {
            let ordinal = row
                .first()
                .and_then(serde_json::Value::as_i64)
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| "applied row without a readable ordinal".to_owned())?;
            let hash = row
                .get(1)
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| "applied row without a readable content hash".to_owned())?
                .to_owned();
            Ok((ordinal, hash))
        })
        .collect()
}

fn now_expr(engine: EngineTag) -> &'static str {
    match engine {
        EngineTag::Postgres | EngineTag::Mysql => "NOW()",
        EngineTag::Sqlite => "CURRENT_TIMESTAMP",
        EngineTag::Db2 => "CURRENT TIMESTAMP",
    }
}

fn migration_failed(ordinal: u32, error: &EngineError) -> MigrateError {
    MigrateError::MigrationFailed {
        ordinal,
        cause: error.to_string(),
    }
}

fn migration_failed_msg(ordinal: u32, cause: &str) -> MigrateError {
    MigrateError::MigrationFailed {
        ordinal,
        cause: cause.to_owned(),
    }
}

/// Extract the target of a `DROP TABLE` statement, if that is what the
/// statement is.
fn parse_drop_table(statement: &str) -> Option<String> {
    let mut words = statement.split_whitespace();
    if !words.next()?.eq_ignore_ascii_case("drop") {
        return None;
    }
    if !words.next()?.eq_ignore_ascii_case("table") {
        return None;
    }
    let mut name = words.next()?;
    if name.eq_ignore_ascii_case("if") {
        // DROP TABLE IF EXISTS name
        words.next()?;
        name = words.next()?;
    }
    let bare = name
        .trim_end_matches(';')
        .trim_matches(|c| c == '"' || c == '`')
        .rsplit('.')
        .next()
        .unwrap_or(name);
    Some(bare.to_owned())
}

/// Whether the forward SQL inserts into `table`.
fn forward_inserts_into(forward: &str, table: &str) -> bool {
    let lowered = forward.to_lowercase();
    let needle = table.to_lowercase();
    lowered
        .match_indices("insert into")
        .any(|(at, _)| {
            lowered[at + "insert into".len()..]
                .split_whitespace()
                .next()
                .map(|word| {
                    word.trim_matches(|c| c == '"' || c == '`')
                        .rsplit('.')
                        .next()
                        .unwrap_or(word)
                        .trim_start_matches('(')
                        == needle
                })
                .unwrap_or(false)
        })
}
