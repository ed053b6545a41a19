//! Launch-time configuration for the database subsystem.
//!
//! Configuration is read once at startup and never mutated afterwards. The
//! only section consumed by this crate is `[databases]`; the web server,
//! logging sinks, and other host sections belong to the embedding process.
//! Values may contain `{$env.VAR}` placeholders which are substituted
//! exactly once at load time.

#![allow(
    clippy::string_slice,
    reason = "placeholder offsets come from find() on the same text"
)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::EngineTag;

/// Default number of workers per database when neither the database entry
/// nor the `[databases]` section overrides it.
pub const DEFAULT_WORKERS: usize = 2;
/// Default cap on concurrent queries accepted per conduit request.
pub const DEFAULT_MAX_QUERIES_PER_REQUEST: usize = 8;
/// Default capacity of each of the four DQM queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The `type` field named an engine this build does not know about.
    #[error("unknown database engine '{0}'")]
    UnknownEngine(String),
    /// A `{$env.VAR}` placeholder referenced an unset environment variable.
    #[error("missing credential: environment variable '{0}' is not set")]
    MissingCredential(String),
    /// The endpoint description is incomplete or contradictory.
    #[error("bad endpoint for database '{database}': {reason}")]
    BadEndpoint {
        /// Logical database name the endpoint belongs to.
        database: String,
        /// Human readable description of the problem.
        reason: String,
    },
    /// The configuration source could not be read or parsed.
    #[error("failed to read configuration: {0}")]
    Read(#[from] Box<figment::Error>),
}

/// Top-level configuration consumed by [`crate::system::System`].
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// The `[databases]` section.
    #[serde(default)]
    pub databases: DatabasesConfig,
}

/// The `[databases]` section: a default worker count plus one connection
/// entry per logical database.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DatabasesConfig {
    /// Default per-database worker count.
    #[serde(default, alias = "Workers")]
    pub workers: Option<usize>,
    /// Mapping from logical database name to its connection settings.
    #[serde(default, alias = "Connections")]
    pub connections: BTreeMap<String, ConnectionConfig>,
}

/// Connection settings for one logical database.
///
/// Field aliases accept the capitalised spellings used by the host process
/// configuration files.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Engine selector: `postgres`, `mysql`, `sqlite`, or `db2`.
    #[serde(alias = "Type")]
    pub r#type: String,
    /// Backend host name, where the engine uses one.
    #[serde(default, alias = "Host")]
    pub host: Option<String>,
    /// Backend TCP port, where the engine uses one.
    #[serde(default, alias = "Port")]
    pub port: Option<u16>,
    /// Database name, or the file path for SQLite.
    #[serde(default, alias = "Database")]
    pub database: Option<String>,
    /// Username used to authenticate against the backend.
    #[serde(default, alias = "Username")]
    pub username: Option<String>,
    /// Password used to authenticate against the backend.
    #[serde(default, alias = "Password")]
    pub password: Option<String>,
    /// Worker count for this database; overrides the section default.
    #[serde(default, alias = "MaxConnections")]
    pub max_connections: Option<usize>,
    /// Cap on concurrent queries per conduit request.
    #[serde(default, alias = "MaxQueriesPerRequest")]
    pub max_queries_per_request: Option<usize>,
    /// Per-tier queue capacity override.
    #[serde(default, alias = "QueueCapacity")]
    pub queue_capacity: Option<usize>,
    /// Directory holding this database's migration sources, grouped by
    /// design name. No directory means the database runs without managed
    /// migrations.
    #[serde(default, alias = "Migrations")]
    pub migrations: Option<PathBuf>,
    /// Schema name handed to the migration template engine.
    #[serde(default, alias = "Schema")]
    pub schema: Option<String>,
}

/// Immutable description of one configured database.
///
/// Built from [`ConnectionConfig`] at load time and shared behind an `Arc`
/// for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct DatabaseDescriptor {
    /// Stable logical name, e.g. `Acuranzo`.
    pub name: String,
    /// Which engine provider serves this database.
    pub engine: EngineTag,
    /// Endpoint parameters handed to the provider's `connect`.
    pub endpoint: Endpoint,
    /// Number of worker tasks (and therefore live connections).
    pub workers: usize,
    /// Cap on concurrent queries per conduit request.
    pub max_queries_per_request: usize,
    /// Capacity of each of the four queues.
    pub queue_capacity: usize,
    /// Migration source directory, if any.
    pub migrations: Option<PathBuf>,
    /// Schema name for template expansion.
    pub schema: String,
}

/// Endpoint parameters for one backend.
#[derive(Debug, Clone, Default)]
pub struct Endpoint {
    /// Host name, for networked engines.
    pub host: Option<String>,
    /// TCP port, for networked engines.
    pub port: Option<u16>,
    /// Database name, or file path for SQLite.
    pub database: Option<String>,
    /// Username.
    pub username: Option<String>,
    /// Password.
    pub password: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file plus `HYDROGEN_`-prefixed
    /// environment overrides, then substitute `{$env.VAR}` placeholders.
    ///
    /// # Errors
    /// Returns [`ConfigError::Read`] when the file cannot be parsed and
    /// [`ConfigError::MissingCredential`] when a placeholder names an unset
    /// environment variable.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("HYDROGEN_").split("__"));
        let mut config: Self = figment.extract().map_err(Box::new)?;
        config.substitute_env()?;
        Ok(config)
    }

    /// Parse configuration from an in-memory TOML string.
    ///
    /// # Errors
    /// Same conditions as [`Config::load`].
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let figment = Figment::new().merge(Toml::string(text));
        let mut config: Self = figment.extract().map_err(Box::new)?;
        config.substitute_env()?;
        Ok(config)
    }

    /// Build the immutable per-database descriptors.
    ///
    /// # Errors
    /// Returns [`ConfigError::UnknownEngine`] for an unrecognised `type`
    /// and [`ConfigError::BadEndpoint`] when required endpoint fields are
    /// missing for the selected engine.
    pub fn descriptors(&self) -> Result<Vec<DatabaseDescriptor>, ConfigError> {
        let default_workers = self.databases.workers.unwrap_or(DEFAULT_WORKERS);
        let mut out = Vec::with_capacity(self.databases.connections.len());
        for (name, conn) in &self.databases.connections {
            out.push(descriptor_for(name, conn, default_workers)?);
        }
        Ok(out)
    }

    fn substitute_env(&mut self) -> Result<(), ConfigError> {
        for conn in self.databases.connections.values_mut() {
            substitute_field(&mut conn.host)?;
            substitute_field(&mut conn.database)?;
            substitute_field(&mut conn.username)?;
            substitute_field(&mut conn.password)?;
        }
        Ok(())
    }
}

fn descriptor_for(
    name: &str,
    conn: &ConnectionConfig,
    default_workers: usize,
) -> Result<DatabaseDescriptor, ConfigError> {
    let engine = EngineTag::parse(&conn.r#type)
        .ok_or_else(|| ConfigError::UnknownEngine(conn.r#type.clone()))?;
    let endpoint = Endpoint {
        host: conn.host.clone(),
        port: conn.port,
        database: conn.database.clone(),
        username: conn.username.clone(),
        password: conn.password.clone(),
    };
    validate_endpoint(name, engine, &endpoint)?;
    let workers = conn.max_connections.unwrap_or(default_workers).max(1);
    Ok(DatabaseDescriptor {
        name: name.to_owned(),
        engine,
        endpoint,
        workers,
        max_queries_per_request: conn
            .max_queries_per_request
            .unwrap_or(DEFAULT_MAX_QUERIES_PER_REQUEST)
            .max(1),
        queue_capacity: conn.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY).max(1),
        migrations: conn.migrations.clone(),
        schema: conn.schema.clone().unwrap_or_else(|| "public".to_owned()),
    })
}

fn validate_endpoint(
    name: &str,
    engine: EngineTag,
    endpoint: &Endpoint,
) -> Result<(), ConfigError> {
    let missing = |reason: &str| ConfigError::BadEndpoint {
        database: name.to_owned(),
        reason: reason.to_owned(),
    };
    match engine {
        EngineTag::Sqlite => {
            if endpoint.database.as_deref().is_none_or(str::is_empty) {
                return Err(missing("sqlite requires a database path"));
            }
        }
        EngineTag::Postgres | EngineTag::Mysql | EngineTag::Db2 => {
            if endpoint.host.as_deref().is_none_or(str::is_empty) {
                return Err(missing("networked engines require a host"));
            }
            if endpoint.database.as_deref().is_none_or(str::is_empty) {
                return Err(missing("networked engines require a database name"));
            }
        }
    }
    Ok(())
}

/// Substitute `{$env.VAR}` placeholders inside one optional field.
fn substitute_field(field: &mut Option<String>) -> Result<(), ConfigError> {
    if let Some(value) = field.as_mut() {
        *value = substitute_placeholders(value)?;
    }
    Ok(())
}

fn substitute_placeholders(input: &str) -> Result<String, ConfigError> {
    const OPEN: &str = "{$env.";
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        let Some(end) = after.find('}') else {
            // Unterminated placeholder is passed through verbatim.
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let var = &after[..end];
        match std::env::var(var) {
            Ok(value) => out.push_str(&value),
            Err(_) => return Err(ConfigError::MissingCredential(var.to_owned())),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
