//! Database pool creation.
//!
//! This module provides compile-time database selection via feature flags.
//! Unlike `sqlx::AnyPool`, we use concrete pool types which allows full
//! support for `#[derive(FromRow)]` with `DateTime` columns.
//!
//! # Feature Priority
//!
//! - `mysql` feature: Uses `MySqlPool` (MySQL / MariaDB, production)
//! - `sqlite` feature (default): Uses `SqlitePool` (tests, single-host setups)
//!
//! If both features are enabled, `sqlite` takes priority. Production builds use
//! `--no-default-features --features mysql`.

use std::path::{Path, PathBuf};

use sqlx::pool::PoolOptions;
use tracing::{debug, info};

use crate::config::ConnectionConfig;
use crate::error::{Result, StoreError};

/// Database driver selected at compile time.
#[cfg(all(feature = "mysql", not(feature = "sqlite")))]
pub type Db = sqlx::MySql;

#[cfg(feature = "sqlite")]
pub type Db = sqlx::Sqlite;

/// Database pool type alias.
pub type DbPool = sqlx::Pool<Db>;

/// Name of the compiled-in database, for logs.
#[cfg(all(feature = "mysql", not(feature = "sqlite")))]
pub const DB_NAME: &str = "MySQL";

#[cfg(feature = "sqlite")]
pub const DB_NAME: &str = "SQLite";

/// Driver connect options for the compiled-in database.
#[cfg(all(feature = "mysql", not(feature = "sqlite")))]
type ConnectOptions = sqlx::mysql::MySqlConnectOptions;

#[cfg(feature = "sqlite")]
type ConnectOptions = sqlx::sqlite::SqliteConnectOptions;

/// Open a pool for the configured target and check that it answers.
pub async fn connect(config: &ConnectionConfig) -> Result<DbPool> {
    let (pool_options, options) = pool_options(config)?;
    let pool = pool_options
        .connect_with(options)
        .await
        .map_err(StoreError::from_connect)?;

    info!(target_db = %config.describe(), "Connected to {} database", DB_NAME);
    Ok(pool)
}

/// Create a pool that connects on first use.
///
/// Used for stores that only serve reads next to the write backend, so an
/// unreachable secondary database does not block writes.
pub fn connect_lazy(config: &ConnectionConfig) -> Result<DbPool> {
    let (pool_options, options) = pool_options(config)?;
    debug!(target_db = %config.describe(), "Deferred {} connection", DB_NAME);
    Ok(pool_options.connect_lazy_with(options))
}

#[cfg(feature = "sqlite")]
fn pool_options(config: &ConnectionConfig) -> Result<(PoolOptions<Db>, ConnectOptions)> {
    use sqlx::sqlite::{SqliteJournalMode, SqliteSynchronous};
    use std::str::FromStr;

    let url = match config.url.as_deref() {
        Some(url) if !is_mysql_url(url) => url,
        _ => {
            return Err(StoreError::connection_failed(format!(
                "{} requires MySQL support; rebuild with the 'mysql' feature",
                config.describe()
            )))
        }
    };

    let options = ConnectOptions::from_str(url)
        .map_err(StoreError::from_connect)?
        .create_if_missing(true)
        .foreign_keys(true);

    // Every connection to an in-memory database sees its own database, so keep
    // exactly one and never reap it.
    let in_memory = url.contains(":memory:") || url.contains("mode=memory");
    if in_memory {
        let pool_options = PoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
        return Ok((pool_options, options));
    }

    let options = options
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);
    let pool_options = PoolOptions::new().max_connections(config.max_connections.max(1));
    Ok((pool_options, options))
}

#[cfg(all(feature = "mysql", not(feature = "sqlite")))]
fn pool_options(config: &ConnectionConfig) -> Result<(PoolOptions<Db>, ConnectOptions)> {
    let pool_options = PoolOptions::new().max_connections(config.max_connections.max(1));
    Ok((pool_options, mysql_options(config)?))
}

#[cfg(all(feature = "mysql", not(feature = "sqlite")))]
fn mysql_options(config: &ConnectionConfig) -> Result<ConnectOptions> {
    use std::str::FromStr;

    if let Some(url) = &config.url {
        return ConnectOptions::from_str(url).map_err(StoreError::from_connect);
    }

    let mut options = ConnectOptions::new();
    if let Some(path) = &config.config_file {
        let client = ClientOptions::read(path)?;
        if let Some(socket) = &client.socket {
            options = options.socket(socket);
        }
        if let Some(host) = &client.host {
            options = options.host(host);
        }
        if let Some(port) = client.port {
            options = options.port(port);
        }
        if let Some(user) = &client.user {
            options = options.username(user);
        }
        if let Some(password) = &client.password {
            options = options.password(password);
        }
        if let Some(database) = &client.database {
            options = options.database(database);
        }
    } else {
        options = options
            .host(config.host.as_deref().unwrap_or("localhost"))
            .port(config.port);
        if let Some(user) = &config.user {
            options = options.username(user);
        }
        if let Some(password) = &config.password {
            options = options.password(password);
        }
    }

    // An explicitly configured database wins over the option file's.
    if let Some(database) = &config.database {
        options = options.database(database);
    }
    Ok(options)
}

#[cfg(feature = "sqlite")]
fn is_mysql_url(url: &str) -> bool {
    url.starts_with("mysql:") || url.starts_with("mariadb:")
}

/// The `[client]` section of a MySQL option file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub socket: Option<PathBuf>,
    pub database: Option<String>,
}

impl ClientOptions {
    /// Read an option file.
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            let msg = format!("cannot read option file {}: {}", path.display(), e);
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                StoreError::PermissionDenied(msg)
            } else {
                StoreError::ConnectionFailed(msg)
            }
        })?;
        Ok(Self::parse(&content))
    }

    /// Parse option file text.
    ///
    /// Only `key = value` lines of the `[client]` group are used. Include
    /// directives, flag-only options and unknown keys are skipped and logged.
    pub fn parse(content: &str) -> Self {
        let mut options = Self::default();
        let mut in_client = false;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('!') {
                debug!(directive = line, "Option file directive not followed");
                continue;
            }
            if let Some(group) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                in_client = group.trim().eq_ignore_ascii_case("client");
                continue;
            }
            if !in_client {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                debug!(option = line, "Ignoring flag option in [client]");
                continue;
            };
            let key = key.trim().replace('-', "_").to_ascii_lowercase();
            let value = unquote(value.trim()).to_string();

            match key.as_str() {
                "host" => options.host = Some(value),
                "port" => options.port = value.parse().ok(),
                "user" => options.user = Some(value),
                "password" => options.password = Some(value),
                "socket" => options.socket = Some(PathBuf::from(value)),
                "database" => options.database = Some(value),
                other => debug!(key = other, "Ignoring [client] option"),
            }
        }

        options
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value.strip_prefix(quote).and_then(|v| v.strip_suffix(quote)) {
            return inner;
        }
    }
    value
}
