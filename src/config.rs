//! Configuration for the tracking client.
//!
//! A [`PgClientConfig`] names the primary endpoint, optionally a read-only
//! replica endpoint sharing the same credentials, and pool settings. The
//! config is validated before any pool is created, and its `Debug` rendering
//! redacts the password.

use crate::error::{PgClientError, PgResult};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 5432;

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Connection pool settings shared by the primary and replica pools.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PoolSettings {
    /// Maximum connections in pool (default: 10)
    pub max_connections: Option<u32>,
    /// Minimum connections in pool (default: 1)
    pub min_connections: Option<u32>,
    /// Connection acquire timeout in seconds (default: 30)
    pub acquire_timeout_secs: Option<u64>,
}

impl PoolSettings {
    /// Get max_connections with default value.
    pub fn max_connections_or_default(&self) -> u32 {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    /// Get min_connections with default value.
    pub fn min_connections_or_default(&self) -> u32 {
        self.min_connections.unwrap_or(DEFAULT_MIN_CONNECTIONS)
    }

    /// Get acquire_timeout with default value.
    pub fn acquire_timeout_or_default(&self) -> u64 {
        self.acquire_timeout_secs
            .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS)
    }

    /// Validate pool settings.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.max_connections {
            if max == 0 {
                return Err("max_connections must be greater than 0".to_string());
            }
        }
        if let Some(min) = self.min_connections {
            if let Some(max) = self.max_connections {
                if min > max {
                    return Err(format!(
                        "min_connections ({}) cannot exceed max_connections ({})",
                        min, max
                    ));
                }
            }
        }
        Ok(())
    }

    /// Build sqlx pool options from these settings.
    ///
    /// Pools are created lazily; no connection is opened here.
    pub(crate) fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections_or_default())
            .min_connections(self.min_connections_or_default())
            .acquire_timeout(Duration::from_secs(self.acquire_timeout_or_default()))
    }
}

/// A read-only replica endpoint. Credentials and database are shared with
/// the primary; only the host differs.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub host: String,
    pub port: Option<u16>,
}

/// Configuration for a [`PgClient`](crate::db::PgClient).
#[derive(Clone)]
pub struct PgClientConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: String,
    /// May be empty; never logged.
    pub password: String,
    pub database: String,
    pub application_name: Option<String>,
    /// Optional read-only replica endpoint. Read-intent queries route here.
    pub replica: Option<ReplicaConfig>,
    pub pool: PoolSettings,
}

impl PgClientConfig {
    /// Create a configuration for a single primary endpoint with defaults.
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: None,
            username: username.into(),
            password: password.into(),
            database: database.into(),
            application_name: None,
            replica: None,
            pool: PoolSettings::default(),
        }
    }

    /// Add a read-only replica endpoint.
    pub fn with_replica(mut self, host: impl Into<String>, port: Option<u16>) -> Self {
        self.replica = Some(ReplicaConfig {
            host: host.into(),
            port,
        });
        self
    }

    /// Set the application name reported to the server.
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Set pool settings.
    pub fn with_pool(mut self, pool: PoolSettings) -> Self {
        self.pool = pool;
        self
    }

    /// Validate the configuration. Rejects missing mandatory fields before
    /// any pool exists. An empty password is accepted.
    pub fn validate(&self) -> PgResult<()> {
        if self.host.is_empty() {
            return Err(PgClientError::validation("missing hostname setting"));
        }
        if self.username.is_empty() {
            return Err(PgClientError::validation("missing username setting"));
        }
        if self.database.is_empty() {
            return Err(PgClientError::validation("missing database setting"));
        }
        if let Some(replica) = &self.replica {
            if replica.host.is_empty() {
                return Err(PgClientError::validation("replica hostname is empty"));
            }
        }
        self.pool.validate().map_err(PgClientError::validation)
    }

    /// Connect options for the primary endpoint.
    pub fn primary_connect_options(&self) -> PgConnectOptions {
        self.connect_options(&self.host, self.port)
    }

    /// The primary endpoint's replica, if configured, as connect options
    /// paired with its registry key.
    pub fn replica_endpoint(&self) -> Option<(String, PgConnectOptions)> {
        self.replica.as_ref().map(|replica| {
            (
                endpoint_key(&self.username, &replica.host, replica.port, &self.database),
                self.connect_options(&replica.host, replica.port),
            )
        })
    }

    /// Password-free identity of the primary endpoint, used by the pool
    /// registry to share pools between client handles.
    pub fn registry_key(&self) -> String {
        endpoint_key(&self.username, &self.host, self.port, &self.database)
    }

    fn connect_options(&self, host: &str, port: Option<u16>) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(host)
            .port(port.unwrap_or(DEFAULT_PORT))
            .username(&self.username)
            .password(&self.password)
            .database(&self.database);
        if let Some(name) = &self.application_name {
            options = options.application_name(name);
        }
        options
    }
}

fn endpoint_key(username: &str, host: &str, port: Option<u16>, database: &str) -> String {
    format!(
        "postgres://{}@{}:{}/{}",
        username,
        host,
        port.unwrap_or(DEFAULT_PORT),
        database
    )
}

impl std::fmt::Debug for PgClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgClientConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("application_name", &self.application_name)
            .field("replica", &self.replica)
            .field("pool", &self.pool)
            .finish()
    }
}
