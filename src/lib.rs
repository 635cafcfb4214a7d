//! Instrumented PostgreSQL client layer.
//!
//! This library turns a pooled Postgres connection into an observable,
//! lock-coordinating, pub/sub-capable handle:
//!
//! - [`PgClient`] owns the pool lifecycle and mints [`TrackedQuery`] proxies
//!   that emit typed lifecycle events around every driver call.
//! - Advisory-lock coordination provides distributed mutual exclusion with
//!   blocking, immediate and retry-with-schedule acquisition.
//! - A LISTEN/NOTIFY bridge dispatches JSON payloads from a dedicated
//!   listening connection and publishes with a single statement.
//!
//! ```no_run
//! use pg_tracking_client::{OperationContext, PgClient, PgClientConfig, PoolRegistry};
//! use std::sync::Arc;
//!
//! # async fn demo() -> pg_tracking_client::PgResult<()> {
//! let registry = Arc::new(PoolRegistry::new());
//! let config = PgClientConfig::new("localhost", "app", "secret", "appdb");
//! let client = PgClient::new(registry, config)?;
//! client.start().await?;
//!
//! let row = client
//!     .query_with_context(OperationContext::new("healthcheck"))?
//!     .one("SELECT 1 AS one", &[])
//!     .await?;
//! # let _ = row;
//!
//! client.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod events;

pub use config::{PgClientConfig, PoolSettings, ReplicaConfig};
pub use db::{
    ConnectionRouter, ListenerBinding, ListenerState, LockAttempt, LockKey, LockOptions, PgClient,
    PoolHandle, PoolRegistry, QueryParam, TrackedQuery, derive_lock_key,
};
pub use error::{PgClientError, PgResult};
pub use events::{
    ObserverSet, OperationContext, QueryFailed, QueryFinished, QueryObserver, QueryStarted,
    Stopped,
};
