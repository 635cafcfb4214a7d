//! The tracked query proxy.
//!
//! A [`TrackedQuery`] wraps one logical operation (context + name) and runs
//! driver calls against the routed pool, emitting [`QueryStarted`] before and
//! [`QueryFinished`]/[`QueryFailed`] after every call. Errors are never
//! swallowed: the driver error propagates, augmented with the operation name
//! and the call site where the proxy was minted.

use crate::db::client::ClientCore;
use crate::db::params::{QueryParam, build_query};
use crate::error::{PgClientError, PgResult};
use crate::events::{OperationContext, QueryFailed, QueryFinished, QueryStarted};
use chrono::Utc;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgQueryResult, PgRow};
use sqlx::{Postgres, Transaction};
use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Boxed future type for transaction and task bodies.
pub type BoxedDbFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T, sqlx::Error>> + Send + 'c>>;

/// A query proxy bound to one operation context.
///
/// Minted by [`PgClient::query_with_context`](crate::db::PgClient::query_with_context).
/// Reconfiguration is by value: [`read_only`](TrackedQuery::read_only)
/// returns a new proxy rather than mutating shared state.
#[derive(Clone)]
pub struct TrackedQuery {
    core: Arc<ClientCore>,
    context: OperationContext,
    read_only: bool,
    call_site: &'static Location<'static>,
}

impl TrackedQuery {
    pub(crate) fn new(
        core: Arc<ClientCore>,
        context: OperationContext,
        call_site: &'static Location<'static>,
    ) -> Self {
        Self {
            core,
            context,
            read_only: false,
            call_site,
        }
    }

    pub(crate) fn core(&self) -> &Arc<ClientCore> {
        &self.core
    }

    pub(crate) fn call_site(&self) -> &'static Location<'static> {
        self.call_site
    }

    pub fn context(&self) -> &OperationContext {
        &self.context
    }

    /// Route read-intent calls to the replica pool (when one is configured).
    /// Consumes and returns the proxy; pass `false` to opt back out.
    pub fn read_only(self, flag: bool) -> Self {
        Self {
            read_only: flag,
            ..self
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Fetch exactly one row. Zero rows is a driver error.
    pub async fn one(&self, sql: &str, params: &[QueryParam]) -> PgResult<PgRow> {
        let pool = self.core.router.route_for(self.read_only);
        self.observe(
            "one",
            sql,
            |_| Some(1),
            build_query(sql, params).fetch_one(pool),
        )
        .await
    }

    /// Fetch at most one row.
    pub async fn one_or_none(&self, sql: &str, params: &[QueryParam]) -> PgResult<Option<PgRow>> {
        let pool = self.core.router.route_for(self.read_only);
        self.observe(
            "one_or_none",
            sql,
            |row: &Option<PgRow>| Some(row.is_some() as u64),
            build_query(sql, params).fetch_optional(pool),
        )
        .await
    }

    /// Fetch one or more rows. Zero rows is a driver error.
    pub async fn many(&self, sql: &str, params: &[QueryParam]) -> PgResult<Vec<PgRow>> {
        let pool = self.core.router.route_for(self.read_only);
        self.observe(
            "many",
            sql,
            |rows: &Vec<PgRow>| Some(rows.len() as u64),
            async {
                let rows = build_query(sql, params).fetch_all(pool).await?;
                if rows.is_empty() {
                    return Err(sqlx::Error::RowNotFound);
                }
                Ok(rows)
            },
        )
        .await
    }

    /// Fetch zero or more rows.
    pub async fn any(&self, sql: &str, params: &[QueryParam]) -> PgResult<Vec<PgRow>> {
        let pool = self.core.router.route_for(self.read_only);
        self.observe(
            "any",
            sql,
            |rows: &Vec<PgRow>| Some(rows.len() as u64),
            build_query(sql, params).fetch_all(pool),
        )
        .await
    }

    /// Execute a statement expected to return no data.
    pub async fn none(&self, sql: &str, params: &[QueryParam]) -> PgResult<()> {
        let pool = self.core.router.route_for(self.read_only);
        self.observe("none", sql, |_| None, async {
            build_query(sql, params).execute(pool).await?;
            Ok(())
        })
        .await
    }

    /// Execute a statement and return the driver's result summary.
    pub async fn result(&self, sql: &str, params: &[QueryParam]) -> PgResult<PgQueryResult> {
        let pool = self.core.router.route_for(self.read_only);
        self.observe(
            "result",
            sql,
            |result: &PgQueryResult| Some(result.rows_affected()),
            build_query(sql, params).execute(pool),
        )
        .await
    }

    /// Check out a dedicated connection from the routed pool. The caller
    /// owns it exclusively until it is dropped back into the pool.
    pub async fn connect(&self) -> PgResult<PoolConnection<Postgres>> {
        let pool = self.core.router.route_for(self.read_only);
        self.observe("connect", "(dedicated connection)", |_| None, pool.acquire())
            .await
    }

    /// Run a body inside a transaction: commit on success, roll back on
    /// error. The body's error propagates after rollback.
    pub async fn tx<T, F>(&self, body: F) -> PgResult<T>
    where
        F: for<'c> FnOnce(&'c mut Transaction<'static, Postgres>) -> BoxedDbFuture<'c, T>,
    {
        let pool = self.core.router.route_for(self.read_only);
        self.observe("tx", "(transaction)", |_| None, async move {
            let mut tx = pool.begin().await?;
            match body(&mut tx).await {
                Ok(value) => {
                    tx.commit().await?;
                    Ok(value)
                }
                Err(error) => {
                    let _ = tx.rollback().await;
                    Err(error)
                }
            }
        })
        .await
    }

    /// Run a body on one dedicated connection, without a transaction.
    pub async fn task<T, F>(&self, body: F) -> PgResult<T>
    where
        F: for<'c> FnOnce(&'c mut PoolConnection<Postgres>) -> BoxedDbFuture<'c, T>,
    {
        let pool = self.core.router.route_for(self.read_only);
        self.observe("task", "(task)", |_| None, async move {
            let mut conn = pool.acquire().await?;
            body(&mut conn).await
        })
        .await
    }

    /// Tracked execution envelope: emit started, await the driver call, emit
    /// finished or failed, and augment any error with operation + call site.
    pub(crate) async fn observe<T, Fut>(
        &self,
        method: &'static str,
        statement: &str,
        rows: fn(&T) -> Option<u64>,
        fut: Fut,
    ) -> PgResult<T>
    where
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let clock = Instant::now();
        self.core.observers.emit_started(&QueryStarted {
            context: self.context.clone(),
            method,
            statement: statement.to_string(),
            started_at: Utc::now(),
        });
        debug!(operation = %self.context.name(), method, "Executing tracked call");

        match fut.await {
            Ok(value) => {
                self.core.observers.emit_finished(&QueryFinished {
                    context: self.context.clone(),
                    method,
                    statement: statement.to_string(),
                    rows: rows(&value),
                    elapsed: clock.elapsed(),
                });
                Ok(value)
            }
            Err(error) => {
                self.core.observers.emit_failed(&QueryFailed {
                    context: self.context.clone(),
                    method,
                    statement: statement.to_string(),
                    error: error.to_string(),
                    elapsed: clock.elapsed(),
                });
                Err(PgClientError::driver(
                    format!("{}/{}", self.context.name(), method),
                    self.call_site,
                    error,
                ))
            }
        }
    }
}

impl std::fmt::Debug for TrackedQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedQuery")
            .field("operation", &self.context.name())
            .field("read_only", &self.read_only)
            .field("call_site", &format_args!("{}", self.call_site))
            .finish()
    }
}
