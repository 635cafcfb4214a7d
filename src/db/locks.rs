//! Distributed mutual exclusion on Postgres advisory locks.
//!
//! A lock is named by an arbitrary string, hashed to a two-integer key, and
//! held on a dedicated connection checked out from the primary pool for the
//! body's full duration. Because pooled sessions are reused, release is
//! explicit: the happy path unlocks, and any path that cannot confirm the
//! unlock detaches the connection so a lock-holding session never returns to
//! the pool. Immediate-mode contention ([`PgClientError::LockBusy`]) is
//! routine and logged at debug level only; every other failure on the lock
//! path is logged before it propagates.

use crate::db::lock_key::{LockKey, derive_lock_key};
use crate::db::proxy::TrackedQuery;
use crate::error::{PgClientError, PgResult};
use sqlx::pool::PoolConnection;
use sqlx::{Connection as _, Postgres};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};

const LOCK_SQL: &str = "SELECT pg_advisory_lock($1, $2)";
const TRY_LOCK_SQL: &str = "SELECT pg_try_advisory_lock($1, $2)";
const UNLOCK_SQL: &str = "SELECT pg_advisory_unlock($1, $2)";

/// Options for [`TrackedQuery::with_advisory_lock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LockOptions {
    /// Fail fast with [`PgClientError::LockBusy`] instead of waiting.
    pub immediate: bool,
}

/// Per-invocation state passed to a lock body. `retry_count` is 0 on the
/// first attempt and increments once per consumed retry delay, so bodies can
/// distinguish first-try success from retried success.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockAttempt {
    pub retry_count: u32,
}

/// Dedicated connection holding (or about to hold) an advisory lock.
///
/// Exactly one of [`surrender`](HeldLock::surrender) (nothing acquired, the
/// clean connection returns to the pool), [`discard`](HeldLock::discard)
/// (session state unknown, detach and close) or
/// [`release`](HeldLock::release) (unlock, then return) runs per exit path;
/// `Drop` backstops panics by detaching.
struct HeldLock {
    conn: Option<PoolConnection<Postgres>>,
    key: LockKey,
}

impl HeldLock {
    async fn acquire_blocking(&mut self) -> Result<(), sqlx::Error> {
        if let Some(conn) = self.conn.as_mut() {
            sqlx::query(LOCK_SQL)
                .bind(self.key.class)
                .bind(self.key.object)
                .execute(&mut **conn)
                .await?;
        }
        Ok(())
    }

    async fn try_acquire(&mut self) -> Result<bool, sqlx::Error> {
        match self.conn.as_mut() {
            Some(conn) => {
                sqlx::query_scalar::<_, bool>(TRY_LOCK_SQL)
                    .bind(self.key.class)
                    .bind(self.key.object)
                    .fetch_one(&mut **conn)
                    .await
            }
            None => Ok(false),
        }
    }

    /// Return the connection to the pool without unlocking. Only valid when
    /// nothing was acquired (an immediate miss).
    fn surrender(mut self) {
        self.conn = None;
    }

    /// Detach and close the connection without unlocking, for paths where
    /// the session state is unknown.
    fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }

    /// Unlock and return the connection to the pool. If the unlock cannot be
    /// confirmed the connection is detached instead.
    async fn release(mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        match sqlx::query_scalar::<_, bool>(UNLOCK_SQL)
            .bind(self.key.class)
            .bind(self.key.object)
            .fetch_one(&mut *conn)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(key = %self.key, "Advisory unlock reported no lock held"),
            Err(err) => {
                warn!(key = %self.key, error = %err, "Advisory unlock failed - discarding connection");
                let pg = conn.detach();
                tokio::spawn(async move {
                    let _ = pg.close().await;
                });
            }
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(key = %self.key, "Lock connection dropped without release - discarding");
            drop(conn.detach());
        }
    }
}

impl TrackedQuery {
    /// Run `body` while holding the advisory lock named `key`.
    ///
    /// Blocking mode waits indefinitely for the lock (bounded waiting is
    /// [`try_advisory_lock`](TrackedQuery::try_advisory_lock)'s job);
    /// immediate mode fails fast with [`PgClientError::LockBusy`] without
    /// invoking `body`. The lock is unique across processes contending on
    /// the same key, and concurrent in-process callers serialize because
    /// each acquisition holds a dedicated connection until `body` completes.
    pub async fn with_advisory_lock<T, F, Fut>(
        &self,
        key: &str,
        body: F,
        opts: LockOptions,
    ) -> PgResult<T>
    where
        F: FnOnce(LockAttempt) -> Fut,
        Fut: Future<Output = PgResult<T>>,
    {
        self.advisory_lock_attempt(key, body, opts, LockAttempt::default())
            .await
    }

    /// Immediate-mode acquisition with a retry schedule.
    ///
    /// One attempt per delay entry plus the initial attempt, waiting the
    /// next delay after each busy miss; `body` sees the accumulated
    /// `retry_count`. Exhausting the schedule surfaces the final
    /// [`PgClientError::LockBusy`]; any other error propagates immediately.
    pub async fn try_advisory_lock<T, F, Fut>(
        &self,
        key: &str,
        mut body: F,
        delays: &[Duration],
    ) -> PgResult<T>
    where
        F: FnMut(LockAttempt) -> Fut,
        Fut: Future<Output = PgResult<T>>,
    {
        let mut retry_count = 0u32;
        let mut remaining = delays.iter();
        loop {
            let attempt = LockAttempt { retry_count };
            match self
                .advisory_lock_attempt(key, &mut body, LockOptions { immediate: true }, attempt)
                .await
            {
                Ok(value) => return Ok(value),
                Err(err) if err.is_lock_busy() => match remaining.next() {
                    Some(delay) => {
                        debug!(
                            key,
                            retry = retry_count,
                            delay_ms = delay.as_millis() as u64,
                            "Advisory lock busy - retrying after delay"
                        );
                        sleep(*delay).await;
                        retry_count += 1;
                    }
                    None => return Err(err),
                },
                Err(err) => return Err(err),
            }
        }
    }

    async fn advisory_lock_attempt<T, F, Fut>(
        &self,
        key: &str,
        body: F,
        opts: LockOptions,
        attempt: LockAttempt,
    ) -> PgResult<T>
    where
        F: FnOnce(LockAttempt) -> Fut,
        Fut: Future<Output = PgResult<T>>,
    {
        let lock_key = derive_lock_key(key);
        debug!(
            operation = %self.context().name(),
            key,
            lock_key = %lock_key,
            immediate = opts.immediate,
            retry = attempt.retry_count,
            "Acquiring advisory lock"
        );

        let conn = match self.core().router.primary().acquire().await {
            Ok(conn) => conn,
            Err(err) => {
                error!(key, error = %err, "Failed to obtain dedicated lock connection");
                return Err(self.lock_driver_error(err));
            }
        };
        let mut held = HeldLock {
            conn: Some(conn),
            key: lock_key,
        };

        if opts.immediate {
            match held.try_acquire().await {
                Ok(true) => {}
                Ok(false) => {
                    // Routine contention: hand the clean connection back and
                    // report busy without error logging.
                    held.surrender();
                    debug!(key, "Advisory lock busy");
                    return Err(PgClientError::lock_busy(key));
                }
                Err(err) => {
                    error!(key, error = %err, "Advisory try-lock failed");
                    held.discard();
                    return Err(self.lock_driver_error(err));
                }
            }
        } else if let Err(err) = held.acquire_blocking().await {
            error!(key, error = %err, "Advisory lock acquisition failed");
            held.discard();
            return Err(self.lock_driver_error(err));
        }

        let result = body(attempt).await;
        if let Err(err) = &result {
            warn!(
                operation = %self.context().name(),
                key,
                error = %err,
                "Advisory lock body failed"
            );
        }
        held.release().await;
        result
    }

    fn lock_driver_error(&self, source: sqlx::Error) -> PgClientError {
        PgClientError::driver(
            format!("{}/advisory_lock", self.context().name()),
            self.call_site(),
            source,
        )
    }
}
