//! Routing between the primary pool and an optional read-only replica pool.

use sqlx::PgPool;

/// Which pool a call should run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PoolChoice {
    Primary,
    Replica,
}

/// Selects a pool per call. Read-intent calls go to the replica when one is
/// configured; everything else, and every lock or notify operation, uses the
/// primary. Pure selection logic; the router opens no connections itself.
#[derive(Debug, Clone)]
pub struct ConnectionRouter {
    primary: PgPool,
    replica: Option<PgPool>,
}

impl ConnectionRouter {
    pub fn new(primary: PgPool, replica: Option<PgPool>) -> Self {
        Self { primary, replica }
    }

    /// The pool for a call with the given read intent.
    pub fn route_for(&self, read_only: bool) -> &PgPool {
        match choose(read_only, self.replica.is_some()) {
            PoolChoice::Primary => &self.primary,
            PoolChoice::Replica => self
                .replica
                .as_ref()
                .unwrap_or(&self.primary),
        }
    }

    /// The primary pool. Advisory locks and NOTIFY are writer-side concerns
    /// and never route to the replica.
    pub fn primary(&self) -> &PgPool {
        &self.primary
    }

    pub fn has_replica(&self) -> bool {
        self.replica.is_some()
    }
}

pub(crate) fn choose(read_only: bool, has_replica: bool) -> PoolChoice {
    if read_only && has_replica {
        PoolChoice::Replica
    } else {
        PoolChoice::Primary
    }
}
