//! The process-facing client handle.
//!
//! A [`PgClient`] owns its pools' lifecycle: `start` acquires them from the
//! shared [`PoolRegistry`](crate::db::registry::PoolRegistry), `stop` closes
//! listener bindings, notifies observers and releases the registry handles.
//! Pools are shared between handles pointing at the same endpoint and closed
//! only when the last handle releases them. Query proxies are minted with
//! [`query_with_context`](PgClient::query_with_context).

use crate::config::PgClientConfig;
use crate::db::notify::ListenerRegistry;
use crate::db::proxy::TrackedQuery;
use crate::db::registry::{PoolHandle, PoolRegistry};
use crate::db::router::ConnectionRouter;
use crate::error::{PgClientError, PgResult};
use crate::events::{ObserverSet, OperationContext, QueryObserver, Stopped};
use std::panic::Location;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Shared interior of a started client, borrowed by every proxy it mints.
pub(crate) struct ClientCore {
    pub(crate) router: ConnectionRouter,
    pub(crate) observers: Arc<ObserverSet>,
    pub(crate) listeners: ListenerRegistry,
}

struct Started {
    core: Arc<ClientCore>,
    primary_handle: PoolHandle,
    replica_handle: Option<PoolHandle>,
}

/// Client handle owning the pool lifecycle and emitting process-wide
/// lifecycle events.
pub struct PgClient {
    config: PgClientConfig,
    registry: Arc<PoolRegistry>,
    observers: Arc<ObserverSet>,
    state: RwLock<Option<Started>>,
}

impl PgClient {
    /// Create a client handle. Validates the configuration; opens nothing.
    ///
    /// The registry is an explicit dependency so every handle sharing an
    /// endpoint also shares one underlying pool.
    pub fn new(registry: Arc<PoolRegistry>, config: PgClientConfig) -> PgResult<Self> {
        config.validate()?;
        info!(
            user = %config.username,
            host = %config.host,
            db = %config.database,
            "Initializing postgres client"
        );
        Ok(Self {
            config,
            registry,
            observers: Arc::new(ObserverSet::new()),
            state: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &PgClientConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.read_state(|state| state.is_some())
    }

    /// Register a lifecycle observer. May be called before `start`.
    pub fn subscribe(&self, observer: Arc<dyn QueryObserver>) {
        self.observers.subscribe(observer);
    }

    /// Acquire the primary (and optional replica) pool from the registry.
    ///
    /// Calling `start` twice without an intervening `stop` is a
    /// programming error.
    pub async fn start(&self) -> PgResult<()> {
        if self.is_started() {
            return Err(Self::already_started());
        }

        let primary_handle = self
            .registry
            .acquire(
                &self.config.registry_key(),
                self.config.primary_connect_options(),
                &self.config.pool,
            )
            .await;
        let replica_handle = match self.config.replica_endpoint() {
            Some((key, options)) => {
                Some(self.registry.acquire(&key, options, &self.config.pool).await)
            }
            None => None,
        };

        let router = ConnectionRouter::new(
            primary_handle.pool().clone(),
            replica_handle.as_ref().map(|handle| handle.pool().clone()),
        );
        let started = Started {
            core: Arc::new(ClientCore {
                router,
                observers: Arc::clone(&self.observers),
                listeners: ListenerRegistry::default(),
            }),
            primary_handle,
            replica_handle,
        };

        // Re-check after the awaits: a concurrent start may have won.
        let raced = {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if state.is_some() {
                Some(started)
            } else {
                *state = Some(started);
                None
            }
        };
        if let Some(started) = raced {
            let Started {
                primary_handle,
                replica_handle,
                ..
            } = started;
            primary_handle.release().await;
            if let Some(handle) = replica_handle {
                handle.release().await;
            }
            return Err(Self::already_started());
        }

        info!(host = %self.config.host, db = %self.config.database, "Postgres client started");
        Ok(())
    }

    /// Tear down: close listener bindings exactly once, notify observers,
    /// release the shared pools. After `stop` the handle may be started
    /// again.
    pub async fn stop(&self) -> PgResult<()> {
        let started = {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state.take()
        };
        let Some(started) = started else {
            return Err(PgClientError::lifecycle(
                "stop called while the client is not started",
            ));
        };

        let Started {
            core,
            primary_handle,
            replica_handle,
        } = started;
        core.listeners.close_all();
        self.observers.emit_stopped(&Stopped);
        primary_handle.release().await;
        if let Some(handle) = replica_handle {
            handle.release().await;
        }

        info!(host = %self.config.host, db = %self.config.database, "Postgres client stopped");
        Ok(())
    }

    /// Mint a query proxy for one logical operation.
    ///
    /// The call site recorded here is the one driver errors point back to.
    #[track_caller]
    pub fn query_with_context(&self, context: OperationContext) -> PgResult<TrackedQuery> {
        let call_site = Location::caller();
        self.read_state(|state| match state {
            Some(started) => Ok(TrackedQuery::new(
                Arc::clone(&started.core),
                context,
                call_site,
            )),
            None => Err(PgClientError::lifecycle(
                "query_with_context called while the client is not started",
            )),
        })
    }

    /// Number of live listener bindings on this handle.
    pub fn listener_count(&self) -> usize {
        self.read_state(|state| {
            state
                .as_ref()
                .map(|started| started.core.listeners.count())
                .unwrap_or(0)
        })
    }

    fn read_state<R>(&self, f: impl FnOnce(&Option<Started>) -> R) -> R {
        let state = self
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&state)
    }

    fn already_started() -> PgClientError {
        PgClientError::lifecycle("start called while the client is already started")
    }
}

impl std::fmt::Debug for PgClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgClient")
            .field("config", &self.config)
            .field("started", &self.is_started())
            .finish()
    }
}
