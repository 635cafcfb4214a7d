//! LISTEN/NOTIFY bridge.
//!
//! A listener holds a dedicated connection (`PgListener`) for the life of the
//! owning client handle and dispatches JSON payloads to its callback. The
//! binding moves `Connecting -> Listening -> Closed`; `Closed` is entered
//! exactly once, on client stop or on connection failure, and is terminal —
//! a new listener is an independent binding. Publishing is a single
//! `pg_notify` statement on the primary pool.

use crate::db::params::{QueryParam, build_query};
use crate::db::proxy::TrackedQuery;
use crate::error::{PgClientError, PgResult};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgListener;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

const STATE_CONNECTING: u8 = 0;
const STATE_LISTENING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Lifecycle state of a listener binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Connecting,
    Listening,
    Closed,
}

/// The live tuple (dedicated connection, channel, callback), owned by the
/// client handle that created it and torn down exactly once on stop.
pub struct ListenerBinding {
    id: Uuid,
    channel: String,
    state: AtomicU8,
    shutdown: watch::Sender<bool>,
}

impl ListenerBinding {
    fn new(channel: String) -> (Arc<Self>, watch::Receiver<bool>) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        (
            Arc::new(Self {
                id: Uuid::new_v4(),
                channel,
                state: AtomicU8::new(STATE_CONNECTING),
                shutdown,
            }),
            shutdown_rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn state(&self) -> ListenerState {
        match self.state.load(Ordering::Acquire) {
            STATE_CONNECTING => ListenerState::Connecting,
            STATE_LISTENING => ListenerState::Listening,
            _ => ListenerState::Closed,
        }
    }

    fn mark_listening(&self) {
        let _ = self.state.compare_exchange(
            STATE_CONNECTING,
            STATE_LISTENING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Transition to `Closed`. Idempotent; only the first call signals the
    /// receive loop to shut down.
    pub(crate) fn close(&self) {
        let previous = self.state.swap(STATE_CLOSED, Ordering::AcqRel);
        if previous != STATE_CLOSED {
            info!(listener = %self.id, channel = %self.channel, "Closing notification listener");
            let _ = self.shutdown.send(true);
        }
    }
}

impl std::fmt::Debug for ListenerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerBinding")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("state", &self.state())
            .finish()
    }
}

/// Live listener bindings of one client handle.
#[derive(Debug, Default)]
pub(crate) struct ListenerRegistry {
    bindings: Mutex<Vec<Arc<ListenerBinding>>>,
}

impl ListenerRegistry {
    pub(crate) fn register(&self, binding: Arc<ListenerBinding>) {
        self.guarded(|bindings| bindings.push(binding));
    }

    /// Close every registered binding. Called once from client stop; a
    /// binding already closed by a failed connection stays closed.
    pub(crate) fn close_all(&self) {
        let mut drained = Vec::new();
        self.guarded(|bindings| drained.append(bindings));
        for binding in drained {
            binding.close();
        }
    }

    pub(crate) fn count(&self) -> usize {
        let mut count = 0;
        self.guarded(|bindings| count = bindings.len());
        count
    }

    fn guarded(&self, f: impl FnOnce(&mut Vec<Arc<ListenerBinding>>)) {
        let mut bindings = self
            .bindings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut bindings);
    }
}

/// Check a channel name against `[A-Za-z0-9_]+` before any network call.
pub(crate) fn validate_channel(channel: &str) -> PgResult<()> {
    let valid = !channel.is_empty()
        && channel
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(PgClientError::validation(format!(
            "invalid notification channel '{channel}': expected [A-Za-z0-9_]+"
        )));
    }
    Ok(())
}

fn dispatch(channel: &str, payload: &str, callback: &(dyn Fn(JsonValue) + Send + Sync)) {
    let value: JsonValue = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(err) => {
            error!(channel, error = %err, "Discarding notification with non-JSON payload");
            return;
        }
    };
    if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
        error!(channel, "Notification callback panicked - listener continues");
    }
}

impl TrackedQuery {
    /// Subscribe to a channel on a dedicated listening connection and invoke
    /// `callback` with each JSON payload received.
    ///
    /// The binding lives until the owning client stops (or the connection
    /// fails); callback panics and malformed payloads are logged and skipped
    /// without breaking the listener.
    pub async fn create_notification_listener<F>(&self, channel: &str, callback: F) -> PgResult<()>
    where
        F: Fn(JsonValue) + Send + Sync + 'static,
    {
        validate_channel(channel)?;

        let (binding, mut shutdown_rx) = ListenerBinding::new(channel.to_string());
        let statement = format!("LISTEN {channel}");
        let listener = self
            .observe("listen", &statement, |_| None, async {
                // Dedicated, non-multiplexed connection; the channel name is
                // passed as an identifier, not interpolated into SQL.
                let mut listener = PgListener::connect_with(self.core().router.primary()).await?;
                listener.listen(channel).await?;
                Ok(listener)
            })
            .await?;

        self.core().listeners.register(Arc::clone(&binding));
        binding.mark_listening();

        let callback: Arc<dyn Fn(JsonValue) + Send + Sync> = Arc::new(callback);
        let channel_name = channel.to_string();
        let loop_binding = Arc::clone(&binding);
        tokio::spawn(async move {
            let mut listener = listener;
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    received = listener.recv() => match received {
                        Ok(notification) => {
                            if loop_binding.state() != ListenerState::Listening {
                                break;
                            }
                            if notification.channel() != channel_name {
                                continue;
                            }
                            dispatch(&channel_name, notification.payload(), callback.as_ref());
                        }
                        Err(err) => {
                            error!(
                                channel = %channel_name,
                                error = %err,
                                "Notification listener connection failed"
                            );
                            break;
                        }
                    }
                }
            }
            loop_binding.close();
            debug!(listener = %loop_binding.id(), channel = %channel_name, "Notification listener terminated");
            // The PgListener drops here, closing its dedicated connection.
        });

        Ok(())
    }

    /// Publish a JSON payload on a channel. A single statement on the
    /// primary pool; no dedicated connection is held.
    pub async fn notify_listeners(&self, channel: &str, payload: &JsonValue) -> PgResult<()> {
        validate_channel(channel)?;
        let body = serde_json::to_string(payload).map_err(|err| {
            PgClientError::validation(format!("notification payload is not serializable: {err}"))
        })?;

        let statement = "SELECT pg_notify($1, $2)";
        let params = [
            QueryParam::String(channel.to_string()),
            QueryParam::String(body),
        ];
        self.observe("notify", statement, |_| None, async {
            build_query(statement, &params)
                .execute(self.core().router.primary())
                .await?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::client::ClientCore;
    use crate::db::router::ConnectionRouter;
    use crate::events::{ObserverSet, OperationContext};
    use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
    use std::panic::Location;

    #[test]
    fn test_channel_validation() {
        for valid in ["events", "Events_2024", "a", "_", "X9_"] {
            assert!(validate_channel(valid).is_ok(), "{valid} should be valid");
        }
        for invalid in ["", "has-dash", "has space", "semi;colon", "quo\"te", "日本"] {
            assert!(
                matches!(
                    validate_channel(invalid),
                    Err(PgClientError::Validation { .. })
                ),
                "{invalid} should be rejected"
            );
        }
    }

    #[test]
    fn test_binding_state_machine() {
        let (binding, _rx) = ListenerBinding::new("events".to_string());
        assert_eq!(binding.state(), ListenerState::Connecting);
        binding.mark_listening();
        assert_eq!(binding.state(), ListenerState::Listening);
        binding.close();
        assert_eq!(binding.state(), ListenerState::Closed);
        // Closed is terminal and idempotent.
        binding.close();
        binding.mark_listening();
        assert_eq!(binding.state(), ListenerState::Closed);
    }

    #[test]
    fn test_registry_close_all() {
        let registry = ListenerRegistry::default();
        let (first, _rx1) = ListenerBinding::new("a".to_string());
        let (second, _rx2) = ListenerBinding::new("b".to_string());
        first.mark_listening();
        second.mark_listening();
        registry.register(Arc::clone(&first));
        registry.register(Arc::clone(&second));
        assert_eq!(registry.count(), 2);

        registry.close_all();
        assert_eq!(registry.count(), 0);
        assert_eq!(first.state(), ListenerState::Closed);
        assert_eq!(second.state(), ListenerState::Closed);
    }

    fn unreachable_proxy() -> TrackedQuery {
        let options = PgConnectOptions::new().host("127.0.0.1").port(1);
        let pool = PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_secs(2))
            .connect_lazy_with(options);
        let core = Arc::new(ClientCore {
            router: ConnectionRouter::new(pool, None),
            observers: Arc::new(ObserverSet::new()),
            listeners: ListenerRegistry::default(),
        });
        TrackedQuery::new(core, OperationContext::new("unit"), Location::caller())
    }

    #[tokio::test]
    async fn test_invalid_channel_rejected_before_io() {
        // The pool points at a closed port: a Validation error (not a Driver
        // error) proves rejection happened before any network call.
        let proxy = unreachable_proxy();
        let err = proxy
            .notify_listeners("bad-channel", &serde_json::json!({ "n": 1 }))
            .await
            .expect_err("channel name is invalid");
        assert!(matches!(err, PgClientError::Validation { .. }));

        let err = proxy
            .create_notification_listener("bad channel", |_payload| {})
            .await
            .expect_err("channel name is invalid");
        assert!(matches!(err, PgClientError::Validation { .. }));
    }

    #[test]
    fn test_dispatch_isolates_bad_payload_and_panic() {
        let delivered = std::sync::Mutex::new(Vec::new());
        dispatch("events", "not json", &|value| {
            delivered.lock().unwrap().push(value);
        });
        assert!(delivered.lock().unwrap().is_empty());

        dispatch("events", "{\"ok\":true}", &|_value| {
            panic!("callback bug");
        });
        // Reaching this line means the panic did not escape.

        dispatch("events", "{\"ok\":true}", &|value| {
            delivered.lock().unwrap().push(value);
        });
        assert_eq!(delivered.lock().unwrap().len(), 1);
    }
}
