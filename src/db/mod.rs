//! Database layer.
//!
//! This module provides the tracked client surface:
//! - Client handle and shared pool registry
//! - Query proxy with lifecycle event emission
//! - Advisory-lock coordination
//! - LISTEN/NOTIFY bridging
//! - Lock-key derivation and parameter binding

pub mod client;
pub mod lock_key;
pub mod locks;
pub mod notify;
pub mod params;
pub mod proxy;
pub mod registry;
pub mod router;

pub use client::PgClient;
pub use lock_key::{LockKey, derive_lock_key};
pub use locks::{LockAttempt, LockOptions};
pub use notify::{ListenerBinding, ListenerState};
pub use params::QueryParam;
pub use proxy::{BoxedDbFuture, TrackedQuery};
pub use registry::{PoolHandle, PoolRegistry};
pub use router::ConnectionRouter;
