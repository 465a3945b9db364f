//! Offline-first synchronization with the remote endpoint.

pub mod backoff;
pub mod engine;
pub mod remote;

pub use backoff::BackoffPolicy;
pub use engine::{SyncEngine, SyncReport, SyncSettings, SyncState};
pub use remote::{HttpRemoteEndpoint, RemoteEndpoint, IDEMPOTENCY_HEADER};
