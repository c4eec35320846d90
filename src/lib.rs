//! Offline-resilient data layer for the spots client.
//!
//! Reads go through a two-tier query cache (memory, then durable storage)
//! with stale-while-revalidate semantics. Writes made while offline are
//! queued durably and replayed in order once connectivity returns. A
//! background orchestrator ties the two together on a timer and on every
//! reconnect.

pub mod backend;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod network;
pub mod query;
pub mod queue;
pub mod retry;
pub mod sync;

pub use error::SyncError;
pub use network::{NetworkMonitor, NetworkStatus};
pub use query::{Query, QueryClient, QueryOptions, QueryResult};
pub use queue::{MutationExecutor, MutationKind, MutationQueue, OfflineMutation};
pub use sync::{SyncDataSource, SyncOrchestrator};
