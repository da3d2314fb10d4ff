//! A peer-to-peer synchronization engine for replicated tables: a Hybrid
//! Logical Clock for cross-node ordering, Cristian's-algorithm clock
//! calibration, content-addressed chunking for cheap diffing, and a
//! deterministic two-phase reconciliation protocol that merges recent
//! writes and prunes historical discrepancies without tombstones.
//!
//! The engine is storage- and transport-agnostic: hosts implement
//! [`store::RecordStore`] over their own persistence layer and
//! [`transport::Transport`] over their own network stack, and drive sync
//! sessions through [`sync_scheduler::SyncScheduler`].

pub mod checkpoint;
pub mod chunking;
pub mod clock;
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod hlc;
pub mod store;
pub mod sync_scheduler;
pub mod transport;
pub mod wire;

pub use config::Config;
pub use error::{Result, SyncError};
pub use events::SyncEvent;
pub use hlc::{Clock, Hlc};
pub use sync_scheduler::SyncScheduler;
