pub mod checkpoint;
pub mod snapshot;
pub mod wal;

pub use checkpoint::Checkpoint;
pub use snapshot::SnapshotStore;
pub use wal::{WalEntry, WalStore};
