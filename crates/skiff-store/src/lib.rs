pub mod error;
pub mod memory;
pub mod migrations;
pub mod redb_store;
pub mod state;
pub mod store;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use redb_store::RedbStore;
pub use state::{canonical_hash, StoredTargetState};
pub use store::DeviceStore;
