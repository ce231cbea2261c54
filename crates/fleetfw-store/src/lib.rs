pub mod error;
pub mod state;
pub mod store;
pub mod memory;
pub mod redb_store;

pub use error::StoreError;
pub use memory::InMemoryStore;
pub use redb_store::RedbStore;
pub use state::{AuditEvent, EnqueueOutcome, QueueJob};
pub use store::RunStore;
