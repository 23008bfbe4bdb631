//! Persistence layer.
//!
//! Store traits the schedulers depend on, an in-memory implementation,
//! credential encryption, and inventory seeding.

pub mod encryption;
pub mod inventory;
pub mod memory;
pub mod store;

pub use encryption::KeyManager;
pub use inventory::{Inventory, SeedSummary};
pub use memory::MemoryStore;
pub use store::{
    ConcurrencyStore, DrTestStore, FleetStore, RestoreStore, ScheduleStore, ValidationStore,
    VerificationStore,
};
