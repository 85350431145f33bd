mod manager;
mod memory;
mod traits;

pub use manager::{Gate, GateEntry, GateMode, LockManager};
pub use memory::MemoryLockTable;
pub use traits::{LockAcquireResult, LockTable};
