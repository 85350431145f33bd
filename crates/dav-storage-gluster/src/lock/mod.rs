mod kv_lock;

pub use kv_lock::KvLockTable;
