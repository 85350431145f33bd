mod local;

pub use local::{LocalBackend, LocalFile};
