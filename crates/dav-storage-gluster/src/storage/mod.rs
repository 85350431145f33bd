mod gluster;

pub use gluster::{GlusterBackend, GlusterFile};
