pub mod atomic;
pub mod state_lock;

pub use atomic::write_private;
pub use state_lock::{StateLock, StateLockGuard};
