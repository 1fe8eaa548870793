//! Epoch-based protection for lock-free page reclamation.

pub mod manager;

pub use manager::{get_thread_id, try_get_thread_id, EpochGuard, EpochManager};
