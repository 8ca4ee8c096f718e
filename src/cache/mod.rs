//! Caching layer
//!
//! TTL-bounded caches used to avoid querying (possibly remote) branches on
//! every operation, and the index of deletion markers built on top of them.

mod deletion;
mod timed;

pub use deletion::{load_markers, DeletionIndex, EntryState};
pub use timed::{CacheEntry, Clock, ManualClock, MonotonicClock, TimedCache};
