//! In-process backends.
//!
//! Used by tests and by single-process runs with `DATABASE_URL=memory://`.
//! They honor the same contracts as the Postgres backends: visibility
//! timeouts on the queue, per-shard ordering and closure on the stream, and
//! change events for every table write.

mod queue;
mod stream;
mod table;

pub use queue::MemoryQueue;
pub use stream::MemoryStream;
pub use table::MemoryTable;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
