//! Consumer engine: queue worker pool, shard consumer, and the lifecycle
//! that runs and stops them together.

pub mod backoff;
pub mod lifecycle;
pub mod pool;
pub mod shard;
pub mod shutdown;

pub use backoff::Backoff;
pub use lifecycle::{Lifecycle, LifecycleState};
pub use pool::{WorkerPool, WorkerPoolConfig};
pub use shard::{ShardConsumer, ShardConsumerConfig};
pub use shutdown::{ShutdownHandle, ShutdownListener, ShutdownReason, shutdown_channel};

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sleep unless cancelled first. Returns false if the token fired.
pub(crate) async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
