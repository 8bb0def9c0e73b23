use thiserror::Error;

/// The typed failure slot of the pool's `get` callback.
///
/// This enum is the only error type that crosses the pool/controller
/// boundary; the controller maps each variant to a client-facing response.
/// `get` itself never fails synchronously — every failure arrives through
/// the callback.
#[derive(Debug, Clone, Error)]
pub enum GetError {
    /// The group's request queue is full, or the waiter timed out in it.
    #[error("request queue is full or the request timed out in it")]
    RequestQueueFull,

    /// The worker process failed to start.
    #[error("the application process failed to start: {summary}")]
    SpawnFailed {
        /// Spawner-assigned failure category, e.g. `INTERNAL_ERROR`.
        category: String,
        /// One-line summary safe for logs.
        summary: String,
        /// Detailed report shown only when friendly error pages are on.
        details: Option<String>,
    },

    /// The pool is at full capacity and no process was eligible for
    /// eviction.
    #[error("the pool is at full capacity")]
    PoolAtFullCapacity,

    /// The pool or group is shutting down and no longer takes requests.
    #[error("the application pool is shutting down")]
    ShuttingDown,
}

/// Authorization failure for administrative pool operations.
#[derive(Debug, Clone, Error)]
#[error("operation unauthorized")]
pub struct SecurityError;
