//! The `Again`/`Timeout`/`Error` taxonomy the whole ring API returns through.

#[derive(Debug, thiserror::Error)]
pub enum RingError {
    /// Non-blocking mode only: no room to write, or nothing to read, right now.
    #[error("no room or no data available right now")]
    Again,

    /// Blocking mode only: the underlying queue's default timeout elapsed.
    #[error("timed out waiting for the peer")]
    Timeout,

    /// The caller tried to hold two reservations of the same kind at once.
    #[error("a reservation of this kind is already held")]
    AlreadyReserved,

    /// This endpoint's direction does not support the attempted operation.
    #[error("{0}")]
    WrongDirection(&'static str),

    /// The peer or the queue layer did something the protocol guarantees
    /// should be impossible (e.g. a send the caller just verified had room
    /// for came back `Again`). Always a bug, never routine backpressure.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("shared memory access failed")]
    Shm(#[source] ffado_shm::ShmError),

    #[error("message queue access failed")]
    Mq(#[source] ffado_mq::MqError),

    #[error("mutex misuse")]
    Mutex(#[source] ffado_mutex::MutexError),
}

impl From<ffado_shm::ShmError> for RingError {
    fn from(source: ffado_shm::ShmError) -> Self {
        RingError::Shm(source)
    }
}

impl From<ffado_mutex::MutexError> for RingError {
    fn from(source: ffado_mutex::MutexError) -> Self {
        RingError::Mutex(source)
    }
}

/// Maps a queue [`ffado_mq::Outcome`] onto the ring's own taxonomy. `Again`
/// and `Timeout` pass through unchanged; anything else becomes a fatal error.
pub(crate) fn map_outcome<T>(outcome: ffado_mq::Outcome<T>) -> Result<T, RingError> {
    match outcome {
        ffado_mq::Outcome::Ok(value) => Ok(value),
        ffado_mq::Outcome::Again => Err(RingError::Again),
        ffado_mq::Outcome::Timeout => Err(RingError::Timeout),
        ffado_mq::Outcome::Error(source) => Err(RingError::Mq(source)),
    }
}
