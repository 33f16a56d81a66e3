//! Fixed, immutable-after-construction parameters of one endpoint of a ring.

use std::time::Duration;

pub use ffado_mq::Blocking;

/// Which side created the shared region and owns its teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

/// Outward: this endpoint writes into the shared region. Inward: it reads.
/// The peer endpoint always runs the mirror-image direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outward,
    Inward,
}

/// Construction parameters for one [`crate::RingBuffer`] endpoint.
#[derive(Debug, Clone)]
pub struct RingConfig {
    pub name: String,
    pub role: Role,
    pub direction: Direction,
    pub blocking: Blocking,
    pub slots: u32,
    pub block_size: u32,
    /// Queue depth used for both `ping` and `pong`. Defaults to the
    /// reference value; tests shrink this to reproduce fill conditions
    /// deterministically without needing many in-flight messages.
    pub max_messages: i64,
    pub max_message_size: i64,
    /// Default send/receive timeout applied to both queues.
    pub queue_timeout: Duration,
}

impl RingConfig {
    pub fn new(name: impl Into<String>, role: Role, direction: Direction, blocking: Blocking, slots: u32, block_size: u32) -> Self {
        Self {
            name: name.into(),
            role,
            direction,
            blocking,
            slots,
            block_size,
            max_messages: ffado_mq::DEFAULT_MAX_MESSAGES,
            max_message_size: ffado_mq::DEFAULT_MAX_MESSAGE_SIZE,
            queue_timeout: ffado_mq::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_queue_capacity(mut self, max_messages: i64, max_message_size: i64) -> Self {
        self.max_messages = max_messages;
        self.max_message_size = max_message_size;
        self
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    pub(crate) fn mem_name(&self) -> String {
        format!("/dev/shm/{}:mem", self.name)
    }

    pub(crate) fn ping_name(&self) -> String {
        format!("{}:ping", self.name)
    }

    pub(crate) fn pong_name(&self) -> String {
        format!("{}:pong", self.name)
    }
}
