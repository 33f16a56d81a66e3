//! The inter-process streaming ring buffer: one shared-memory region of
//! fixed-size slots, a pair of message queues carrying flow-control
//! messages, and the sequence accounting that keeps a producer and a
//! consumer in two different processes agreeing on who owns which slot.
//!
//! Grounded on the teacher's `lithos-icc` crate for overall shape (a single
//! struct composing a mapped region, queues and reservation locks, built by
//! one `create`-style and one `open`-style constructor), generalised from
//! its lock-free single-writer seqlock protocol to a mutex- and
//! message-queue-acknowledged one, since lock-freedom is explicitly out of
//! scope here.

pub mod config;
pub mod error;

pub use config::{Blocking, Direction, Role, RingConfig};
pub use error::RingError;

use error::map_outcome;
use ffado_mq::{Message, MessageKind, MessageQueue, Outcome};
use ffado_mutex::ScopedMutex;
use ffado_shm::{Access, SharedMemory};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

fn queue_directions(direction: Direction) -> (ffado_mq::Direction, ffado_mq::Direction) {
    match direction {
        Direction::Outward => (ffado_mq::Direction::ReadWrite, ffado_mq::Direction::ReadOnly),
        Direction::Inward => (ffado_mq::Direction::ReadOnly, ffado_mq::Direction::ReadWrite),
    }
}

/// One endpoint of an IPC ring buffer. Always constructed behind an `Arc`:
/// the producer-side notification handler needs a weak reference back to
/// `self` to process `pong` arrivals from its own private thread.
pub struct RingBuffer {
    /// Immutable construction parameters: name, role, direction, blocking
    /// mode, slot count and block size.
    config: RingConfig,
    /// The `N * B`-byte shared region backing every slot.
    memory: SharedMemory,
    /// Carries `DataWritten` from the writing end to the reading end.
    ping: Arc<MessageQueue>,
    /// Carries `DataAck` from the reading end back to the writing end.
    pong: Arc<MessageQueue>,

    /// Producer: next slot to write. Consumer: next slot expected.
    next_slot: AtomicU32,
    /// Producer: next sequence number to emit. Consumer: next sequence expected.
    idx: AtomicU32,
    /// Producer only: most recent slot the consumer has acknowledged.
    last_ack_slot: AtomicU32,
    /// Producer only: most recent sequence number the consumer has acknowledged.
    last_ack_idx: AtomicU32,

    /// Held by a writer for the lifetime of one [`WriteReservation`].
    write_reservation: ScopedMutex,
    /// Held by a reader for the lifetime of one [`ReadReservation`].
    read_reservation: ScopedMutex,

    /// Guards `activity_cv`; carries no state of its own.
    activity_lock: Mutex<()>,
    /// Signalled by the `pong` notification handler so a producer blocked in
    /// `reserve_write` on a full ring can wake and recheck `buffer_fill`.
    activity_cv: Condvar,

    /// Serialises the `pong` notification handler against `Drop`, so the
    /// handler never runs concurrently with teardown.
    access: Mutex<()>,
    /// Cleared before teardown so a notification handler racing the
    /// destructor can observe the ring is going down.
    initialized: AtomicBool,
}

impl RingBuffer {
    /// Builds the configured endpoint: a master creates the shared region
    /// and both queues; a slave opens them. Installs and arms the `pong`
    /// notification handler for an outward (writing) endpoint, or drains
    /// `ping` for an inward (reading) one, discarding anything left over
    /// from a previous run.
    pub fn new(config: RingConfig) -> Result<Arc<Self>, RingError> {
        let region_size = config.slots as u64 * config.block_size as u64;
        let (ping_dir, pong_dir) = queue_directions(config.direction);

        let (mut memory, ping, pong) = match config.role {
            Role::Master => {
                let memory = SharedMemory::create(config.mem_name(), region_size, Access::ReadWrite)?;
                let ping = MessageQueue::create_with_capacity(
                    &config.ping_name(),
                    ping_dir,
                    config.blocking,
                    config.queue_timeout,
                    config.max_messages,
                    config.max_message_size,
                )
                .map_err(RingError::Mq)?;
                let pong = MessageQueue::create_with_capacity(
                    &config.pong_name(),
                    pong_dir,
                    config.blocking,
                    config.queue_timeout,
                    config.max_messages,
                    config.max_message_size,
                )
                .map_err(RingError::Mq)?;
                (memory, ping, pong)
            }
            Role::Slave => {
                let mem_access = if config.direction == Direction::Outward {
                    Access::ReadWrite
                } else {
                    Access::ReadOnly
                };
                let memory = SharedMemory::open(config.mem_name(), mem_access)?;
                let ping = MessageQueue::open(&config.ping_name(), ping_dir, config.blocking)
                    .map_err(RingError::Mq)?;
                let pong = MessageQueue::open(&config.pong_name(), pong_dir, config.blocking)
                    .map_err(RingError::Mq)?;
                (memory, ping, pong)
            }
        };
        memory.lock_in_memory(true)?;

        tracing::info!(
            name = %config.name,
            role = ?config.role,
            direction = ?config.direction,
            slots = config.slots,
            block_size = config.block_size,
            "ring buffer endpoint initialised"
        );

        let ring = Arc::new(Self {
            next_slot: AtomicU32::new(0),
            idx: AtomicU32::new(0),
            last_ack_slot: AtomicU32::new(config.slots - 1),
            last_ack_idx: AtomicU32::new(u32::MAX),
            write_reservation: ScopedMutex::new(),
            read_reservation: ScopedMutex::new(),
            activity_lock: Mutex::new(()),
            activity_cv: Condvar::new(),
            access: Mutex::new(()),
            initialized: AtomicBool::new(false),
            config,
            memory,
            ping: Arc::new(ping),
            pong: Arc::new(pong),
        });

        if ring.config.direction == Direction::Outward {
            let weak: Weak<RingBuffer> = Arc::downgrade(&ring);
            ring.pong
                .set_notification_handler(move || {
                    if let Some(ring) = weak.upgrade() {
                        ring.handle_pong_notification();
                    }
                })
                .map_err(RingError::Mq)?;
            ring.pong.arm_notification().map_err(RingError::Mq)?;
            ring.pong.drain().map_err(RingError::Mq)?;
        } else {
            ring.ping.drain().map_err(RingError::Mq)?;
        }

        ring.initialized.store(true, Ordering::Release);
        Ok(ring)
    }

    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    /// Injects raw, unencoded bytes onto `ping`, bypassing the wire encoder.
    /// Exists for protocol-conformance tests that simulate an adversary
    /// writing a malformed header directly to the queue; an outward/master
    /// endpoint already holds `ping` read-write to drain stale messages on
    /// construction, so this reuses that same handle.
    pub fn inject_raw_ping(&self, bytes: &[u8]) -> Outcome<()> {
        self.ping.send_raw(bytes)
    }

    /// Producer-side occupancy: how many written-but-unacknowledged slots
    /// currently separate `next_slot` from `last_ack_slot`.
    pub fn buffer_fill(&self) -> u32 {
        let next = self.next_slot.load(Ordering::Relaxed) as i64;
        let acked = self.last_ack_slot.load(Ordering::Relaxed) as i64;
        let n = self.config.slots as i64;
        (next - acked - 1).rem_euclid(n) as u32
    }

    /// Diagnostic snapshot of the last `(slot, seq)` this endpoint has
    /// recorded as acknowledged. Racy with respect to the notification
    /// thread by design, like `ScopedMutex::is_locked`.
    pub fn last_ack(&self) -> (u32, u32) {
        (
            self.last_ack_slot.load(Ordering::Relaxed),
            self.last_ack_idx.load(Ordering::Relaxed),
        )
    }

    /// Re-arms the `pong` notifier, then drains every currently available
    /// ack. Re-arming before draining is the ordering that guarantees no
    /// wake-up is lost: any ack that lands between the previous drain and
    /// this call's re-arm either gets swept up here or triggers another call.
    fn handle_pong_notification(&self) {
        let _access = self.access.lock().unwrap();
        if !self.initialized.load(Ordering::Acquire) {
            return;
        }
        if let Err(source) = self.pong.arm_notification() {
            tracing::error!(name = %self.config.name, error = %source, "failed to re-arm pong notification");
        }
        loop {
            if !self.pong.can_receive() {
                break;
            }
            match self.pong.receive() {
                Outcome::Ok(msg) => self.apply_ack(msg),
                Outcome::Again | Outcome::Timeout => break,
                Outcome::Error(source) => {
                    tracing::error!(name = %self.config.name, error = %source, "failed reading pong queue");
                    break;
                }
            }
        }
    }

    fn apply_ack(&self, msg: Message) {
        if msg.kind != MessageKind::DataAck {
            tracing::error!(name = %self.config.name, kind = ?msg.kind, "unexpected message kind on pong queue");
            return;
        }
        let expected_slot = (self.last_ack_slot.load(Ordering::Relaxed) + 1) % self.config.slots;
        let expected_seq = self.last_ack_idx.load(Ordering::Relaxed).wrapping_add(1);
        if msg.slot != expected_slot {
            tracing::warn!(name = %self.config.name, got = msg.slot, expected = expected_slot, "unexpected acknowledged slot");
        }
        if msg.seq != expected_seq {
            tracing::warn!(name = %self.config.name, got = msg.seq, expected = expected_seq, "unexpected acknowledged sequence");
        }
        self.last_ack_slot.store(msg.slot, Ordering::Relaxed);
        self.last_ack_idx.store(msg.seq, Ordering::Relaxed);
        if self.config.blocking == Blocking::Blocking {
            let _guard = self.activity_lock.lock().unwrap();
            self.activity_cv.notify_one();
        }
    }

    /// Begins a zero-copy write: blocks (in blocking mode) or fails with
    /// [`RingError::Again`] (in non-blocking mode) if the ring is full.
    /// Returns a guard granting mutable access to the reserved slot; the
    /// guard must be consumed with [`WriteReservation::commit`] to publish
    /// the write, or dropped to abandon it and release the reservation.
    pub fn reserve_write(&self) -> Result<WriteReservation<'_>, RingError> {
        if self.config.direction != Direction::Outward {
            return Err(RingError::WrongDirection(
                "cannot write to an inward-facing ring",
            ));
        }
        if !self.write_reservation.try_lock() {
            return Err(RingError::AlreadyReserved);
        }

        if self.config.blocking == Blocking::Blocking {
            let mut guard = self.activity_lock.lock().unwrap();
            while self.buffer_fill() >= self.config.slots {
                tracing::debug!(name = %self.config.name, "ring full, waiting for an ack");
                guard = self.activity_cv.wait(guard).unwrap();
            }
        } else if self.buffer_fill() >= self.config.slots || !self.ping.can_send() {
            let _ = self.write_reservation.unlock();
            return Err(RingError::Again);
        }

        let next_slot = self.next_slot.load(Ordering::Relaxed);
        let last_ack = self.last_ack_slot.load(Ordering::Relaxed);
        if next_slot == last_ack {
            tracing::warn!(name = %self.config.name, slot = next_slot, "overwriting a never-acknowledged slot");
            self.last_ack_slot
                .store((last_ack + 1) % self.config.slots, Ordering::Relaxed);
        }

        let offset = next_slot as usize * self.config.block_size as usize;
        let block = match self.memory.block_mut(offset, self.config.block_size as usize) {
            Ok(block) => block,
            Err(source) => {
                let _ = self.write_reservation.unlock();
                return Err(RingError::from(source));
            }
        };

        Ok(WriteReservation {
            ring: self,
            slot: next_slot,
            block,
            committed: false,
        })
    }

    /// Convenience combining [`RingBuffer::reserve_write`], a bulk copy of
    /// `buf`, and [`WriteReservation::commit`].
    pub fn write(&self, buf: &[u8]) -> Result<(), RingError> {
        let mut reservation = self.reserve_write()?;
        reservation.block_mut().copy_from_slice(buf);
        reservation.commit()
    }

    /// Begins a zero-copy read: dequeues one `DataWritten` message and
    /// returns a guard granting a read-only view of the named slot. The
    /// guard must be consumed with [`ReadReservation::commit`] to send the
    /// acknowledgement, or dropped to abandon it (no ack is sent).
    pub fn reserve_read(&self) -> Result<ReadReservation<'_>, RingError> {
        if self.config.direction != Direction::Inward {
            return Err(RingError::WrongDirection(
                "cannot read from an outward-facing ring",
            ));
        }
        if !self.read_reservation.try_lock() {
            return Err(RingError::AlreadyReserved);
        }

        let msg = match map_outcome(self.ping.receive()) {
            Ok(msg) => msg,
            Err(e) => {
                let _ = self.read_reservation.unlock();
                return Err(e);
            }
        };

        if msg.kind != MessageKind::DataWritten {
            let _ = self.read_reservation.unlock();
            return Err(RingError::Protocol(format!(
                "expected a DataWritten message, got {:?}",
                msg.kind
            )));
        }

        let expected_slot = self.next_slot.load(Ordering::Relaxed);
        let expected_seq = self.idx.load(Ordering::Relaxed);
        if msg.slot != expected_slot {
            tracing::warn!(name = %self.config.name, got = msg.slot, expected = expected_slot, "unexpected written slot");
        }
        if msg.seq != expected_seq {
            tracing::warn!(name = %self.config.name, got = msg.seq, expected = expected_seq, "unexpected written sequence");
        }

        let offset = msg.slot as usize * self.config.block_size as usize;
        let block = match self.memory.block(offset, self.config.block_size as usize) {
            Ok(block) => block,
            Err(source) => {
                let _ = self.read_reservation.unlock();
                return Err(RingError::from(source));
            }
        };

        Ok(ReadReservation {
            ring: self,
            slot: msg.slot,
            seq: msg.seq,
            block,
            committed: false,
        })
    }

    /// Convenience combining [`RingBuffer::reserve_read`], a bulk copy into
    /// `buf`, and [`ReadReservation::commit`].
    pub fn read(&self, buf: &mut [u8]) -> Result<(), RingError> {
        let reservation = self.reserve_read()?;
        buf.copy_from_slice(reservation.block());
        reservation.commit()
    }

    /// Drains both queues and resets all sequence counters to their initial
    /// (empty) state. Used by upper layers after detecting a stuck peer.
    pub fn reset(&self) -> Result<(), RingError> {
        let _access = self.access.lock().unwrap();
        self.ping.drain().map_err(RingError::Mq)?;
        self.pong.drain().map_err(RingError::Mq)?;
        self.next_slot.store(0, Ordering::Relaxed);
        self.idx.store(0, Ordering::Relaxed);
        self.last_ack_slot
            .store(self.config.slots - 1, Ordering::Relaxed);
        self.last_ack_idx.store(u32::MAX, Ordering::Relaxed);
        tracing::info!(name = %self.config.name, "ring buffer reset");
        Ok(())
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        if self.config.direction == Direction::Outward {
            let _ = self.pong.disarm_notification();
        }
        let _access = self.access.lock().unwrap();
        self.initialized.store(false, Ordering::Release);
        if self.config.role == Role::Master {
            let _ = SharedMemory::unlink(self.config.mem_name());
        }
        tracing::debug!(name = %self.config.name, "ring buffer endpoint torn down");
    }
}

/// A held write reservation: `block_mut` grants access to the reserved
/// slot's bytes, `commit` publishes them and releases the reservation.
/// Dropping without committing abandons the write and releases the
/// reservation without sending anything.
pub struct WriteReservation<'a> {
    ring: &'a RingBuffer,
    slot: u32,
    block: &'a mut [u8],
    committed: bool,
}

impl<'a> WriteReservation<'a> {
    pub fn block_mut(&mut self) -> &mut [u8] {
        self.block
    }

    pub fn commit(mut self) -> Result<(), RingError> {
        self.committed = true;
        let seq = self.ring.idx.load(Ordering::Relaxed);
        let outcome = self.ring.ping.send(&Message::data_written(self.slot, seq));
        let result = match outcome {
            Outcome::Ok(()) => {
                let next = (self.slot + 1) % self.ring.config.slots;
                self.ring.next_slot.store(next, Ordering::Relaxed);
                self.ring.idx.store(seq.wrapping_add(1), Ordering::Relaxed);
                Ok(())
            }
            Outcome::Again => Err(RingError::Protocol(
                "ping send returned Again despite a prior capacity check".into(),
            )),
            Outcome::Timeout => Err(RingError::Timeout),
            Outcome::Error(source) => Err(RingError::Mq(source)),
        };
        let _ = self.ring.write_reservation.unlock();
        result
    }
}

impl Drop for WriteReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.ring.write_reservation.unlock();
        }
    }
}

/// A held read reservation: `block` grants read access to the received
/// slot's bytes, `commit` sends the acknowledgement and releases the
/// reservation. Dropping without committing releases the reservation
/// without acknowledging (the producer will eventually overwrite the slot).
pub struct ReadReservation<'a> {
    ring: &'a RingBuffer,
    slot: u32,
    seq: u32,
    block: &'a [u8],
    committed: bool,
}

impl<'a> ReadReservation<'a> {
    pub fn block(&self) -> &[u8] {
        self.block
    }

    pub fn commit(mut self) -> Result<(), RingError> {
        self.committed = true;
        let outcome = self.ring.pong.send(&Message::data_ack(self.slot, self.seq));
        let result = match outcome {
            Outcome::Ok(()) => {
                let next = (self.slot + 1) % self.ring.config.slots;
                self.ring.next_slot.store(next, Ordering::Relaxed);
                self.ring
                    .idx
                    .store(self.seq.wrapping_add(1), Ordering::Relaxed);
                Ok(())
            }
            Outcome::Again => Err(RingError::Again),
            Outcome::Timeout => Err(RingError::Timeout),
            Outcome::Error(source) => Err(RingError::Mq(source)),
        };
        let _ = self.ring.read_reservation.unlock();
        result
    }
}

impl Drop for ReadReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.ring.read_reservation.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("ffado_ring_libtest_{tag}_{ts}")
    }

    #[test]
    fn new_endpoint_starts_empty() {
        let name = unique_name("empty");
        let ring = RingBuffer::new(RingConfig::new(
            name,
            Role::Master,
            Direction::Outward,
            Blocking::NonBlocking,
            4,
            8,
        ))
        .unwrap();
        assert_eq!(ring.buffer_fill(), 0);
        assert_eq!(ring.last_ack(), (3, u32::MAX));
    }

    #[test]
    fn writing_to_an_inward_ring_is_rejected() {
        let name = unique_name("wrongdir_write");
        let ring = RingBuffer::new(RingConfig::new(
            name,
            Role::Master,
            Direction::Inward,
            Blocking::NonBlocking,
            4,
            8,
        ))
        .unwrap();
        assert!(matches!(
            ring.reserve_write(),
            Err(RingError::WrongDirection(_))
        ));
    }

    #[test]
    fn reading_from_an_outward_ring_is_rejected() {
        let name = unique_name("wrongdir_read");
        let ring = RingBuffer::new(RingConfig::new(
            name,
            Role::Master,
            Direction::Outward,
            Blocking::NonBlocking,
            4,
            8,
        ))
        .unwrap();
        assert!(matches!(
            ring.reserve_read(),
            Err(RingError::WrongDirection(_))
        ));
    }

    #[test]
    fn a_second_concurrent_write_reservation_is_rejected() {
        let name = unique_name("doublereserve");
        let ring = RingBuffer::new(RingConfig::new(
            name,
            Role::Master,
            Direction::Outward,
            Blocking::NonBlocking,
            4,
            8,
        ))
        .unwrap();
        let first = ring.reserve_write().unwrap();
        assert!(matches!(
            ring.reserve_write(),
            Err(RingError::AlreadyReserved)
        ));
        drop(first);
        assert!(ring.reserve_write().is_ok());
    }

    #[test]
    fn reset_restores_the_initial_empty_state() {
        let name = unique_name("reset");
        let ring = RingBuffer::new(RingConfig::new(
            name,
            Role::Master,
            Direction::Outward,
            Blocking::NonBlocking,
            4,
            8,
        ))
        .unwrap();
        ring.write(b"12345678").unwrap();
        ring.reset().unwrap();
        assert_eq!(ring.buffer_fill(), 0);
        assert_eq!(ring.last_ack(), (3, u32::MAX));
    }
}
