//! A named, bounded POSIX message queue carrying the fixed [`wire::Message`]
//! record, with an edge-triggered one-shot notification path layered on top.
//!
//! Grounded on the teacher's habit of wrapping a single external resource
//! (`lithos-mmap`'s file-backed mapping) behind a small struct with explicit
//! `create`/`open`/`close`, generalised here to the POSIX message-queue
//! syscalls via the `nix` crate — the teacher repo has no queue code of its
//! own, so the shape of `ffado-shm` is the closer model than any one file.

pub mod notify;
pub mod wire;

pub use wire::{Message, MessageKind, Wire, WireError};

use nix::mqueue::{mq_close, mq_getattr, mq_open, mq_unlink, MQ_OFlag, MqAttr, MqdT};
use nix::sys::stat::Mode;
use std::ffi::CString;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Reference queue depth, per the external-interface bounds.
pub const DEFAULT_MAX_MESSAGES: i64 = 10;
/// Reference maximum message size, per the external-interface bounds.
pub const DEFAULT_MAX_MESSAGE_SIZE: i64 = 1024;
/// Upper bound on the buffer `receive` reads into; must cover the largest
/// `max_message_size` any caller configures.
const RECEIVE_BUFFER_LEN: usize = 1024;

/// Default per-queue send/receive timeout, matching the reference value.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Direction {
    fn oflag(self) -> MQ_OFlag {
        match self {
            Direction::ReadOnly => MQ_OFlag::O_RDONLY,
            Direction::WriteOnly => MQ_OFlag::O_WRONLY,
            Direction::ReadWrite => MQ_OFlag::O_RDWR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocking {
    Blocking,
    NonBlocking,
}

#[derive(Debug, thiserror::Error)]
pub enum MqError {
    #[error("message queue '{name}' already exists")]
    AlreadyExists { name: String },
    #[error("message queue '{name}' not found")]
    NotFound { name: String },
    #[error("message queue '{name}' is closed")]
    Closed { name: String },
    #[error("a notification handler is already installed on '{name}'")]
    HandlerAlreadyInstalled { name: String },
    #[error("no notification handler installed on '{name}'")]
    NoHandler { name: String },
    #[error("failed to {action} message queue '{name}'")]
    Queue {
        name: String,
        action: &'static str,
        #[source]
        source: nix::Error,
    },
    #[error("invalid message received on queue '{name}'")]
    Wire {
        name: String,
        #[source]
        source: WireError,
    },
}

/// Outcome of a timed send/receive, matching the spec's non-fatal/fatal split:
/// `Again`/`Timeout` are routine, `Error` is not.
#[derive(Debug)]
pub enum Outcome<T> {
    Ok(T),
    Again,
    Timeout,
    Error(MqError),
}

type Handler = Arc<dyn Fn() + Send + Sync + 'static>;

/// One end of a named POSIX message queue.
pub struct MessageQueue {
    name: String,
    direction: Direction,
    blocking: Blocking,
    owner: bool,
    timeout: Duration,
    mqd: Option<MqdT>,
    handler: Mutex<Option<Handler>>,
    armed_token: Mutex<Option<usize>>,
}

fn queue_path(name: &str) -> CString {
    CString::new(format!("/{name}")).expect("queue name must not contain NUL bytes")
}

impl MessageQueue {
    /// Creates a new queue, failing with [`MqError::AlreadyExists`] if the
    /// name is already in use.
    pub fn create(name: &str, direction: Direction, blocking: Blocking) -> Result<Self, MqError> {
        Self::create_with_timeout(name, direction, blocking, DEFAULT_TIMEOUT)
    }

    pub fn create_with_timeout(
        name: &str,
        direction: Direction,
        blocking: Blocking,
        timeout: Duration,
    ) -> Result<Self, MqError> {
        Self::create_with_capacity(
            name,
            direction,
            blocking,
            timeout,
            DEFAULT_MAX_MESSAGES,
            DEFAULT_MAX_MESSAGE_SIZE,
        )
    }

    /// Like [`MessageQueue::create_with_timeout`], but with an explicit queue
    /// depth and per-message size cap instead of the reference defaults.
    /// Exists so integration tests can reproduce fill conditions (e.g. a
    /// queue that saturates after three sends) without waiting on the
    /// reference depth of ten.
    pub fn create_with_capacity(
        name: &str,
        direction: Direction,
        blocking: Blocking,
        timeout: Duration,
        max_messages: i64,
        max_message_size: i64,
    ) -> Result<Self, MqError> {
        let path = queue_path(name);
        let mut oflag = MQ_OFlag::O_CREAT | MQ_OFlag::O_EXCL | direction.oflag();
        if blocking == Blocking::NonBlocking {
            oflag |= MQ_OFlag::O_NONBLOCK;
        }
        let attr = MqAttr::new(0, max_messages, max_message_size, 0);
        let mode = Mode::S_IRUSR | Mode::S_IWUSR;
        let mqd = mq_open(path.as_c_str(), oflag, mode, Some(&attr)).map_err(|source| {
            if source == nix::Error::EEXIST {
                MqError::AlreadyExists {
                    name: name.to_string(),
                }
            } else {
                MqError::Queue {
                    name: name.to_string(),
                    action: "create",
                    source,
                }
            }
        })?;
        tracing::info!(name, ?direction, ?blocking, "created message queue");
        Ok(Self::from_parts(name, direction, blocking, true, timeout, mqd))
    }

    /// Opens an existing queue, failing with [`MqError::NotFound`] if absent.
    pub fn open(name: &str, direction: Direction, blocking: Blocking) -> Result<Self, MqError> {
        Self::open_with_timeout(name, direction, blocking, DEFAULT_TIMEOUT)
    }

    pub fn open_with_timeout(
        name: &str,
        direction: Direction,
        blocking: Blocking,
        timeout: Duration,
    ) -> Result<Self, MqError> {
        let path = queue_path(name);
        let mut oflag = direction.oflag();
        if blocking == Blocking::NonBlocking {
            oflag |= MQ_OFlag::O_NONBLOCK;
        }
        let mqd = mq_open(path.as_c_str(), oflag, Mode::empty(), None).map_err(|source| {
            if source == nix::Error::ENOENT {
                MqError::NotFound {
                    name: name.to_string(),
                }
            } else {
                MqError::Queue {
                    name: name.to_string(),
                    action: "open",
                    source,
                }
            }
        })?;
        tracing::debug!(name, ?direction, ?blocking, "opened message queue");
        Ok(Self::from_parts(name, direction, blocking, false, timeout, mqd))
    }

    fn from_parts(
        name: &str,
        direction: Direction,
        blocking: Blocking,
        owner: bool,
        timeout: Duration,
        mqd: MqdT,
    ) -> Self {
        Self {
            name: name.to_string(),
            direction,
            blocking,
            owner,
            timeout,
            mqd: Some(mqd),
            handler: Mutex::new(None),
            armed_token: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn blocking(&self) -> Blocking {
        self.blocking
    }

    /// Closes the queue descriptor. Idempotent; if this end created the
    /// queue, also unlinks the name so a future `create` can reuse it.
    pub fn close(&mut self) -> Result<(), MqError> {
        let Some(mqd) = self.mqd.take() else {
            return Ok(());
        };
        if let Some(token) = self.armed_token.lock().unwrap().take() {
            let _ = unsafe { libc::mq_notify(mqd.as_raw_fd(), std::ptr::null()) };
            notify::unregister(token);
        }
        mq_close(mqd).map_err(|source| MqError::Queue {
            name: self.name.clone(),
            action: "close",
            source,
        })?;
        if self.owner {
            let path = queue_path(&self.name);
            let _ = mq_unlink(path.as_c_str());
        }
        tracing::debug!(name = %self.name, "closed message queue");
        Ok(())
    }

    /// Sends `msg`, honouring this queue's blocking mode and timeout.
    pub fn send(&self, msg: &Message) -> Outcome<()> {
        let Some(mqd) = self.mqd.as_ref() else {
            return Outcome::Error(MqError::Closed {
                name: self.name.clone(),
            });
        };
        let bytes = msg.encode();
        match raw::timedsend(mqd.as_raw_fd(), &bytes, self.timeout) {
            Ok(()) => Outcome::Ok(()),
            Err(nix::Error::EAGAIN) => Outcome::Again,
            Err(nix::Error::ETIMEDOUT) => Outcome::Timeout,
            Err(source) => Outcome::Error(MqError::Queue {
                name: self.name.clone(),
                action: "send",
                source,
            }),
        }
    }

    /// Sends raw, unencoded bytes, bypassing [`Wire::encode`]. Exists for
    /// protocol-conformance tests that need to inject a malformed header
    /// (bad magic/version) onto the wire; routine callers should use
    /// [`MessageQueue::send`].
    pub fn send_raw(&self, bytes: &[u8]) -> Outcome<()> {
        let Some(mqd) = self.mqd.as_ref() else {
            return Outcome::Error(MqError::Closed {
                name: self.name.clone(),
            });
        };
        match raw::timedsend(mqd.as_raw_fd(), bytes, self.timeout) {
            Ok(()) => Outcome::Ok(()),
            Err(nix::Error::EAGAIN) => Outcome::Again,
            Err(nix::Error::ETIMEDOUT) => Outcome::Timeout,
            Err(source) => Outcome::Error(MqError::Queue {
                name: self.name.clone(),
                action: "send",
                source,
            }),
        }
    }

    /// Receives one message, honouring this queue's blocking mode and timeout.
    pub fn receive(&self) -> Outcome<Message> {
        let Some(mqd) = self.mqd.as_ref() else {
            return Outcome::Error(MqError::Closed {
                name: self.name.clone(),
            });
        };
        let mut buf = [0u8; RECEIVE_BUFFER_LEN];
        match raw::timedreceive(mqd.as_raw_fd(), &mut buf, self.timeout) {
            Ok(len) => match Message::decode(&buf[..len]) {
                Ok(msg) => Outcome::Ok(msg),
                Err(source) => Outcome::Error(MqError::Wire {
                    name: self.name.clone(),
                    source,
                }),
            },
            Err(nix::Error::EAGAIN) => Outcome::Again,
            Err(nix::Error::ETIMEDOUT) => Outcome::Timeout,
            Err(source) => Outcome::Error(MqError::Queue {
                name: self.name.clone(),
                action: "receive",
                source,
            }),
        }
    }

    fn attr(&self) -> Option<MqAttr> {
        self.mqd.as_ref().and_then(|mqd| mq_getattr(mqd).ok())
    }

    /// Snapshot hint: was there room for a send just now? Racy by nature.
    pub fn can_send(&self) -> bool {
        self.attr().is_some_and(|a| a.mq_curmsgs() < a.mq_maxmsg())
    }

    /// Snapshot hint: was there a message to receive just now? Racy by nature.
    pub fn can_receive(&self) -> bool {
        self.attr().is_some_and(|a| a.mq_curmsgs() > 0)
    }

    /// Current queue depth via `mq_getattr`. Racy the instant it returns.
    pub fn depth(&self) -> Result<i64, MqError> {
        self.attr().map(|a| a.mq_curmsgs()).ok_or_else(|| MqError::Queue {
            name: self.name.clone(),
            action: "getattr",
            source: nix::Error::EBADF,
        })
    }

    /// Dequeues and discards every message currently queued, returning how
    /// many were dropped. Used to clear stale messages on construction.
    pub fn drain(&self) -> Result<u32, MqError> {
        let mut count = 0;
        while self.can_receive() {
            match self.receive() {
                Outcome::Ok(_) => count += 1,
                Outcome::Again | Outcome::Timeout => break,
                Outcome::Error(e) => return Err(e),
            }
        }
        if count > 0 {
            tracing::debug!(name = %self.name, count, "drained stale messages");
        }
        Ok(count)
    }

    /// Installs the callback invoked on this queue's notification thread.
    /// Only one handler may be installed at a time.
    pub fn set_notification_handler<F>(&self, handler: F) -> Result<(), MqError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut guard = self.handler.lock().unwrap();
        if guard.is_some() {
            return Err(MqError::HandlerAlreadyInstalled {
                name: self.name.clone(),
            });
        }
        *guard = Some(Arc::new(handler));
        Ok(())
    }

    /// Removes the installed handler, disarming any pending notification.
    pub fn clear_notification_handler(&self) -> Result<(), MqError> {
        let _ = self.disarm_notification();
        *self.handler.lock().unwrap() = None;
        Ok(())
    }

    /// Arms a one-shot edge-triggered wake-up: the installed handler fires
    /// exactly once, on a private thread, the next time this queue
    /// transitions from empty to non-empty. Must be re-armed after it fires.
    pub fn arm_notification(&self) -> Result<(), MqError> {
        let handler = self
            .handler
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| MqError::NoHandler {
                name: self.name.clone(),
            })?;
        let mqd = self.mqd.as_ref().ok_or_else(|| MqError::Closed {
            name: self.name.clone(),
        })?;
        let token = notify::register(Box::new(move || handler()));
        let sev = notify::sigevent_for(token);
        // SAFETY: `sev` lives for the duration of this call, which is all
        // `mq_notify` requires.
        let rc = unsafe { libc::mq_notify(mqd.as_raw_fd(), &sev) };
        if rc != 0 {
            notify::unregister(token);
            return Err(MqError::Queue {
                name: self.name.clone(),
                action: "arm notification on",
                source: nix::Error::last(),
            });
        }
        if let Some(old) = self.armed_token.lock().unwrap().replace(token) {
            notify::unregister(old);
        }
        Ok(())
    }

    /// Cancels a pending notification without firing it.
    pub fn disarm_notification(&self) -> Result<(), MqError> {
        let Some(mqd) = self.mqd.as_ref() else {
            return Ok(());
        };
        // SAFETY: a null sevp cancels any registered notification for this descriptor.
        let rc = unsafe { libc::mq_notify(mqd.as_raw_fd(), std::ptr::null()) };
        if rc != 0 {
            return Err(MqError::Queue {
                name: self.name.clone(),
                action: "disarm notification on",
                source: nix::Error::last(),
            });
        }
        if let Some(token) = self.armed_token.lock().unwrap().take() {
            notify::unregister(token);
        }
        Ok(())
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

mod raw {
    use nix::Error;
    use std::time::Duration;

    fn absolute_deadline(timeout: Duration) -> libc::timespec {
        let mut now: libc::timespec = unsafe { std::mem::zeroed() };
        // SAFETY: `now` is a valid out-param for `clock_gettime`.
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
        let mut sec = now.tv_sec + timeout.as_secs() as libc::time_t;
        let mut nsec = now.tv_nsec + timeout.subsec_nanos() as i64;
        if nsec >= 1_000_000_000 {
            nsec -= 1_000_000_000;
            sec += 1;
        }
        libc::timespec {
            tv_sec: sec,
            tv_nsec: nsec,
        }
    }

    /// `mq_timedsend` is not wrapped by `nix`; called directly via `libc`,
    /// matching the direct-libc-syscall idiom already used for `mlock` in
    /// `ffado-shm`.
    pub(crate) fn timedsend(fd: i32, bytes: &[u8], timeout: Duration) -> Result<(), Error> {
        let deadline = absolute_deadline(timeout);
        // SAFETY: `fd` is a live message-queue descriptor owned by the caller
        // for the duration of this call; `bytes` outlives the call.
        let rc = unsafe {
            libc::mq_timedsend(
                fd,
                bytes.as_ptr() as *const libc::c_char,
                bytes.len(),
                0,
                &deadline,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(Error::last())
        }
    }

    pub(crate) fn timedreceive(fd: i32, buf: &mut [u8], timeout: Duration) -> Result<usize, Error> {
        let deadline = absolute_deadline(timeout);
        let mut prio: u32 = 0;
        // SAFETY: see `timedsend`; `buf` is large enough for this queue's
        // configured maximum message size.
        let rc = unsafe {
            libc::mq_timedreceive(
                fd,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
                &mut prio,
                &deadline,
            )
        };
        if rc >= 0 {
            Ok(rc as usize)
        } else {
            Err(Error::last())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_name(tag: &str) -> String {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("ffado_mq_test_{tag}_{ts}")
    }

    #[test]
    fn send_then_receive_round_trip() {
        let name = unique_name("roundtrip");
        let q = MessageQueue::create(&name, Direction::ReadWrite, Blocking::NonBlocking).unwrap();
        let msg = Message::data_written(3, 9);
        assert!(matches!(q.send(&msg), Outcome::Ok(())));
        match q.receive() {
            Outcome::Ok(got) => assert_eq!(got, msg),
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[test]
    fn receive_on_empty_nonblocking_queue_is_again() {
        let name = unique_name("empty");
        let q = MessageQueue::create(&name, Direction::ReadWrite, Blocking::NonBlocking).unwrap();
        assert!(matches!(q.receive(), Outcome::Again));
    }

    #[test]
    fn opening_a_missing_queue_is_not_found() {
        let name = unique_name("missing");
        assert!(matches!(
            MessageQueue::open(&name, Direction::ReadOnly, Blocking::NonBlocking),
            Err(MqError::NotFound { .. })
        ));
    }

    #[test]
    fn creating_an_existing_queue_twice_fails() {
        let name = unique_name("dup");
        let _first = MessageQueue::create(&name, Direction::ReadWrite, Blocking::NonBlocking).unwrap();
        assert!(matches!(
            MessageQueue::create(&name, Direction::ReadWrite, Blocking::NonBlocking),
            Err(MqError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn drain_empties_the_queue() {
        let name = unique_name("drain");
        let q = MessageQueue::create(&name, Direction::ReadWrite, Blocking::NonBlocking).unwrap();
        q.send(&Message::data_written(0, 0));
        q.send(&Message::data_written(1, 1));
        let dropped = q.drain().unwrap();
        assert_eq!(dropped, 2);
        assert!(!q.can_receive());
    }

    #[test]
    fn depth_reflects_pending_messages() {
        let name = unique_name("depth");
        let q = MessageQueue::create(&name, Direction::ReadWrite, Blocking::NonBlocking).unwrap();
        assert_eq!(q.depth().unwrap(), 0);
        q.send(&Message::data_written(0, 0));
        assert_eq!(q.depth().unwrap(), 1);
        q.receive();
        assert_eq!(q.depth().unwrap(), 0);
    }

    #[test]
    fn bad_magic_is_rejected_without_wedging_the_queue() {
        let name = unique_name("badmagic");
        let q = MessageQueue::create(&name, Direction::ReadWrite, Blocking::NonBlocking).unwrap();

        let mut corrupt = Message::data_written(1, 1).encode();
        corrupt[0] ^= 0xff;
        assert!(matches!(q.send_raw(&corrupt), Outcome::Ok(())));
        assert!(matches!(q.receive(), Outcome::Error(MqError::Wire { .. })));

        let good = Message::data_written(2, 2);
        assert!(matches!(q.send(&good), Outcome::Ok(())));
        match q.receive() {
            Outcome::Ok(got) => assert_eq!(got, good),
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[test]
    fn second_handler_install_is_rejected() {
        let name = unique_name("handler");
        let q = MessageQueue::create(&name, Direction::ReadWrite, Blocking::NonBlocking).unwrap();
        q.set_notification_handler(|| {}).unwrap();
        assert!(matches!(
            q.set_notification_handler(|| {}),
            Err(MqError::HandlerAlreadyInstalled { .. })
        ));
    }
}
