//! Acknowledgement bookkeeping.
//!
//! The table maps packet ids of outstanding QoS 1 publishes and subscribes
//! to what the broker is expected to answer. It belongs to the session, not
//! to a connection, so an entry survives reconnection and a retransmission
//! can still be matched. Acks for ids the table does not know are ignored:
//! they may come from a connection that has since been replaced.

use super::error::{AckError, Error};
use super::message::QoS;
use crate::fmt::{debug, trace};
use crate::system::Scheduler;
use core::cell::{Cell, RefCell};
use heapless::FnvIndexMap;

/// Maximum number of acknowledgements awaited at once.
pub const CAPACITY: usize = 16;

/// How often an ack wait re-checks the table, in milliseconds.
pub const ACK_POLL_MS: u64 = 20;

/// SUBACK return code for a refused subscription.
pub const SUBACK_FAILURE: u8 = 0x80;

/// What the broker is expected to send back.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Expect {
    /// A PUBACK for a QoS 1 publish.
    Puback,
    /// A SUBACK granting the requested QoS.
    Suback(QoS),
}

/// State of one pending entry. Satisfied entries are removed outright.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AckState {
    /// No answer yet.
    Waiting,
    /// The broker answered negatively.
    Rejected(AckError),
}

#[derive(Debug, Clone, Copy)]
struct PendingAck {
    expect: Expect,
    state: AckState,
}

/// Packet id allocator plus the set of acknowledgements still awaited.
#[derive(Debug)]
pub struct AckTable {
    last_pid: Cell<u16>,
    pending: RefCell<FnvIndexMap<u16, PendingAck, CAPACITY>>,
}

impl Default for AckTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AckTable {
    /// An empty table whose first id will be 1.
    pub fn new() -> Self {
        Self {
            last_pid: Cell::new(0),
            pending: RefCell::new(FnvIndexMap::new()),
        }
    }

    /// Next packet id, cycling through 1..=65535 and never 0.
    ///
    /// Ids still registered are skipped so a wrapped counter cannot alias a
    /// live entry.
    pub fn new_pid(&self) -> u16 {
        loop {
            let pid = match self.last_pid.get() {
                u16::MAX => 1,
                n => n + 1,
            };
            self.last_pid.set(pid);
            if !self.pending.borrow().contains_key(&pid) {
                return pid;
            }
        }
    }

    /// Start waiting for `expect` on `pid`.
    ///
    /// Returns `false` when the table is full; the caller retries later.
    pub fn register(&self, pid: u16, expect: Expect) -> bool {
        let entry = PendingAck {
            expect,
            state: AckState::Waiting,
        };
        self.pending.borrow_mut().insert(pid, entry).is_ok()
    }

    /// Whether the table has room for another entry.
    pub fn is_full(&self) -> bool {
        self.pending.borrow().len() == CAPACITY
    }

    /// Whether `pid` is still awaited (waiting or rejected).
    pub fn is_pending(&self, pid: u16) -> bool {
        self.pending.borrow().contains_key(&pid)
    }

    /// Current state of `pid`, `None` once satisfied or never registered.
    pub fn state(&self, pid: u16) -> Option<AckState> {
        self.pending.borrow().get(&pid).map(|p| p.state)
    }

    /// Number of entries still awaited.
    pub fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Whether nothing is awaited.
    pub fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }

    /// Forget `pid` without an acknowledgement.
    pub fn remove(&self, pid: u16) {
        self.pending.borrow_mut().remove(&pid);
    }

    /// A PUBACK arrived.
    pub fn on_puback(&self, pid: u16) {
        let mut pending = self.pending.borrow_mut();
        match pending.get(&pid) {
            Some(p) if p.expect == Expect::Puback => {
                pending.remove(&pid);
            }
            _ => trace!("puback for unknown pid {}", pid),
        }
    }

    /// A SUBACK arrived with return code `granted`.
    pub fn on_suback(&self, pid: u16, granted: u8) {
        let mut pending = self.pending.borrow_mut();
        let Some(entry) = pending.get_mut(&pid) else {
            trace!("suback for unknown pid {}", pid);
            return;
        };
        let Expect::Suback(qos) = entry.expect else {
            return;
        };
        if granted == qos as u8 {
            pending.remove(&pid);
        } else if granted == SUBACK_FAILURE {
            entry.state = AckState::Rejected(AckError::Refused);
        } else {
            entry.state = AckState::Rejected(AckError::QosMismatch);
        }
    }

    /// Wait until `pid` is acknowledged, rejected, or `timeout_ms` passes.
    ///
    /// An entry that has already disappeared counts as acknowledged; another
    /// task may have observed the ack first. A rejected entry is removed and
    /// its reason returned.
    pub async fn await_ack<S: Scheduler>(
        &self,
        pid: u16,
        scheduler: &S,
        timeout_ms: u64,
    ) -> Result<(), Error> {
        let start = scheduler.now_ms();
        loop {
            match self.state(pid) {
                None => return Ok(()),
                Some(AckState::Rejected(reason)) => {
                    self.remove(pid);
                    return Err(reason.into());
                }
                Some(AckState::Waiting) => {}
            }
            if scheduler.elapsed_ms(start) > timeout_ms {
                debug!("ack wait for pid {} timed out", pid);
                return Err(Error::Timeout);
            }
            scheduler.sleep_ms(ACK_POLL_MS).await;
        }
    }
}
