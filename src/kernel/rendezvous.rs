//! Rendezvous channels
//!
//! The second, simpler IPC kind: a single-slot message cell keyed by the
//! owning task's id. A receiver that finds the slot empty yields and retries
//! on its next dispatch; a sender deposits a message and wakes the owner by
//! flipping it back to ready (done at the kernel layer - this module is pure
//! bookkeeping). Deliberately kept apart from the ring-buffer sockets: no
//! peers, no partial transfers, one message at a time.

use super::task::TaskId;
use std::collections::HashMap;

/// Rendezvous errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousError {
    /// The task already owns a channel
    AlreadyBound(TaskId),
    /// No channel is bound to the task
    NotBound(TaskId),
    /// The single slot still holds an unconsumed message
    Busy(TaskId),
}

impl std::fmt::Display for RendezvousError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RendezvousError::AlreadyBound(id) => write!(f, "{} already owns a channel", id),
            RendezvousError::NotBound(id) => write!(f, "no channel bound to {}", id),
            RendezvousError::Busy(id) => write!(f, "channel of {} holds an unconsumed message", id),
        }
    }
}

impl std::error::Error for RendezvousError {}

/// All rendezvous channels, keyed by owning task
#[derive(Debug, Default)]
pub struct RendezvousTable {
    slots: HashMap<TaskId, Option<Vec<u8>>>,
}

impl RendezvousTable {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }

    /// Give `owner` an empty channel.
    pub fn bind(&mut self, owner: TaskId) -> Result<(), RendezvousError> {
        if self.slots.contains_key(&owner) {
            return Err(RendezvousError::AlreadyBound(owner));
        }
        self.slots.insert(owner, None);
        Ok(())
    }

    /// Tear down `owner`'s channel, dropping any unconsumed message.
    pub fn unbind(&mut self, owner: TaskId) -> Result<(), RendezvousError> {
        self.slots
            .remove(&owner)
            .map(|_| ())
            .ok_or(RendezvousError::NotBound(owner))
    }

    pub fn is_bound(&self, owner: TaskId) -> bool {
        self.slots.contains_key(&owner)
    }

    /// Place a message in `owner`'s slot. One message at a time: an
    /// unconsumed message is reported as `Busy`, never overwritten.
    pub fn deposit(&mut self, owner: TaskId, data: Vec<u8>) -> Result<(), RendezvousError> {
        let slot = self
            .slots
            .get_mut(&owner)
            .ok_or(RendezvousError::NotBound(owner))?;
        if slot.is_some() {
            return Err(RendezvousError::Busy(owner));
        }
        *slot = Some(data);
        Ok(())
    }

    /// Take the message from `owner`'s slot, if one is waiting. `Ok(None)`
    /// means the receiver should yield and retry.
    pub fn take(&mut self, owner: TaskId) -> Result<Option<Vec<u8>>, RendezvousError> {
        let slot = self
            .slots
            .get_mut(&owner)
            .ok_or(RendezvousError::NotBound(owner))?;
        Ok(slot.take())
    }
}
