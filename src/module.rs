//! Interface to the collaborator that owns module sessions and their
//! notification channels.
//!
//! The core never talks to module processes directly. It holds an
//! [`EventSender`] per subscription and pushes encoded event records
//! through it without blocking; everything else about a module's
//! lifecycle belongs to the session owner behind [`ModuleBroker`].

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tagbase::event::{EventRecord, EVENT_MSG_SIZE};

/// Opaque session identifier assigned by the transport when a module
/// connects.
pub type ModuleId = u64;

/// Notification channels hold this many undelivered records before
/// further sends are dropped.
pub const NOTIFY_QUEUE_DEPTH: usize = 128;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub name: String,
    pub id: ModuleId,
    pub pid: u32,
    pub event_count: u32,
}

/// Receiving half of a module's notification channel; the session
/// owner drains it onto the module's event socket.
pub type EventReceiver = Receiver<[u8; EVENT_MSG_SIZE]>;

/// Sending half of a module's notification channel.
///
/// Cloned into every subscription the module registers. The handle is
/// non-owning: equality is module identity, which is what authorises
/// subscription deletion.
#[derive(Clone, Debug)]
pub struct EventSender {
    module: ModuleId,
    tx: SyncSender<[u8; EVENT_MSG_SIZE]>,
}

impl EventSender {
    pub fn channel(module: ModuleId, depth: usize) -> (EventSender, EventReceiver) {
        let (tx, rx) = sync_channel(depth);
        (EventSender { module, tx }, rx)
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    /// Delivers one encoded event record. Never blocks; a full or
    /// closed channel is the subscriber's loss, not the writer's.
    pub(crate) fn send(&self, record: &EventRecord) -> Result<()> {
        match self.tx.try_send(record.encode()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(Error::MsgSend("notification channel is full"))
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(Error::MsgSend("notification channel is closed"))
            }
        }
    }
}

impl PartialEq for EventSender {
    fn eq(&self, other: &EventSender) -> bool {
        self.module == other.module
    }
}

/// What the core needs from the module registry collaborator.
pub trait ModuleBroker {
    /// Registers a session, or refreshes name and pid when the session
    /// id is already known.
    fn register(&mut self, id: ModuleId, name: &str, pid: u32) -> Result<()>;

    fn unregister(&mut self, id: ModuleId) -> Result<()>;

    /// The notification handle new subscriptions of this module carry.
    fn sender_of(&self, id: ModuleId) -> Option<EventSender>;

    fn descriptor_of(&self, id: ModuleId) -> Option<ModuleDescriptor>;

    fn descriptor_by_pid(&self, pid: u32) -> Option<ModuleDescriptor>;

    /// Bookkeeping hook, called after a subscription is added or
    /// deleted on the module's behalf.
    fn record_event(&mut self, id: ModuleId, added: bool);
}

struct Session {
    descriptor: ModuleDescriptor,
    sender: EventSender,
    receiver: Option<EventReceiver>,
}

/// In-memory session table, sufficient for in-process deployments and
/// tests. The production master may substitute its own broker.
#[derive(Default)]
pub struct SessionTable {
    sessions: Vec<Session>,
}

impl SessionTable {
    pub fn new() -> SessionTable {
        SessionTable::default()
    }

    /// Hands out the receiving half of a module's channel, once.
    pub fn take_receiver(&mut self, id: ModuleId) -> Option<EventReceiver> {
        self.sessions
            .iter_mut()
            .find(|session| session.descriptor.id == id)
            .and_then(|session| session.receiver.take())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl ModuleBroker for SessionTable {
    fn register(&mut self, id: ModuleId, name: &str, pid: u32) -> Result<()> {
        if let Some(session) =
            self.sessions.iter_mut().find(|session| session.descriptor.id == id)
        {
            session.descriptor.name = name.to_string();
            session.descriptor.pid = pid;
            return Ok(());
        }
        let (sender, receiver) = EventSender::channel(id, NOTIFY_QUEUE_DEPTH);
        self.sessions.push(Session {
            descriptor: ModuleDescriptor {
                name: name.to_string(),
                id,
                pid,
                event_count: 0,
            },
            sender,
            receiver: Some(receiver),
        });
        log::debug!("registered module {name} (session {id}, pid {pid})");
        Ok(())
    }

    fn unregister(&mut self, id: ModuleId) -> Result<()> {
        let before = self.sessions.len();
        self.sessions.retain(|session| session.descriptor.id != id);
        if self.sessions.len() == before {
            return Err(Error::NotFound(format!("module session {id}")));
        }
        log::debug!("unregistered module session {id}");
        Ok(())
    }

    fn sender_of(&self, id: ModuleId) -> Option<EventSender> {
        self.sessions
            .iter()
            .find(|session| session.descriptor.id == id)
            .map(|session| session.sender.clone())
    }

    fn descriptor_of(&self, id: ModuleId) -> Option<ModuleDescriptor> {
        self.sessions
            .iter()
            .find(|session| session.descriptor.id == id)
            .map(|session| session.descriptor.clone())
    }

    fn descriptor_by_pid(&self, pid: u32) -> Option<ModuleDescriptor> {
        self.sessions
            .iter()
            .find(|session| session.descriptor.pid == pid)
            .map(|session| session.descriptor.clone())
    }

    fn record_event(&mut self, id: ModuleId, added: bool) {
        if let Some(session) =
            self.sessions.iter_mut().find(|session| session.descriptor.id == id)
        {
            let count = &mut session.descriptor.event_count;
            *count = if added {
                count.saturating_add(1)
            } else {
                count.saturating_sub(1)
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent_per_session() {
        let mut table = SessionTable::new();
        table.register(7, "hmi", 100).unwrap();
        table.register(7, "hmi2", 101).unwrap();
        assert_eq!(table.len(), 1);
        let descriptor = table.descriptor_of(7).unwrap();
        assert_eq!(descriptor.name, "hmi2");
        assert_eq!(descriptor.pid, 101);
    }

    #[test]
    fn unregister_drops_the_session() {
        let mut table = SessionTable::new();
        table.register(7, "hmi", 100).unwrap();
        table.unregister(7).unwrap();
        assert!(table.is_empty());
        assert!(table.unregister(7).is_err());
    }

    #[test]
    fn event_count_follows_subscriptions() {
        let mut table = SessionTable::new();
        table.register(7, "hmi", 100).unwrap();
        table.record_event(7, true);
        table.record_event(7, true);
        table.record_event(7, false);
        assert_eq!(table.descriptor_of(7).unwrap().event_count, 1);
    }

    #[test]
    fn sender_identity_is_the_module() {
        let mut table = SessionTable::new();
        table.register(1, "a", 10).unwrap();
        table.register(2, "b", 11).unwrap();
        let a = table.sender_of(1).unwrap();
        let b = table.sender_of(2).unwrap();
        assert_eq!(a, table.sender_of(1).unwrap());
        assert_ne!(a, b);
    }
}
