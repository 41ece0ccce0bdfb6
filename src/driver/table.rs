//! Arena of driver sockets keyed by [`SocketId`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{SocketId, TransportError};

struct Slots<S> {
    next_id: u64,
    sockets: HashMap<SocketId, Arc<S>>,
    closed: bool,
}

/// Socket arena shared by a driver's operations.
///
/// Ids are never reused, so a stale id always resolves to
/// [`TransportError::SocketClosed`].
pub(crate) struct SocketTable<S> {
    slots: Mutex<Slots<S>>,
}

impl<S> SocketTable<S> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                next_id: 1,
                sockets: HashMap::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots<S>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a socket unless the table is closed.
    pub(crate) fn insert(&self, socket: S) -> Result<SocketId, TransportError> {
        self.insert_unique(socket, |_| false, String::new)
    }

    /// Insert a socket unless an existing one conflicts with it.
    ///
    /// The conflict check and the insert happen under one lock.
    pub(crate) fn insert_unique(
        &self,
        socket: S,
        conflicts: impl Fn(&S) -> bool,
        describe: impl FnOnce() -> String,
    ) -> Result<SocketId, TransportError> {
        let mut slots = self.lock();
        if slots.closed {
            return Err(TransportError::DriverClosed);
        }
        if slots.sockets.values().any(|existing| conflicts(existing)) {
            return Err(TransportError::AddressInUse(describe()));
        }

        let id = SocketId::new(slots.next_id);
        slots.next_id += 1;
        slots.sockets.insert(id, Arc::new(socket));
        Ok(id)
    }

    pub(crate) fn get(&self, id: SocketId) -> Result<Arc<S>, TransportError> {
        let slots = self.lock();
        if slots.closed {
            return Err(TransportError::DriverClosed);
        }
        slots
            .sockets
            .get(&id)
            .cloned()
            .ok_or(TransportError::SocketClosed)
    }

    pub(crate) fn remove(&self, id: SocketId) -> Option<Arc<S>> {
        self.lock().sockets.remove(&id)
    }

    /// Sockets matching a predicate.
    pub(crate) fn filter(&self, mut keep: impl FnMut(&S) -> bool) -> Vec<Arc<S>> {
        self.lock()
            .sockets
            .values()
            .filter(|socket| keep(socket))
            .cloned()
            .collect()
    }

    /// Close the table and hand back every remaining socket.
    ///
    /// Returns `None` if the table was already closed.
    pub(crate) fn close(&self) -> Option<Vec<Arc<S>>> {
        let mut slots = self.lock();
        if slots.closed {
            return None;
        }
        slots.closed = true;
        Some(slots.sockets.drain().map(|(_, socket)| socket).collect())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
