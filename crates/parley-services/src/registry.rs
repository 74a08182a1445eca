//! Connection registry: user id → live transport handle.
//!
//! One instance tracks control sessions, another tracks bulk connections
//! waiting for their transfer to be scheduled. Every operation takes the
//! same lock, so mutations and the liveness sweep are serialised per
//! instance and reads see a consistent snapshot.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use parley_core::UserId;

use crate::transport::{ConnId, Transport};

/// Snapshot of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub uid: UserId,
    pub online: bool,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("user {0} is not registered")]
    NotFound(UserId),
    #[error("user {0} is offline")]
    Offline(UserId),
}

struct Entry<H> {
    handle: H,
    online: bool,
}

/// Shared, cloneable registry.
pub struct Registry<H> {
    entries: Arc<Mutex<HashMap<UserId, Entry<H>>>>,
}

impl<H> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<H: Transport> Default for Registry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Transport> Registry<H> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, Entry<H>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or overwrite the entry for `uid`, marking it online.
    ///
    /// Returns the displaced handle, if any. The caller decides whether to
    /// close it (a re-login on the same connection must not).
    pub fn add(&self, uid: UserId, handle: H) -> Option<H> {
        self.lock()
            .insert(uid, Entry { handle, online: true })
            .map(|old| old.handle)
    }

    /// Flip the online flag. Returns false when `uid` is not registered.
    pub fn set_online(&self, uid: UserId, online: bool) -> bool {
        match self.lock().get_mut(&uid) {
            Some(entry) => {
                entry.online = online;
                true
            }
            None => false,
        }
    }

    /// Flip the online flag only if the entry still belongs to `conn_id`.
    pub fn set_online_if_current(&self, uid: UserId, conn_id: ConnId, online: bool) -> bool {
        match self.lock().get_mut(&uid) {
            Some(entry) if entry.handle.conn_id() == conn_id => {
                entry.online = online;
                true
            }
            _ => false,
        }
    }

    /// Remove and close the entry.
    pub fn remove(&self, uid: UserId) -> bool {
        let removed = self.lock().remove(&uid);
        match removed {
            Some(entry) => {
                entry.handle.close();
                true
            }
            None => false,
        }
    }

    /// Remove the entry without closing it, handing the handle to the caller.
    pub fn take(&self, uid: UserId) -> Option<H> {
        self.lock().remove(&uid).map(|entry| entry.handle)
    }

    pub fn get_connections(&self) -> Vec<ConnectionInfo> {
        self.lock()
            .iter()
            .map(|(uid, entry)| ConnectionInfo {
                uid: *uid,
                online: entry.online,
                addr: entry.handle.peer_addr(),
            })
            .collect()
    }

    /// Ids of every entry currently flagged online.
    pub fn online_ids(&self) -> Vec<UserId> {
        self.lock()
            .iter()
            .filter(|(_, entry)| entry.online)
            .map(|(uid, _)| *uid)
            .collect()
    }

    pub fn is_online(&self, uid: UserId) -> bool {
        self.lock().get(&uid).map_or(false, |entry| entry.online)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Two-phase liveness sweep.
    ///
    /// Entries already flagged offline are evicted and closed; every
    /// survivor is then flagged offline, so only a refresh before the next
    /// sweep keeps it. Returns the evicted ids.
    pub fn scan_and_close_inactive(&self) -> Vec<UserId> {
        let evicted: Vec<(UserId, H)> = {
            let mut entries = self.lock();
            let stale: Vec<UserId> = entries
                .iter()
                .filter(|(_, entry)| !entry.online)
                .map(|(uid, _)| *uid)
                .collect();
            let evicted = stale
                .into_iter()
                .filter_map(|uid| entries.remove(&uid).map(|entry| (uid, entry.handle)))
                .collect();
            for entry in entries.values_mut() {
                entry.online = false;
            }
            evicted
        };

        evicted
            .into_iter()
            .map(|(uid, handle)| {
                handle.close();
                uid
            })
            .collect()
    }
}

impl<H: Transport + Clone> Registry<H> {
    /// The handle for `uid`, if it is registered and online.
    pub fn get_handle(&self, uid: UserId) -> Result<H, LookupError> {
        match self.lock().get(&uid) {
            Some(entry) if entry.online => Ok(entry.handle.clone()),
            Some(_) => Err(LookupError::Offline(uid)),
            None => Err(LookupError::NotFound(uid)),
        }
    }
}
