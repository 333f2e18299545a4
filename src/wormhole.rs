//! Wormholes: direct, application-opened sessions that bypass the route
//! table. The manager is a slot array keyed by small integer ids; closing a
//! slot leaves a hole that the next open may reuse, and opening an address
//! that is already open returns the existing id.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::session::Endpoint;

/// Wormhole identifier handed to the application.
pub type WhId = usize;

/// Expandable slot array of directly addressed endpoints.
pub struct WormholeMgr {
    slots: Mutex<Vec<Option<Arc<Endpoint>>>>,
}

impl WormholeMgr {
    pub fn new() -> Self {
        Self { slots: Mutex::new(Vec::new()) }
    }

    /// Register `ep` and return its id. If the endpoint already occupies a
    /// slot that id is returned; otherwise the first hole is reused before
    /// the array grows.
    pub fn open(&self, ep: Arc<Endpoint>) -> WhId {
        let mut slots = self.slots.lock();

        let mut hole: Option<usize> = None;
        for (i, slot) in slots.iter().enumerate() {
            match slot {
                Some(existing) if Arc::ptr_eq(existing, &ep) => return i,
                None if hole.is_none() => hole = Some(i),
                _ => {}
            }
        }

        match hole {
            Some(i) => {
                slots[i] = Some(ep);
                i
            }
            None => {
                slots.push(Some(ep));
                slots.len() - 1
            }
        }
    }

    /// Endpoint behind an id; `None` for a closed or never-assigned slot.
    pub fn get(&self, id: WhId) -> Option<Arc<Endpoint>> {
        self.slots.lock().get(id).and_then(|s| s.clone())
    }

    /// Free the slot. Returns the endpoint that occupied it so the caller
    /// can tear the session down.
    pub fn close(&self, id: WhId) -> Option<Arc<Endpoint>> {
        let mut slots = self.slots.lock();
        slots.get_mut(id).and_then(|s| s.take())
    }
}

impl Default for WormholeMgr {
    fn default() -> Self {
        Self::new()
    }
}
