//! Bounded FIFO ring used to queue received messages for the application.
//!
//! The ring is a fixed-size array of slots with an insert cursor (head) and
//! an extract cursor (tail). One slot is always left empty so that a full
//! ring is detected with `head + 1 == tail` and a writer never has to touch
//! the slot a reader may be inspecting. By default the ring is single
//! producer / single consumer and lock free; read-side and write-side gates
//! can be enabled at construction when more than one thread will sit on
//! either end.
//!
//! An eventfd in semaphore mode shadows the occupancy: every insert adds
//! one to the counter, every extract removes one. The file descriptor is
//! exposed so that the ring can be multiplexed in an external event loop
//! alongside sockets.

use std::cell::UnsafeCell;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};

use nix::sys::eventfd::{EfdFlags, EventFd};
use parking_lot::Mutex;

use crate::error::RmrError;

/// Bounded multi-slot FIFO with a pollable occupancy descriptor.
pub struct Ring<T> {
    slots: Box<[UnsafeCell<Option<T>>]>,
    head: AtomicUsize,
    tail: AtomicUsize,
    rgate: Option<Mutex<()>>,
    wgate: Option<Mutex<()>>,
    efd: EventFd,
}

// Slots are only touched by the publishing side (before the head store) and
// the extracting side (after the tail load), or under the optional gates.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    /// Create a ring able to hold `size` entries, no gates.
    pub fn new(size: usize) -> Result<Self, RmrError> {
        Self::with_gates(size, false, false)
    }

    /// Create a ring able to hold `size` entries, optionally guarding the
    /// read side and/or the write side with a mutex for multi-threaded use.
    pub fn with_gates(size: usize, read_gate: bool, write_gate: bool) -> Result<Self, RmrError> {
        if size == 0 {
            return Err(RmrError::Init("ring size must be > 0".into()));
        }

        let mut slots = Vec::with_capacity(size + 1); // one slot stays empty
        for _ in 0..=size {
            slots.push(UnsafeCell::new(None));
        }

        let efd = EventFd::from_value_and_flags(0, EfdFlags::EFD_SEMAPHORE | EfdFlags::EFD_NONBLOCK)
            .map_err(|e| RmrError::Init(format!("eventfd: {e}")))?;

        Ok(Self {
            slots: slots.into_boxed_slice(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            rgate: read_gate.then(|| Mutex::new(())),
            wgate: write_gate.then(|| Mutex::new(())),
            efd,
        })
    }

    /// Number of entries the ring can hold.
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// File descriptor that is readable exactly while the ring is non-empty.
    pub fn pollable_fd(&self) -> RawFd {
        self.efd.as_fd().as_raw_fd()
    }

    /// Insert at the head. Returns false (and drops nothing — the value is
    /// handed back) when the ring is full.
    pub fn insert(&self, value: T) -> Result<(), T> {
        let _w = self.wgate.as_ref().map(|g| g.lock());

        let head = self.head.load(Ordering::Acquire);
        let next = if head + 1 == self.slots.len() { 0 } else { head + 1 };
        if next == self.tail.load(Ordering::Acquire) {
            return Err(value); // full; the reserved slot stays reserved
        }

        unsafe { *self.slots[head].get() = Some(value) };
        self.head.store(next, Ordering::Release);

        let _ = self.efd.write(1); // semaphore count tracks occupancy
        Ok(())
    }

    /// Extract from the tail; `None` when the ring is empty.
    pub fn extract(&self) -> Option<T> {
        if self.tail.load(Ordering::Acquire) == self.head.load(Ordering::Acquire) {
            return None; // empty, skip the gate
        }

        let _r = self.rgate.as_ref().map(|g| g.lock());

        let tail = self.tail.load(Ordering::Acquire);
        if tail == self.head.load(Ordering::Acquire) {
            return None; // drained while waiting on the gate
        }

        let value = unsafe { (*self.slots[tail].get()).take() };
        let next = if tail + 1 == self.slots.len() { 0 } else { tail + 1 };
        self.tail.store(next, Ordering::Release);

        let _ = self.efd.read(); // decrement; EAGAIN only if counts drifted
        value
    }
}
