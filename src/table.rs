//! The guest-fd-indexed descriptor registry.
//!
//! Layout follows the three-part scheme of the VM it serves: a dense,
//! append-only `opens` array indexed directly by fd, a sparse
//! `renumber_map` for fds the guest has renumbered past the dense range,
//! and a `closes` free-list of tombstoned dense slots. The smallest key
//! ever present in `renumber_map` is at least `opens.len()`, so resolution
//! is a bounds check followed by one indexed load or one map lookup.
//!
//! Each slot holds its descriptor behind its own mutex. `resolve` acquires
//! that mutex *before* releasing the table's reader lock; close and
//! renumber must take the same mutex before they may drain a detached
//! descriptor. That handoff is what makes it impossible for one thread to
//! release a backing resource while another is mid-operation on it.

use crate::descriptor::Descriptor;
use crate::{Error, Result};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

type Slot = Arc<Mutex<Descriptor>>;

/// An exclusively-locked descriptor, as handed out by
/// [`DescriptorTable::resolve`]. The descriptor is live for as long as the
/// guard is held: a concurrent close or renumber can detach it from the
/// table, but cannot drain it until this guard drops.
pub struct DescriptorGuard {
    guard: ArcMutexGuard<RawMutex, Descriptor>,
}

impl Deref for DescriptorGuard {
    type Target = Descriptor;

    fn deref(&self) -> &Descriptor {
        &self.guard
    }
}

impl DerefMut for DescriptorGuard {
    fn deref_mut(&mut self) -> &mut Descriptor {
        &mut self.guard
    }
}

enum SlotEntry {
    Open(Slot),
    /// Tombstone; `free_idx` is this slot's position in `closes`, kept so
    /// the free-list entry can be removed in O(1) when the slot is reused.
    Closed { free_idx: usize },
}

struct TableInner {
    opens: Vec<SlotEntry>,
    renumber_map: BTreeMap<u32, Slot>,
    closes: Vec<u32>,
}

impl TableInner {
    fn slot(&self, fd: u32) -> Result<&Slot> {
        match self.opens.get(fd as usize) {
            Some(SlotEntry::Open(slot)) => Ok(slot),
            Some(SlotEntry::Closed { .. }) => Err(Error::Badf),
            None => self.renumber_map.get(&fd).ok_or(Error::Badf),
        }
    }

    /// Detach the descriptor at `fd` from the table. Dense slots leave a
    /// tombstone and a free-list entry behind; map entries are simply
    /// erased. The caller owns the returned slot and must drain it once the
    /// table lock is released.
    fn detach(&mut self, fd: u32) -> Result<Slot> {
        let pos = fd as usize;
        if pos < self.opens.len() {
            let free_idx = self.closes.len();
            match std::mem::replace(&mut self.opens[pos], SlotEntry::Closed { free_idx }) {
                SlotEntry::Open(slot) => {
                    self.closes.push(fd);
                    Ok(slot)
                }
                tomb @ SlotEntry::Closed { .. } => {
                    self.opens[pos] = tomb;
                    Err(Error::Badf)
                }
            }
        } else {
            self.renumber_map.remove(&fd).ok_or(Error::Badf)
        }
    }

    /// Install `slot` at `fd`, returning whatever live descriptor it
    /// displaced (for the caller to drain outside the table lock).
    fn install(&mut self, fd: u32, slot: Slot) -> Option<Slot> {
        let pos = fd as usize;
        if pos < self.opens.len() {
            match std::mem::replace(&mut self.opens[pos], SlotEntry::Open(slot)) {
                SlotEntry::Open(old) => Some(old),
                SlotEntry::Closed { free_idx } => {
                    self.remove_free_entry(free_idx);
                    None
                }
            }
        } else if pos == self.opens.len() {
            self.opens.push(SlotEntry::Open(slot));
            self.normalize_renumber_map();
            None
        } else {
            let old = self.renumber_map.insert(fd, slot);
            self.normalize_renumber_map();
            old
        }
    }

    /// Remove `closes[free_idx]`. `swap_remove` moves the last entry into
    /// the hole, so the moved entry's tombstone gets its back-pointer
    /// patched; nothing else shifts.
    fn remove_free_entry(&mut self, free_idx: usize) {
        self.closes.swap_remove(free_idx);
        if let Some(&moved) = self.closes.get(free_idx) {
            self.opens[moved as usize] = SlotEntry::Closed { free_idx };
        }
    }

    /// Migrate any run of map entries contiguous with the dense range back
    /// into `opens`, restoring the minimum-map-key invariant.
    fn normalize_renumber_map(&mut self) {
        while let Some(slot) = self
            .renumber_map
            .remove(&u32::try_from(self.opens.len()).unwrap_or(u32::MAX))
        {
            self.opens.push(SlotEntry::Open(slot));
        }
    }
}

/// The process-wide registry mapping guest fds to [`Descriptor`]s.
pub struct DescriptorTable {
    inner: RwLock<TableInner>,
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(TableInner {
                opens: Vec::new(),
                renumber_map: BTreeMap::new(),
                closes: Vec::new(),
            }),
        }
    }

    /// Resolve `fd` to its locked descriptor.
    ///
    /// The descriptor's own mutex is acquired before the table's reader
    /// lock is released; a close on another thread can therefore neither
    /// drain this descriptor while the guard lives, nor begin tearing it
    /// down without first waiting on the same mutex.
    pub fn resolve(&self, fd: u32) -> Result<DescriptorGuard> {
        let inner = self.inner.read();
        let slot = inner.slot(fd)?.clone();
        let guard = slot.lock_arc();
        drop(inner);
        Ok(DescriptorGuard { guard })
    }

    /// Insert a descriptor at the next available fd: the most recently
    /// vacated dense slot if any, otherwise a fresh append.
    pub fn open(&self, descriptor: Descriptor) -> Result<u32> {
        let slot = Arc::new(Mutex::new(descriptor));
        let mut inner = self.inner.write();
        let fd = match inner.closes.pop() {
            Some(fd) => {
                inner.opens[fd as usize] = SlotEntry::Open(slot);
                fd
            }
            None => {
                let fd = u32::try_from(inner.opens.len()).map_err(|_| Error::Overflow)?;
                inner.opens.push(SlotEntry::Open(slot));
                inner.normalize_renumber_map();
                fd
            }
        };
        drop(inner);
        tracing::trace!(fd, "descriptor opened");
        Ok(fd)
    }

    /// Insert a descriptor at an explicit fd. Used by the embedder to seed
    /// well-known fds (stdio, preopens); the target must be vacant.
    pub fn open_at(&self, fd: u32, descriptor: Descriptor) -> Result<()> {
        let slot = Arc::new(Mutex::new(descriptor));
        let mut inner = self.inner.write();
        let pos = fd as usize;
        if pos < inner.opens.len() {
            let free_idx = match &inner.opens[pos] {
                SlotEntry::Open(_) => return Err(Error::Inval),
                SlotEntry::Closed { free_idx } => *free_idx,
            };
            inner.remove_free_entry(free_idx);
            inner.opens[pos] = SlotEntry::Open(slot);
        } else if pos == inner.opens.len() {
            inner.opens.push(SlotEntry::Open(slot));
            inner.normalize_renumber_map();
        } else {
            if inner.renumber_map.contains_key(&fd) {
                return Err(Error::Inval);
            }
            inner.renumber_map.insert(fd, slot);
        }
        drop(inner);
        tracing::trace!(fd, "descriptor installed");
        Ok(())
    }

    /// Close `fd`: tombstone its slot, then drain the detached descriptor
    /// and release its backing resource outside the table's critical
    /// section.
    pub fn close(&self, fd: u32) -> Result<()> {
        let detached = {
            let mut inner = self.inner.write();
            inner.detach(fd)?
        };
        drain(detached);
        tracing::trace!(fd, "descriptor closed");
        Ok(())
    }

    /// Reassign the descriptor at `from` to the number `to`, displacing and
    /// releasing whatever live descriptor `to` currently names.
    ///
    /// `renumber(a, a)` only validates that `a` is live and changes nothing.
    pub fn renumber(&self, from: u32, to: u32) -> Result<()> {
        if from == to {
            let inner = self.inner.read();
            return inner.slot(from).map(|_| ());
        }
        let displaced = {
            let mut inner = self.inner.write();
            let moving = inner.detach(from)?;
            inner.install(to, moving)
        };
        if let Some(slot) = displaced {
            drain(slot);
        }
        tracing::trace!(from, to, "descriptor renumbered");
        Ok(())
    }
}

/// The drain step: take the detached descriptor's own lock once more (so
/// any in-flight operation finishes first), swap its resource out for the
/// tombstone state, and release the backing handle only after the lock is
/// dropped.
fn drain(slot: Slot) {
    let resource = {
        let mut guard = slot.lock();
        guard.take_resource()
    };
    drop(resource);
}
