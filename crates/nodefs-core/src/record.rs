// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-object node record

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::ThreadId;

use tracing::warn;

use crate::error::{FsError, FsResult};
use crate::host::VnodeRef;
use crate::locks::{LockSet, NodeMeta, ParentLink};
use crate::types::{HandleFlags, HandleKind, NodeFlags, NodeIndex, NodeKey, VnodeType};

/// Fields fixed by the one-time initialization
#[derive(Clone, Debug)]
struct NodeInit {
    vtype: VnodeType,
    creator: ThreadId,
}

/// What `initialize` should populate
#[derive(Clone, Copy, Debug)]
pub(crate) struct InitSpec {
    pub vtype: VnodeType,
    pub size: u64,
    pub parent_identifier: u64,
    pub flags: NodeFlags,
}

/// Lifecycle of a table slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotPhase {
    Live,
    /// Leaving the table; finders wait for `Gone` and look up again
    Releasing,
    Gone,
}

/// Attach bookkeeping, guarded by the record's slot mutex
#[derive(Debug)]
pub(crate) struct SlotState {
    pub vnode: Option<VnodeRef>,
    pub attaching: bool,
    pub waiters: usize,
    pub phase: SlotPhase,
}

/// In-memory metadata for one live filesystem object
pub struct NodeRecord {
    index: NodeIndex,
    key: NodeKey,
    init: OnceLock<NodeInit>,
    locks: Mutex<Option<Arc<LockSet>>>,
    usage: AtomicU64,
    valid: AtomicBool,
    slot: Mutex<SlotState>,
    slot_changed: Condvar,
}

impl NodeRecord {
    pub(crate) fn new(index: NodeIndex, key: NodeKey) -> Self {
        Self {
            index,
            key,
            init: OnceLock::new(),
            locks: Mutex::new(None),
            usage: AtomicU64::new(0),
            valid: AtomicBool::new(true),
            slot: Mutex::new(SlotState {
                vnode: None,
                attaching: true,
                waiters: 0,
                phase: SlotPhase::Live,
            }),
            slot_changed: Condvar::new(),
        }
    }

    pub fn index(&self) -> NodeIndex {
        self.index
    }

    pub fn key(&self) -> NodeKey {
        self.key
    }

    pub fn identifier(&self) -> u64 {
        self.key.identifier
    }

    pub fn vtype(&self) -> Option<VnodeType> {
        self.init.get().map(|init| init.vtype)
    }

    pub fn creator(&self) -> Option<ThreadId> {
        self.init.get().map(|init| init.creator)
    }

    pub fn is_initialized(&self) -> bool {
        self.init.get().is_some()
    }

    /// False once the record has been scrubbed or retired
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Run the one-time setup. Returns true for the single caller that performed it.
    ///
    /// The lock set is published before the initialized flag, so no reader
    /// can see an initialized record without its locks.
    pub(crate) fn initialize(&self, init: InitSpec, live_lock_sets: &Arc<AtomicU64>) -> bool {
        let mut performed = false;
        self.init.get_or_init(|| {
            let meta = NodeMeta::new(init.parent_identifier, init.flags);
            let set = LockSet::new(meta, init.size, live_lock_sets.clone());
            *self.lock_slot() = Some(Arc::new(set));
            performed = true;
            NodeInit {
                vtype: init.vtype,
                creator: std::thread::current().id(),
            }
        });
        performed
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<Arc<LockSet>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn slot(&self) -> MutexGuard<'_, SlotState> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wait_slot<'a>(
        &self,
        guard: MutexGuard<'a, SlotState>,
    ) -> MutexGuard<'a, SlotState> {
        self.slot_changed.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wake_one(&self) {
        self.slot_changed.notify_one();
    }

    pub(crate) fn wake_all(&self) {
        self.slot_changed.notify_all();
    }

    /// Destroy the lock set and mark the record permanently invalid.
    /// Returns false if there was no lock set to destroy.
    pub(crate) fn scrub(&self) -> bool {
        self.valid.store(false, Ordering::Release);
        self.lock_slot().take().is_some()
    }

    pub fn has_lock_set(&self) -> bool {
        self.lock_slot().is_some()
    }

    pub fn locks(&self) -> FsResult<Arc<LockSet>> {
        self.lock_slot().clone().ok_or(FsError::NotFound)
    }

    pub fn size(&self) -> FsResult<u64> {
        Ok(*self.locks()?.read_size())
    }

    /// Change the size under the exclusive size lock; returns the old size
    pub fn set_size(&self, size: u64) -> FsResult<u64> {
        let locks = self.locks()?;
        let mut guard = locks.write_size();
        Ok(std::mem::replace(&mut *guard, size))
    }

    /// Owning directory; `None` for the root and for nodes not yet attached
    pub fn parent(&self) -> FsResult<Option<NodeIndex>> {
        Ok(match self.locks()?.read_meta().parent {
            ParentLink::Directory(index) => Some(index),
            ParentLink::Root | ParentLink::Unknown => None,
        })
    }

    pub fn parent_link(&self) -> FsResult<ParentLink> {
        Ok(self.locks()?.read_meta().parent)
    }

    pub fn parent_identifier(&self) -> FsResult<u64> {
        Ok(self.locks()?.read_meta().parent_identifier)
    }

    pub fn is_root(&self) -> bool {
        matches!(self.parent_link(), Ok(ParentLink::Root))
    }

    pub(crate) fn link_parent(&self, link: ParentLink) -> FsResult<()> {
        self.locks()?.write_meta().parent = link;
        Ok(())
    }

    /// Move the node under a new directory (rename)
    pub fn reparent(&self, dir: NodeIndex, dir_identifier: u64) -> FsResult<()> {
        let locks = self.locks()?;
        let mut meta = locks.write_meta();
        if meta.parent == ParentLink::Root {
            return Err(FsError::InvalidArgument);
        }
        meta.parent = ParentLink::Directory(dir);
        meta.parent_identifier = dir_identifier;
        Ok(())
    }

    pub fn flags(&self) -> FsResult<NodeFlags> {
        Ok(self.locks()?.read_meta().flags)
    }

    pub(crate) fn insert_flags(&self, flags: NodeFlags) -> FsResult<()> {
        self.locks()?.write_meta().flags |= flags;
        Ok(())
    }

    pub fn handle_flags(&self, kind: HandleKind) -> FsResult<HandleFlags> {
        Ok(self.locks()?.read_meta().handles[kind as usize])
    }

    pub fn set_handle_flags(&self, kind: HandleKind, flags: HandleFlags) -> FsResult<()> {
        self.locks()?.write_meta().handles[kind as usize] = flags;
        Ok(())
    }

    pub fn usage_count(&self) -> u64 {
        self.usage.load(Ordering::Acquire)
    }

    /// One more external reference; returns the new count
    pub(crate) fn note_lookup(&self) -> u64 {
        self.usage.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop `n` external references, never going below zero; returns the new count
    pub(crate) fn forget(&self, n: u64) -> u64 {
        let previous = self
            .usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(n))
            })
            .unwrap_or_else(|count| count);
        if n > previous {
            warn!(
                nid = self.key.identifier,
                requested = n,
                held = previous,
                "forget exceeds lookup count"
            );
        }
        previous.saturating_sub(n)
    }
}

impl std::fmt::Debug for NodeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRecord")
            .field("index", &self.index)
            .field("key", &self.key)
            .field("vtype", &self.vtype())
            .field("usage", &self.usage_count())
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_spec() -> InitSpec {
        InitSpec {
            vtype: VnodeType::Regular,
            size: 512,
            parent_identifier: 1,
            flags: NodeFlags::empty(),
        }
    }

    #[test]
    fn initialize_runs_once() {
        let live = Arc::new(AtomicU64::new(0));
        let record = NodeRecord::new(NodeIndex(0), NodeKey::new(7, 42, 0));
        assert!(!record.is_initialized());
        assert!(record.locks().is_err());

        assert!(record.initialize(init_spec(), &live));
        assert!(!record.initialize(
            InitSpec {
                vtype: VnodeType::Directory,
                ..init_spec()
            },
            &live
        ));
        assert_eq!(record.vtype(), Some(VnodeType::Regular));
        assert_eq!(record.creator(), Some(std::thread::current().id()));
        assert_eq!(live.load(Ordering::Acquire), 1);
        assert_eq!(record.size().unwrap(), 512);
        assert_eq!(record.parent_identifier().unwrap(), 1);
        assert_eq!(record.parent().unwrap(), None);
        assert_eq!(
            record.handle_flags(HandleKind::ReadWrite).unwrap(),
            HandleFlags::empty()
        );
    }

    #[test]
    fn scrub_destroys_lock_set_once() {
        let live = Arc::new(AtomicU64::new(0));
        let record = NodeRecord::new(NodeIndex(0), NodeKey::new(7, 42, 0));
        record.initialize(init_spec(), &live);
        assert!(record.scrub());
        assert!(!record.scrub());
        assert!(!record.is_valid());
        assert!(!record.has_lock_set());
        assert_eq!(live.load(Ordering::Acquire), 0);
        assert!(matches!(record.size(), Err(FsError::NotFound)));
    }

    #[test]
    fn forget_saturates_at_zero() {
        let record = NodeRecord::new(NodeIndex(0), NodeKey::new(7, 42, 0));
        assert_eq!(record.note_lookup(), 1);
        assert_eq!(record.note_lookup(), 2);
        assert_eq!(record.forget(1), 1);
        assert_eq!(record.forget(5), 0);
        assert_eq!(record.usage_count(), 0);
    }

    #[test]
    fn size_and_parent_mutators() {
        let live = Arc::new(AtomicU64::new(0));
        let record = NodeRecord::new(NodeIndex(3), NodeKey::new(7, 42, 0));
        record.initialize(init_spec(), &live);
        record.link_parent(ParentLink::Directory(NodeIndex(1))).unwrap();
        assert_eq!(record.set_size(8192).unwrap(), 512);
        assert_eq!(record.size().unwrap(), 8192);

        record.reparent(NodeIndex(5), 77).unwrap();
        assert_eq!(record.parent().unwrap(), Some(NodeIndex(5)));
        assert_eq!(record.parent_identifier().unwrap(), 77);

        record.link_parent(ParentLink::Root).unwrap();
        assert!(record.is_root());
        assert!(matches!(
            record.reparent(NodeIndex(5), 77),
            Err(FsError::InvalidArgument)
        ));
    }
}
