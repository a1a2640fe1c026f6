// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Identity table: at most one live node record per (device, identifier, fork)
//!
//! The table owns every [`NodeRecord`] in a sharded arena. A shard lock is
//! held only for the reserve-if-absent instant; everything after that is
//! synchronized on the record's own slot mutex. The first caller for a key
//! gets an [`AttachTicket`]; concurrent callers block until the ticket holder
//! attaches a vnode or gives up, in which case one waiter inherits the ticket.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::error::{FsError, FsResult};
use crate::host::VnodeRef;
use crate::record::{NodeRecord, SlotPhase};
use crate::types::{NodeIndex, NodeKey};

#[derive(Default)]
struct Shard {
    by_key: HashMap<NodeKey, NodeIndex>,
    records: HashMap<NodeIndex, Arc<NodeRecord>>,
    next_seq: u64,
}

/// Result of a table lookup
#[derive(Debug)]
pub enum Slot {
    /// Record already has a live vnode
    Found {
        record: Arc<NodeRecord>,
        vnode: VnodeRef,
    },
    /// Caller must attach a vnode, or report failure through the table
    Reserved(AttachTicket),
}

impl Slot {
    /// True when the caller is responsible for attaching
    pub fn created(&self) -> bool {
        matches!(self, Slot::Reserved(_))
    }

    pub fn record(&self) -> &Arc<NodeRecord> {
        match self {
            Slot::Found { record, .. } => record,
            Slot::Reserved(ticket) => ticket.record(),
        }
    }
}

/// Exclusive right to attach a vnode to one record
#[derive(Debug)]
pub struct AttachTicket {
    record: Arc<NodeRecord>,
    fresh: bool,
}

impl AttachTicket {
    pub fn record(&self) -> &Arc<NodeRecord> {
        &self.record
    }

    /// True if this call inserted the slot, false if it inherited the ticket
    /// from a failed attach
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }
}

/// Record taken out of the table for good
#[derive(Debug)]
pub struct Retired {
    pub record: Arc<NodeRecord>,
    /// Vnode that was attached at the time, if any
    pub vnode: Option<VnodeRef>,
}

pub struct IdentityTable {
    shards: Vec<Mutex<Shard>>,
    fork_count: u32,
    live_lock_sets: Arc<AtomicU64>,
}

impl IdentityTable {
    pub fn new(shards: usize, fork_count: u32) -> FsResult<Self> {
        if shards == 0 || fork_count == 0 {
            return Err(FsError::InvalidArgument);
        }
        Ok(Self {
            shards: (0..shards).map(|_| Mutex::new(Shard::default())).collect(),
            fork_count,
            live_lock_sets: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Counter of lock sets currently allocated by records of this table
    pub fn live_lock_sets(&self) -> &Arc<AtomicU64> {
        &self.live_lock_sets
    }

    fn shard(&self, idx: usize) -> MutexGuard<'_, Shard> {
        self.shards[idx].lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shard_of_key(&self, key: &NodeKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    fn shard_of_index(&self, index: NodeIndex) -> usize {
        (index.0 % self.shards.len() as u64) as usize
    }

    /// Look up the record for `key`, reserving a fresh one if absent.
    ///
    /// Blocks while another caller is attaching the same key.
    pub fn resolve(&self, key: NodeKey) -> FsResult<Slot> {
        if key.fork >= self.fork_count {
            return Err(FsError::InvalidArgument);
        }
        let shard_idx = self.shard_of_key(&key);

        loop {
            let (record, fresh) = {
                let mut shard = self.shard(shard_idx);
                let existing = shard
                    .by_key
                    .get(&key)
                    .and_then(|index| shard.records.get(index))
                    .cloned();
                match existing {
                    Some(record) => (record, false),
                    None => {
                        let seq = shard.next_seq;
                        shard.next_seq += 1;
                        let index = NodeIndex(seq * self.shards.len() as u64 + shard_idx as u64);
                        let record = Arc::new(NodeRecord::new(index, key));
                        shard.by_key.insert(key, index);
                        shard.records.insert(index, record.clone());
                        (record, true)
                    }
                }
            };

            if fresh {
                trace!(nid = key.identifier, index = %record.index(), "reserved slot");
                return Ok(Slot::Reserved(AttachTicket {
                    record,
                    fresh: true,
                }));
            }

            let mut slot = record.slot();
            loop {
                match slot.phase {
                    SlotPhase::Gone => break,
                    SlotPhase::Releasing => {
                        slot.waiters += 1;
                        slot = record.wait_slot(slot);
                        slot.waiters -= 1;
                        continue;
                    }
                    SlotPhase::Live => {}
                }
                if let Some(vnode) = slot.vnode.clone() {
                    drop(slot);
                    return Ok(Slot::Found { record, vnode });
                }
                if !slot.attaching {
                    slot.attaching = true;
                    drop(slot);
                    trace!(nid = key.identifier, index = %record.index(), "inherited attach");
                    return Ok(Slot::Reserved(AttachTicket {
                        record,
                        fresh: false,
                    }));
                }
                slot.waiters += 1;
                slot = record.wait_slot(slot);
                slot.waiters -= 1;
            }
            // The slot left the table while we waited; look the key up again.
        }
    }

    /// Bind `vnode` to the ticket's record and wake everyone waiting on it.
    ///
    /// Fails with `NotFound` if the record was retired while the vnode was
    /// being built; the caller still owns the vnode then.
    pub fn attach_succeeded(
        &self,
        ticket: AttachTicket,
        vnode: VnodeRef,
    ) -> FsResult<Arc<NodeRecord>> {
        let record = ticket.record;
        let bound = {
            let mut slot = record.slot();
            slot.attaching = false;
            if slot.phase == SlotPhase::Live {
                slot.vnode = Some(vnode);
                true
            } else {
                false
            }
        };
        record.wake_all();
        if bound {
            Ok(record)
        } else {
            Err(FsError::NotFound)
        }
    }

    /// Give up the attach. Returns true when nobody else is waiting on the
    /// record, in which case the caller must scrub it and call [`Self::scrub_done`].
    /// Otherwise one waiter inherits the attach.
    pub fn attach_failed(&self, ticket: &AttachTicket) -> bool {
        let record = &ticket.record;
        let mut slot = record.slot();
        slot.attaching = false;
        if slot.phase != SlotPhase::Live {
            // Retired underneath us; retire already scrubbed it.
            return false;
        }
        if slot.waiters == 0 && slot.vnode.is_none() {
            slot.phase = SlotPhase::Releasing;
            true
        } else {
            drop(slot);
            record.wake_one();
            false
        }
    }

    /// Release a scrubbed record's slot
    pub fn scrub_done(&self, ticket: AttachTicket) {
        let record = ticket.record;
        self.unlink(&record);
        {
            let mut slot = record.slot();
            slot.phase = SlotPhase::Gone;
        }
        record.wake_all();
        trace!(nid = record.identifier(), index = %record.index(), "slot released");
    }

    fn unlink(&self, record: &NodeRecord) {
        let mut shard = self.shard(self.shard_of_index(record.index()));
        shard.records.remove(&record.index());
        if shard.by_key.get(&record.key()) == Some(&record.index()) {
            shard.by_key.remove(&record.key());
        }
    }

    /// Take a record out of the table permanently and destroy its lock set.
    /// Returns `None` if it was already gone.
    pub fn retire(&self, index: NodeIndex) -> Option<Retired> {
        let record = {
            let mut shard = self.shard(self.shard_of_index(index));
            let record = shard.records.remove(&index)?;
            if shard.by_key.get(&record.key()) == Some(&index) {
                shard.by_key.remove(&record.key());
            }
            record
        };
        let vnode = {
            let mut slot = record.slot();
            slot.phase = SlotPhase::Gone;
            slot.vnode.take()
        };
        record.wake_all();
        record.scrub();
        Some(Retired { record, vnode })
    }

    /// Retire every record, e.g. at unmount
    pub fn retire_all(&self) -> Vec<Retired> {
        let indices: Vec<NodeIndex> = (0..self.shards.len())
            .flat_map(|idx| self.shard(idx).records.keys().copied().collect::<Vec<_>>())
            .collect();
        indices.into_iter().filter_map(|index| self.retire(index)).collect()
    }

    pub fn get(&self, index: NodeIndex) -> Option<Arc<NodeRecord>> {
        self.shard(self.shard_of_index(index)).records.get(&index).cloned()
    }

    pub fn lookup(&self, key: &NodeKey) -> Option<Arc<NodeRecord>> {
        let shard = self.shard(self.shard_of_key(key));
        shard.by_key.get(key).and_then(|index| shard.records.get(index)).cloned()
    }

    pub fn len(&self) -> usize {
        (0..self.shards.len()).map(|idx| self.shard(idx).records.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::InitSpec;
    use crate::types::{NodeFlags, VnodeType};
    use std::sync::atomic::Ordering;
    use std::sync::Barrier;
    use std::time::Duration;

    #[derive(Debug)]
    struct StubVnode(NodeIndex);

    impl crate::host::HostVnode for StubVnode {
        fn node_index(&self) -> NodeIndex {
            self.0
        }
        fn vtype(&self) -> VnodeType {
            VnodeType::Regular
        }
        fn set_tag(&self, _tag: crate::types::VnodeTag) {}
        fn put(&self) {}
    }

    fn key(identifier: u64) -> NodeKey {
        NodeKey::new(7, identifier, 0)
    }

    fn init(table: &IdentityTable, record: &NodeRecord) {
        record.initialize(
            InitSpec {
                vtype: VnodeType::Regular,
                size: 0,
                parent_identifier: 1,
                flags: NodeFlags::empty(),
            },
            table.live_lock_sets(),
        );
    }

    #[test]
    fn rejects_fork_outside_range() {
        let table = IdentityTable::new(4, 1).unwrap();
        assert!(matches!(
            table.resolve(NodeKey::new(7, 42, 1)),
            Err(FsError::InvalidArgument)
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn zero_shards_rejected() {
        assert!(matches!(
            IdentityTable::new(0, 1),
            Err(FsError::InvalidArgument)
        ));
    }

    #[test]
    fn first_resolve_reserves_then_finds() {
        let table = IdentityTable::new(4, 1).unwrap();
        let slot = table.resolve(key(42)).unwrap();
        assert!(slot.created());
        let Slot::Reserved(ticket) = slot else {
            panic!("expected reservation")
        };
        assert!(ticket.is_fresh());
        init(&table, ticket.record());
        let index = ticket.record().index();
        table.attach_succeeded(ticket, Arc::new(StubVnode(index))).unwrap();

        let again = table.resolve(key(42)).unwrap();
        assert!(!again.created());
        assert_eq!(again.record().index(), index);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn distinct_forks_get_distinct_records() {
        let table = IdentityTable::new(4, 2).unwrap();
        let a = table.resolve(NodeKey::new(7, 42, 0)).unwrap();
        let b = table.resolve(NodeKey::new(7, 42, 1)).unwrap();
        assert!(a.created() && b.created());
        assert_ne!(a.record().index(), b.record().index());
    }

    #[test]
    fn failed_sole_attach_releases_slot() {
        let table = IdentityTable::new(4, 1).unwrap();
        let Slot::Reserved(ticket) = table.resolve(key(42)).unwrap() else {
            panic!("expected reservation")
        };
        init(&table, ticket.record());
        assert!(table.attach_failed(&ticket));
        assert!(ticket.record().scrub());
        table.scrub_done(ticket);
        assert!(table.lookup(&key(42)).is_none());
        assert_eq!(table.live_lock_sets().load(Ordering::Acquire), 0);

        let again = table.resolve(key(42)).unwrap();
        assert!(again.created());
        assert!(!again.record().is_initialized());
    }

    #[test]
    fn waiter_inherits_failed_attach() {
        let table = Arc::new(IdentityTable::new(4, 1).unwrap());
        let Slot::Reserved(ticket) = table.resolve(key(42)).unwrap() else {
            panic!("expected reservation")
        };
        init(&table, ticket.record());
        let first_index = ticket.record().index();

        let waiter = {
            let table = table.clone();
            std::thread::spawn(move || table.resolve(key(42)).unwrap())
        };
        // Wait until the second resolver is parked on the record.
        while ticket.record().slot().waiters == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!table.attach_failed(&ticket));
        drop(ticket);

        let slot = waiter.join().unwrap();
        let Slot::Reserved(inherited) = slot else {
            panic!("waiter should inherit the attach")
        };
        assert!(!inherited.is_fresh());
        assert_eq!(inherited.record().index(), first_index);
        assert!(inherited.record().is_initialized());
    }

    #[test]
    fn concurrent_resolvers_share_one_record() {
        let table = Arc::new(IdentityTable::new(4, 1).unwrap());
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    match table.resolve(key(7)).unwrap() {
                        Slot::Reserved(ticket) => {
                            init(&table, ticket.record());
                            let index = ticket.record().index();
                            std::thread::sleep(Duration::from_millis(5));
                            table.attach_succeeded(ticket, Arc::new(StubVnode(index))).unwrap();
                            (index, true)
                        }
                        Slot::Found { record, .. } => (record.index(), false),
                    }
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
        assert!(results.iter().all(|(index, _)| *index == results[0].0));
        assert_eq!(table.live_lock_sets().load(Ordering::Acquire), 1);
    }

    #[test]
    fn attach_after_retire_is_refused() {
        let table = IdentityTable::new(4, 1).unwrap();
        let Slot::Reserved(ticket) = table.resolve(key(42)).unwrap() else {
            panic!("expected reservation")
        };
        init(&table, ticket.record());
        let index = ticket.record().index();
        let record = ticket.record().clone();

        let retired = table.retire(index).expect("record present");
        assert!(retired.vnode.is_none());
        assert!(!table.attach_failed(&ticket));
        assert!(matches!(
            table.attach_succeeded(ticket, Arc::new(StubVnode(index))),
            Err(FsError::NotFound)
        ));
        assert!(record.slot().vnode.is_none());
        assert!(table.is_empty());
        assert_eq!(table.live_lock_sets().load(Ordering::Acquire), 0);
    }

    #[test]
    fn retire_removes_record_and_lock_set() {
        let table = IdentityTable::new(4, 1).unwrap();
        let Slot::Reserved(ticket) = table.resolve(key(42)).unwrap() else {
            panic!("expected reservation")
        };
        init(&table, ticket.record());
        let index = ticket.record().index();
        table.attach_succeeded(ticket, Arc::new(StubVnode(index))).unwrap();

        let retired = table.retire(index).expect("record present");
        assert!(retired.vnode.is_some());
        assert!(!retired.record.is_valid());
        assert!(table.retire(index).is_none());
        assert!(table.get(index).is_none());
        assert_eq!(table.live_lock_sets().load(Ordering::Acquire), 0);
    }
}
