// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Vnode attachment protocol and lookup accounting
//!
//! `get_or_create` initializes a node record once, asks the host factory for a
//! live vnode, and rolls the record back if the factory fails. Every returned
//! vnode is checked against the requested type; a mismatch evicts the cached
//! identity and fails with a retryable error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use scopeguard::ScopeGuard;
use tracing::{debug, trace, warn};

use crate::config::{MountContext, NodeTableConfig};
use crate::error::{FsError, FsResult};
use crate::host::{DisappearHook, NameCache, VnodeFactory, VnodeParams, VnodeRef};
use crate::locks::ParentLink;
use crate::record::{InitSpec, NodeRecord};
use crate::table::{AttachTicket, IdentityTable, Slot};
use crate::types::{
    ComponentName, EntryFlags, NodeFlags, NodeIndex, NodeKey, VnodeTag, VnodeType, ROOT_ID,
    ROOT_SIZE,
};

/// Host collaborators the manager calls into
#[derive(Clone)]
pub struct HostHooks {
    pub factory: Arc<dyn VnodeFactory>,
    pub disappear: Arc<dyn DisappearHook>,
    pub names: Arc<dyn NameCache>,
}

/// "Give me the vnode for node `identifier` of type `vtype` under `parent`"
#[derive(Clone, Debug)]
pub struct VnodeRequest {
    pub identifier: u64,
    pub vtype: VnodeType,
    /// [`ROOT_SIZE`] marks the mount root
    pub size: u64,
    pub parent: Option<VnodeRef>,
    pub flags: NodeFlags,
    pub rdev: u32,
}

impl VnodeRequest {
    pub fn new(identifier: u64, vtype: VnodeType, size: u64) -> Self {
        Self {
            identifier,
            vtype,
            size,
            parent: None,
            flags: NodeFlags::empty(),
            rdev: 0,
        }
    }

    /// Request for the mount root
    pub fn root() -> Self {
        Self::new(ROOT_ID, VnodeType::Directory, ROOT_SIZE)
    }

    pub fn with_parent(mut self, dir: VnodeRef) -> Self {
        self.parent = Some(dir);
        self
    }

    pub fn with_flags(mut self, flags: NodeFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_rdev(mut self, rdev: u32) -> Self {
        self.rdev = rdev;
        self
    }

    pub fn is_root(&self) -> bool {
        self.size == ROOT_SIZE
    }
}

/// Successful `get_or_create`
#[derive(Debug)]
pub struct Attached {
    pub vnode: VnodeRef,
    pub record: Arc<NodeRecord>,
    /// This call constructed the vnode
    pub created: bool,
    pub entry_flags: EntryFlags,
}

/// Point-in-time counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub vnodes_current: u64,
    pub lock_sets_live: u64,
    pub initializations: u64,
    pub records: usize,
}

#[derive(Default)]
struct Counters {
    vnodes_current: AtomicU64,
    initializations: AtomicU64,
}

impl Counters {
    fn vnode_gone(&self) {
        if self
            .vnodes_current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
        {
            warn!("live vnode count already zero on release");
        }
    }
}

pub struct NodeManager {
    mount: MountContext,
    config: NodeTableConfig,
    table: IdentityTable,
    hooks: HostHooks,
    counters: Counters,
    root: Mutex<Option<VnodeRef>>,
}

impl NodeManager {
    pub fn new(mount: MountContext, config: NodeTableConfig, hooks: HostHooks) -> FsResult<Self> {
        config.validate()?;
        let table = IdentityTable::new(config.shards, config.fork_count)?;
        Ok(Self {
            mount,
            config,
            table,
            hooks,
            counters: Counters::default(),
            root: Mutex::new(None),
        })
    }

    pub fn mount(&self) -> MountContext {
        self.mount
    }

    pub fn config(&self) -> &NodeTableConfig {
        &self.config
    }

    pub fn table(&self) -> &IdentityTable {
        &self.table
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            vnodes_current: self.counters.vnodes_current.load(Ordering::Acquire),
            lock_sets_live: self.table.live_lock_sets().load(Ordering::Acquire),
            initializations: self.counters.initializations.load(Ordering::Acquire),
            records: self.table.len(),
        }
    }

    /// Cached root vnode, once the root has been attached
    pub fn root(&self) -> Option<VnodeRef> {
        self.root.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Node record behind a vnode
    pub fn record(&self, vnode: &VnodeRef) -> FsResult<Arc<NodeRecord>> {
        self.table
            .get(vnode.node_index())
            .filter(|record| record.is_valid())
            .ok_or(FsError::NotFound)
    }

    /// Find or build the vnode for `req`, attaching a new one if needed.
    pub fn get_or_create(&self, req: &VnodeRequest) -> FsResult<Attached> {
        let mark_root = req.is_root();
        let key = NodeKey::new(self.mount.device, req.identifier, 0);

        let (record, vnode, created) = match self.table.resolve(key)? {
            Slot::Found { record, vnode } => (record, vnode, false),
            Slot::Reserved(ticket) => {
                let (record, vnode) = self.attach(ticket, req, mark_root)?;
                (record, vnode, true)
            }
        };

        self.check_type(&record, &vnode, req.vtype)?;

        vnode.set_tag(VnodeTag::KernFs);
        Ok(Attached {
            vnode,
            record,
            created,
            entry_flags: if created {
                EntryFlags::MAKEENTRY
            } else {
                EntryFlags::empty()
            },
        })
    }

    fn attach(
        &self,
        ticket: AttachTicket,
        req: &VnodeRequest,
        mark_root: bool,
    ) -> FsResult<(Arc<NodeRecord>, VnodeRef)> {
        let ticket = scopeguard::guard(ticket, |ticket| self.abandon(ticket));
        let record = ticket.record().clone();

        let parent = if mark_root { None } else { req.parent.clone() };
        let parent_identifier = match &parent {
            Some(dir) => self.record(dir)?.identifier(),
            None => 0,
        };

        let init = InitSpec {
            vtype: req.vtype,
            size: if mark_root { 0 } else { req.size },
            parent_identifier,
            flags: req.flags,
        };
        if record.initialize(init, self.table.live_lock_sets()) {
            self.counters.initializations.fetch_add(1, Ordering::AcqRel);
            debug!(
                nid = req.identifier,
                vtype = ?req.vtype,
                index = %record.index(),
                root = mark_root,
                "initialized node"
            );
        } else {
            trace!(nid = req.identifier, index = %record.index(), "attaching to initialized node");
        }

        let locks = record.locks()?;
        let vnode = {
            let _create = locks.lock_create();
            // An inherited attach builds what the record was initialized as,
            // not what this caller asked for.
            let vtype = record.vtype().unwrap_or(req.vtype);
            let special = self.hooks.factory.supports_special_files();
            let params = VnodeParams {
                mount: self.mount,
                index: record.index(),
                identifier: req.identifier,
                vtype,
                size: *locks.read_size(),
                parent: parent.clone(),
                mark_root,
                rdev: if special { req.rdev } else { 0 },
                special_ops: special && vtype.is_special_device(),
            };

            let vnode = self.hooks.factory.construct(&params).map_err(|err| {
                debug!(nid = req.identifier, error = %err, "vnode construction failed");
                FsError::from(err)
            })?;

            let link = match &parent {
                _ if mark_root => ParentLink::Root,
                Some(dir) => ParentLink::Directory(dir.node_index()),
                None => ParentLink::Unknown,
            };
            if let Err(err) = record.link_parent(link) {
                vnode.put();
                return Err(err);
            }
            vnode
        };
        drop(locks);

        let ticket = ScopeGuard::into_inner(ticket);
        let record = match self.table.attach_succeeded(ticket, vnode.clone()) {
            Ok(record) => record,
            Err(err) => {
                debug!(nid = req.identifier, "node retired during attach");
                vnode.put();
                return Err(err);
            }
        };
        self.counters.vnodes_current.fetch_add(1, Ordering::AcqRel);
        if mark_root {
            *self.root.lock().unwrap_or_else(PoisonError::into_inner) = Some(vnode.clone());
        }
        trace!(nid = req.identifier, index = %record.index(), "vnode attached");
        Ok((record, vnode))
    }

    /// Every handed-out vnode must match the requested type, cached or fresh
    fn check_type(
        &self,
        record: &NodeRecord,
        vnode: &VnodeRef,
        requested: VnodeType,
    ) -> FsResult<()> {
        let actual = vnode.vtype();
        if actual == requested {
            return Ok(());
        }
        self.evict_stale(record, vnode, requested);
        Err(FsError::RetryableConflict {
            identifier: record.identifier(),
            cached: actual,
            requested,
        })
    }

    /// Failure path for an attach: scrub the record if nobody else wants it
    fn abandon(&self, ticket: AttachTicket) {
        if self.table.attach_failed(&ticket) {
            let record = ticket.record().clone();
            record.scrub();
            self.table.scrub_done(ticket);
            debug!(nid = record.identifier(), index = %record.index(), "scrubbed unattached node");
        }
    }

    fn evict_stale(&self, record: &NodeRecord, vnode: &VnodeRef, requested: VnodeType) {
        warn!(
            nid = record.identifier(),
            cached = ?vnode.vtype(),
            requested = ?requested,
            "vnode type changed; evicting stale node"
        );
        if record.insert_flags(NodeFlags::REVOKED).is_err() || !self.retire(record.index()) {
            trace!(nid = record.identifier(), "stale node already retired");
            return;
        }
        self.hooks.disappear.disappear(vnode);
        vnode.put();
    }

    fn retire(&self, index: NodeIndex) -> bool {
        let Some(retired) = self.table.retire(index) else {
            return false;
        };
        if retired.vnode.is_some() {
            self.counters.vnode_gone();
        }
        let mut root = self.root.lock().unwrap_or_else(PoisonError::into_inner);
        if root.as_ref().is_some_and(|vnode| vnode.node_index() == index) {
            *root = None;
        }
        true
    }

    /// Full lookup: attach, offer the name to the name cache, count the lookup.
    pub fn vget(
        &self,
        req: &VnodeRequest,
        component: Option<&ComponentName>,
    ) -> FsResult<VnodeRef> {
        if req.vtype == VnodeType::Other {
            return Err(FsError::InvalidArgument);
        }

        if self.config.root_fast_path && req.identifier == ROOT_ID {
            if let Some((record, root)) = self.cached_root(req.identifier) {
                self.check_type(&record, &root, req.vtype)?;
                self.enter_name(req, &root, component);
                self.note_resolved(&root)?;
                return Ok(root);
            }
        }

        let attached = self.get_or_create(req)?;
        self.enter_name(req, &attached.vnode, component);
        self.note_resolved(&attached.vnode)?;
        Ok(attached.vnode)
    }

    /// Cached root, if it is live and is the node `identifier` names
    fn cached_root(&self, identifier: u64) -> Option<(Arc<NodeRecord>, VnodeRef)> {
        let root = self.root()?;
        let record = self.record(&root).ok()?;
        (record.identifier() == identifier).then_some((record, root))
    }

    fn enter_name(&self, req: &VnodeRequest, vnode: &VnodeRef, component: Option<&ComponentName>) {
        if !self.config.name_cache {
            return;
        }
        if let (Some(dir), Some(name)) = (&req.parent, component) {
            if name.wants_entry() {
                self.hooks.names.enter(dir, vnode, name);
            }
        }
    }

    /// Count one successful resolution; returns the new usage count
    pub fn note_resolved(&self, vnode: &VnodeRef) -> FsResult<u64> {
        Ok(self.record(vnode)?.note_lookup())
    }

    /// Drop `n` lookups on behalf of the reclamation layer
    pub fn forget(&self, vnode: &VnodeRef, n: u64) -> FsResult<u64> {
        Ok(self.record(vnode)?.forget(n))
    }

    /// The host recycled `vnode`; retire its record. Returns false if it was already gone.
    pub fn reclaim(&self, vnode: &VnodeRef) -> bool {
        self.retire(vnode.node_index())
    }

    /// Retire every record; returns how many were live
    pub fn unmount(&self) -> usize {
        let retired = self.table.retire_all();
        for entry in &retired {
            if entry.vnode.is_some() {
                self.counters.vnode_gone();
            }
        }
        *self.root.lock().unwrap_or_else(PoisonError::into_inner) = None;
        debug!(count = retired.len(), "retired all nodes");
        retired.len()
    }
}
