// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-node lock set: creation mutex, metadata lock and size lock
//!
//! One-time initialization itself is serialized by the record's `OnceLock`;
//! the creation mutex covers the attach that follows it.
//!
//! Each lock owns the state it protects, so holding the guard is the only way
//! to reach that state. Guards release on every exit path. The set itself is
//! destroyed when the owning record is scrubbed or retired.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use crate::types::{HandleFlags, NodeFlags, NodeIndex, MAX_HANDLE_KIND};

/// Where a node hangs in the tree
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParentLink {
    /// Not linked yet, or resolved without a directory
    Unknown,
    /// Mount root; has no parent
    Root,
    Directory(NodeIndex),
}

/// Node fields guarded by the metadata lock
#[derive(Clone, Debug)]
pub struct NodeMeta {
    pub parent: ParentLink,
    /// Denormalized parent node id; 0 for the root
    pub parent_identifier: u64,
    pub handles: [HandleFlags; MAX_HANDLE_KIND],
    pub flags: NodeFlags,
}

impl NodeMeta {
    pub fn new(parent_identifier: u64, flags: NodeFlags) -> Self {
        Self {
            parent: ParentLink::Unknown,
            parent_identifier,
            handles: [HandleFlags::empty(); MAX_HANDLE_KIND],
            flags,
        }
    }
}

pub struct LockSet {
    create: Mutex<()>,
    meta: RwLock<NodeMeta>,
    size: RwLock<u64>,
    live: Arc<AtomicU64>,
}

impl LockSet {
    /// Allocate a lock set and count it in `live` until dropped
    pub fn new(meta: NodeMeta, size: u64, live: Arc<AtomicU64>) -> Self {
        live.fetch_add(1, Ordering::AcqRel);
        Self {
            create: Mutex::new(()),
            meta: RwLock::new(meta),
            size: RwLock::new(size),
            live,
        }
    }

    /// Held by the attaching thread from the moment it snapshots the node's
    /// type and size until the new vnode's parent link is written. Taking it
    /// elsewhere waits out an attach in progress, so the metadata read after
    /// it belongs to a fully linked node or to no vnode at all.
    pub fn lock_create(&self) -> MutexGuard<'_, ()> {
        self.create.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn read_meta(&self) -> RwLockReadGuard<'_, NodeMeta> {
        self.meta.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write_meta(&self) -> RwLockWriteGuard<'_, NodeMeta> {
        self.meta.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shared size access for operations that need a stable length
    pub fn read_size(&self) -> RwLockReadGuard<'_, u64> {
        self.size.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive size access for truncate and extend
    pub fn write_size(&self) -> RwLockWriteGuard<'_, u64> {
        self.size.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for LockSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockSet").finish_non_exhaustive()
    }
}
