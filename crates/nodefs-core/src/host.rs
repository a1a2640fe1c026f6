// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Interfaces to the host VFS collaborators
//!
//! The core never owns a live vnode. The host constructs it, stores the
//! record's [`NodeIndex`] in it and reports its actual type back.

use std::sync::Arc;

use crate::config::MountContext;
use crate::error::ConstructError;
use crate::types::{ComponentName, NodeIndex, VnodeTag, VnodeType};

/// Live, externally addressable vnode owned by the host
pub trait HostVnode: Send + Sync + std::fmt::Debug {
    /// Index of the node record this vnode was built for
    fn node_index(&self) -> NodeIndex;

    /// Type the host actually bound the vnode to
    fn vtype(&self) -> VnodeType;

    fn set_tag(&self, tag: VnodeTag);

    /// Release one host reference
    fn put(&self);
}

pub type VnodeRef = Arc<dyn HostVnode>;

/// Everything the host needs to build a vnode for a record
#[derive(Clone, Debug)]
pub struct VnodeParams {
    pub mount: MountContext,
    pub index: NodeIndex,
    pub identifier: u64,
    pub vtype: VnodeType,
    pub size: u64,
    /// `None` for the root
    pub parent: Option<VnodeRef>,
    pub mark_root: bool,
    /// Only meaningful for block and character devices on a factory that supports them
    pub rdev: u32,
    /// Device vnodes get the special-file operation table
    pub special_ops: bool,
}

/// Turns initialized records into live vnodes
#[cfg_attr(test, mockall::automock)]
pub trait VnodeFactory: Send + Sync {
    fn construct(&self, params: &VnodeParams) -> Result<VnodeRef, ConstructError>;

    /// Whether device numbers and special-file operations are honoured
    fn supports_special_files(&self) -> bool {
        false
    }
}

/// Makes a stale vnode unreachable from future name resolution
#[cfg_attr(test, mockall::automock)]
pub trait DisappearHook: Send + Sync {
    fn disappear(&self, vnode: &VnodeRef);
}

/// Receives resolved names for optional insertion into the name cache
#[cfg_attr(test, mockall::automock)]
pub trait NameCache: Send + Sync {
    fn enter(&self, dir: &VnodeRef, vnode: &VnodeRef, name: &ComponentName);
}
