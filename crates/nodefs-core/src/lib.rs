// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Node identity core for the nodefs FUSE driver
//!
//! Guarantees a single in-memory node record per remote object, coordinates
//! the initialize-then-attach sequence that binds a record to a host vnode,
//! and owns the per-node lock set the rest of the driver relies on.

pub mod config;
pub mod error;
pub mod fault;
pub mod host;
pub mod locks;
pub mod manager;
pub mod memhost;
pub mod record;
pub mod table;
pub mod types;

pub use config::{MountContext, NodeTableConfig};
pub use error::{ConstructError, FsError, FsResult};
pub use host::{DisappearHook, HostVnode, NameCache, VnodeFactory, VnodeParams, VnodeRef};
pub use locks::{LockSet, NodeMeta, ParentLink};
pub use manager::{Attached, HostHooks, NodeManager, NodeStats, VnodeRequest};
pub use record::NodeRecord;
pub use table::{AttachTicket, IdentityTable, Retired, Slot};
pub use types::{
    ComponentFlags, ComponentName, EntryFlags, HandleFlags, HandleKind, NodeFlags, NodeIndex,
    NodeKey, VnodeTag, VnodeType, MAX_HANDLE_KIND, ROOT_ID, ROOT_SIZE,
};
