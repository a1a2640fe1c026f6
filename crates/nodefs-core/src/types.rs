// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for the node identity table

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};

/// Node id the remote server reserves for the mount root
pub const ROOT_ID: u64 = 1;

/// Size value that marks a request as "this is the root object"
pub const ROOT_SIZE: u64 = u64::MAX;

/// Number of per-open-mode handle slots kept on every node
pub const MAX_HANDLE_KIND: usize = 3;

/// Vnode type as seen by the host VFS
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VnodeType {
    /// No specific type. Accepted by the attach path, refused by `vget`.
    Other,
    Regular,
    Directory,
    BlockDevice,
    CharDevice,
    Symlink,
    Socket,
    Fifo,
}

impl VnodeType {
    /// Convert the host's raw vtype number. Anything at or past the "bad" marker is refused.
    pub fn from_raw(raw: i32) -> FsResult<Self> {
        Ok(match raw {
            0 => VnodeType::Other,
            1 => VnodeType::Regular,
            2 => VnodeType::Directory,
            3 => VnodeType::BlockDevice,
            4 => VnodeType::CharDevice,
            5 => VnodeType::Symlink,
            6 => VnodeType::Socket,
            7 => VnodeType::Fifo,
            _ => return Err(FsError::InvalidArgument),
        })
    }

    pub fn as_raw(self) -> i32 {
        match self {
            VnodeType::Other => 0,
            VnodeType::Regular => 1,
            VnodeType::Directory => 2,
            VnodeType::BlockDevice => 3,
            VnodeType::CharDevice => 4,
            VnodeType::Symlink => 5,
            VnodeType::Socket => 6,
            VnodeType::Fifo => 7,
        }
    }

    /// Derive the vnode type from the `S_IFMT` bits of a mode reported by the server
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFREG as u32 => VnodeType::Regular,
            m if m == libc::S_IFDIR as u32 => VnodeType::Directory,
            m if m == libc::S_IFLNK as u32 => VnodeType::Symlink,
            m if m == libc::S_IFBLK as u32 => VnodeType::BlockDevice,
            m if m == libc::S_IFCHR as u32 => VnodeType::CharDevice,
            m if m == libc::S_IFIFO as u32 => VnodeType::Fifo,
            m if m == libc::S_IFSOCK as u32 => VnodeType::Socket,
            _ => VnodeType::Other,
        }
    }

    /// Block and character devices carry a device number
    pub fn is_special_device(self) -> bool {
        matches!(self, VnodeType::BlockDevice | VnodeType::CharDevice)
    }
}

/// Table key: one live node per (device, identifier, fork)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeKey {
    pub device: u64,
    pub identifier: u64,
    pub fork: u32,
}

impl NodeKey {
    pub fn new(device: u64, identifier: u64, fork: u32) -> Self {
        Self {
            device,
            identifier,
            fork,
        }
    }
}

/// Stable arena index of a node record. The host stores this, never a reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(pub u64);

impl std::fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Open mode a per-node file handle slot belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleKind {
    ReadOnly = 0,
    WriteOnly = 1,
    ReadWrite = 2,
}

impl HandleKind {
    pub fn from_open_flags(flags: i32) -> Self {
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => HandleKind::WriteOnly,
            libc::O_RDWR => HandleKind::ReadWrite,
            _ => HandleKind::ReadOnly,
        }
    }
}

bitflags! {
    /// State of one per-open-mode handle slot
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct HandleFlags: u32 {
        const VALID = 1 << 0;
        const MAPPED = 1 << 1;
        const STRATEGY = 1 << 2;
    }
}

bitflags! {
    /// Flags recorded on a node when it is created
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct NodeFlags: u32 {
        const CREATING = 1 << 0;
        /// Evicted as stale; no longer reachable by name
        const REVOKED = 1 << 1;
        const DIRECT_IO = 1 << 2;
    }
}

bitflags! {
    /// Flags on a lookup component
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ComponentFlags: u32 {
        /// Caller wants the result entered into the name cache
        const MAKEENTRY = 1 << 0;
    }
}

bitflags! {
    /// Flags handed back to the caller after an attach
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        const MAKEENTRY = 1 << 0;
    }
}

/// Name being looked up in a directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentName {
    pub name: String,
    pub flags: ComponentFlags,
}

impl ComponentName {
    pub fn new(name: impl Into<String>, flags: ComponentFlags) -> Self {
        Self {
            name: name.into(),
            flags,
        }
    }

    pub fn wants_entry(&self) -> bool {
        self.flags.contains(ComponentFlags::MAKEENTRY)
    }
}

/// Filesystem-type marker the host uses to filter and dispatch vnodes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VnodeTag {
    #[default]
    None,
    KernFs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_vtype_range_is_enforced() {
        for raw in 0..8 {
            let vtype = VnodeType::from_raw(raw).expect("valid raw vtype");
            assert_eq!(vtype.as_raw(), raw);
        }
        assert!(matches!(
            VnodeType::from_raw(8),
            Err(FsError::InvalidArgument)
        ));
        assert!(matches!(
            VnodeType::from_raw(-1),
            Err(FsError::InvalidArgument)
        ));
    }

    #[test]
    fn mode_bits_select_vtype() {
        assert_eq!(
            VnodeType::from_mode(libc::S_IFDIR as u32 | 0o755),
            VnodeType::Directory
        );
        assert_eq!(
            VnodeType::from_mode(libc::S_IFREG as u32 | 0o644),
            VnodeType::Regular
        );
        assert_eq!(
            VnodeType::from_mode(libc::S_IFCHR as u32),
            VnodeType::CharDevice
        );
        assert_eq!(VnodeType::from_mode(0o644), VnodeType::Other);
        assert!(VnodeType::BlockDevice.is_special_device());
        assert!(!VnodeType::Fifo.is_special_device());
    }

    #[test]
    fn handle_kind_follows_access_mode() {
        assert_eq!(HandleKind::from_open_flags(libc::O_RDONLY), HandleKind::ReadOnly);
        assert_eq!(
            HandleKind::from_open_flags(libc::O_WRONLY | libc::O_APPEND),
            HandleKind::WriteOnly
        );
        assert_eq!(HandleKind::from_open_flags(libc::O_RDWR), HandleKind::ReadWrite);
    }
}
