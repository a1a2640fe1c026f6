// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory host collaborators
//!
//! A vnode factory, disappearance hook and name cache that keep everything in
//! process memory. Used by the test suites; the factory retains everything it
//! builds, so it is not meant to back a long-lived mount. The factory can
//! inject construction failures through a [`FaultInjector`] and can be told to
//! report a different actual type for an identifier, which is how a replaced
//! remote object looks to the core.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::error::ConstructError;
use crate::fault::FaultInjector;
use crate::host::{DisappearHook, HostVnode, NameCache, VnodeFactory, VnodeParams, VnodeRef};
use crate::manager::HostHooks;
use crate::types::{ComponentName, NodeIndex, VnodeTag, VnodeType};

/// Vnode living entirely in memory
#[derive(Debug)]
pub struct MemVnode {
    index: NodeIndex,
    vtype: VnodeType,
    tag: Mutex<VnodeTag>,
    puts: AtomicU64,
    disappeared: AtomicBool,
}

impl MemVnode {
    pub fn new(index: NodeIndex, vtype: VnodeType) -> Arc<Self> {
        Arc::new(Self {
            index,
            vtype,
            tag: Mutex::new(VnodeTag::None),
            puts: AtomicU64::new(0),
            disappeared: AtomicBool::new(false),
        })
    }

    pub fn tag(&self) -> VnodeTag {
        *self.tag.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Acquire)
    }

    pub fn is_disappeared(&self) -> bool {
        self.disappeared.load(Ordering::Acquire)
    }

    fn mark_disappeared(&self) {
        self.disappeared.store(true, Ordering::Release);
    }
}

impl HostVnode for MemVnode {
    fn node_index(&self) -> NodeIndex {
        self.index
    }

    fn vtype(&self) -> VnodeType {
        self.vtype
    }

    fn set_tag(&self, tag: VnodeTag) {
        *self.tag.lock().unwrap_or_else(PoisonError::into_inner) = tag;
    }

    fn put(&self) {
        self.puts.fetch_add(1, Ordering::AcqRel);
    }
}

/// Vnode factory backed by [`MemVnode`]
///
/// Keeps every vnode it has built, retired or not, so tests can inspect
/// them afterwards. Nothing is ever evicted from that map, which makes the
/// factory a test fixture rather than a host for long-lived mounts.
#[derive(Default)]
pub struct MemFactory {
    faults: FaultInjector,
    special_files: bool,
    delay: Option<Duration>,
    actual_types: Mutex<HashMap<u64, VnodeType>>,
    built: Mutex<HashMap<NodeIndex, Arc<MemVnode>>>,
    constructions: AtomicU64,
}

impl MemFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_special_files(mut self, enabled: bool) -> Self {
        self.special_files = enabled;
        self
    }

    /// Sleep inside every construction, to widen race windows in tests
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Build vnodes for `identifier` with `actual` instead of the requested type
    pub fn set_actual_type(&self, identifier: u64, actual: VnodeType) {
        self.actual_types
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identifier, actual);
    }

    pub fn clear_actual_type(&self, identifier: u64) {
        self.actual_types
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&identifier);
    }

    /// Successful constructions so far
    pub fn constructions(&self) -> u64 {
        self.constructions.load(Ordering::Acquire)
    }

    pub fn vnode(&self, index: NodeIndex) -> Option<Arc<MemVnode>> {
        self.built
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&index)
            .cloned()
    }
}

impl VnodeFactory for MemFactory {
    fn construct(&self, params: &VnodeParams) -> Result<VnodeRef, ConstructError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if let Some(err) = self.faults.should_fault(params.identifier) {
            return Err(err);
        }
        let vtype = self
            .actual_types
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&params.identifier)
            .copied()
            .unwrap_or(params.vtype);
        let vnode = MemVnode::new(params.index, vtype);
        self.built
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(params.index, vnode.clone());
        self.constructions.fetch_add(1, Ordering::AcqRel);
        Ok(vnode as VnodeRef)
    }

    fn supports_special_files(&self) -> bool {
        self.special_files
    }
}

/// Disappearance hook that marks [`MemVnode`]s and remembers what it saw
#[derive(Default)]
pub struct MemDisappear {
    seen: Mutex<Vec<NodeIndex>>,
    factory: Option<Arc<MemFactory>>,
}

impl MemDisappear {
    pub fn new(factory: Arc<MemFactory>) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            factory: Some(factory),
        }
    }

    pub fn disappeared(&self) -> Vec<NodeIndex> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl DisappearHook for MemDisappear {
    fn disappear(&self, vnode: &VnodeRef) {
        let index = vnode.node_index();
        if let Some(mem) = self.factory.as_ref().and_then(|f| f.vnode(index)) {
            mem.mark_disappeared();
        }
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).push(index);
    }
}

/// One name handed to the name cache
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameEntry {
    pub dir: NodeIndex,
    pub vnode: NodeIndex,
    pub name: String,
}

#[derive(Default)]
pub struct MemNameCache {
    entries: Mutex<Vec<NameEntry>>,
}

impl MemNameCache {
    pub fn entries(&self) -> Vec<NameEntry> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl NameCache for MemNameCache {
    fn enter(&self, dir: &VnodeRef, vnode: &VnodeRef, name: &ComponentName) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(NameEntry {
                dir: dir.node_index(),
                vnode: vnode.node_index(),
                name: name.name.clone(),
            });
    }
}

/// The three in-memory collaborators wired together
#[derive(Clone)]
pub struct MemHost {
    pub factory: Arc<MemFactory>,
    pub disappear: Arc<MemDisappear>,
    pub names: Arc<MemNameCache>,
}

impl MemHost {
    pub fn new(factory: MemFactory) -> Self {
        let factory = Arc::new(factory);
        Self {
            disappear: Arc::new(MemDisappear::new(factory.clone())),
            names: Arc::new(MemNameCache::default()),
            factory,
        }
    }

    pub fn hooks(&self) -> HostHooks {
        HostHooks {
            factory: self.factory.clone(),
            disappear: self.disappear.clone(),
            names: self.names.clone(),
        }
    }
}

impl Default for MemHost {
    fn default() -> Self {
        Self::new(MemFactory::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountContext;
    use crate::fault::{FaultPolicy, FaultRule};

    fn params(identifier: u64, vtype: VnodeType) -> VnodeParams {
        VnodeParams {
            mount: MountContext::new(7),
            index: NodeIndex(identifier),
            identifier,
            vtype,
            size: 0,
            parent: None,
            mark_root: false,
            rdev: 0,
            special_ops: false,
        }
    }

    #[test]
    fn factory_honours_type_override_and_faults() {
        let factory = MemFactory::new();
        factory.set_actual_type(9, VnodeType::Regular);
        let vnode = factory.construct(&params(9, VnodeType::Symlink)).unwrap();
        assert_eq!(vnode.vtype(), VnodeType::Regular);
        factory.clear_actual_type(9);
        let vnode = factory.construct(&params(9, VnodeType::Symlink)).unwrap();
        assert_eq!(vnode.vtype(), VnodeType::Symlink);

        factory.faults().set_policy(FaultPolicy {
            enabled: true,
            rules: vec![FaultRule {
                max_faults: Some(1),
                ..FaultRule::default()
            }],
        });
        assert_eq!(
            factory.construct(&params(3, VnodeType::Fifo)).unwrap_err(),
            ConstructError::ResourceExhausted
        );
        assert!(factory.construct(&params(3, VnodeType::Fifo)).is_ok());
        assert_eq!(factory.constructions(), 3);
    }

    #[test]
    fn factory_keeps_retired_vnodes_for_inspection() {
        use crate::config::NodeTableConfig;
        use crate::manager::{NodeManager, VnodeRequest};

        let host = MemHost::default();
        let manager = NodeManager::new(MountContext::new(7), NodeTableConfig::default(), host.hooks())
            .unwrap();
        let root = manager.vget(&VnodeRequest::root(), None).unwrap();
        assert_eq!(manager.unmount(), 1);

        let kept = host.factory.vnode(root.node_index()).expect("vnode retained");
        assert_eq!(kept.vtype(), VnodeType::Directory);
        assert_eq!(manager.stats().vnodes_current, 0);
    }

    #[test]
    fn disappear_marks_built_vnode() {
        let host = MemHost::default();
        let vnode = host.factory.construct(&params(4, VnodeType::Regular)).unwrap();
        host.disappear.disappear(&vnode);
        assert!(host.factory.vnode(NodeIndex(4)).unwrap().is_disappeared());
        assert_eq!(host.disappear.disappeared(), vec![NodeIndex(4)]);
    }
}
