//! Resource capability nodes.
//!
//! A resource names a slice of platform authority (an address range, a
//! port range, the root of everything). The core only models the node
//! itself: creation happens at boot when the arch layer builds the
//! resource tree and hands the root to the first process.

use alloc::string::String;
use alloc::sync::Arc;
use core::any::Any;

use borealis_libkern::{ObjectType, Signals};

use crate::objects::{Dispatcher, KObjectBase, StaticObjectType};

lazy_static! {
    /// The root of the resource tree, built at kernel init. The arch
    /// layer hands a handle to it to the first process it creates.
    static ref ROOT_RESOURCE: Arc<ResourceDispatcher> =
        ResourceDispatcher::new(ResourceKind::Root, 0, u64::max_value(), "root");
}

/// The root resource node.
pub fn root_resource() -> Arc<ResourceDispatcher> {
    ROOT_RESOURCE.clone()
}

/// Kinds of resource nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// The root of the resource tree; grants everything.
    Root,
    /// A physical address range.
    Mmio,
    /// An io-port range.
    IoPort,
    /// An interrupt line range.
    Irq,
}

/// A resource capability node.
pub struct ResourceDispatcher {
    /// Base with a tracker so resources can be waited on for
    /// user-signals, which the service manager uses as a rendezvous.
    base: KObjectBase,
    /// What this node grants.
    kind: ResourceKind,
    /// Range start, kind-specific.
    low: u64,
    /// Range end, exclusive, kind-specific.
    high: u64,
    /// Human-readable name, for diagnostics.
    name: String,
}

impl core::fmt::Debug for ResourceDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "ResourceDispatcher {{ koid: {}, kind: {:?}, name: {:?} }}",
            self.base.koid(),
            self.kind,
            self.name
        )
    }
}

impl ResourceDispatcher {
    /// Creates a node.
    pub fn new(kind: ResourceKind, low: u64, high: u64, name: &str) -> Arc<ResourceDispatcher> {
        Arc::new(ResourceDispatcher {
            base: KObjectBase::waitable(Signals::empty(), Signals::user_all()),
            kind,
            low,
            high,
            name: String::from(name),
        })
    }

    /// The node's kind.
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// The `(low, high)` range.
    pub fn range(&self) -> (u64, u64) {
        (self.low, self.high)
    }

    /// The node's name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Dispatcher for ResourceDispatcher {
    fn base(&self) -> &KObjectBase {
        &self.base
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::RESOURCE
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn allowed_user_signals(&self) -> Signals {
        Signals::user_all()
    }
}

impl StaticObjectType for ResourceDispatcher {
    fn static_object_type() -> ObjectType {
        ObjectType::RESOURCE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_grants_everything() {
        let root = root_resource();
        assert_eq!(root.kind(), ResourceKind::Root);
        assert_eq!(root.range(), (0, u64::max_value()));
        assert_eq!(root.name(), "root");
        // The root is a singleton; every caller sees the same koid.
        assert_eq!(root.base().koid(), root_resource().base().koid());
    }

    #[test]
    fn nodes_take_user_signals() {
        let node = ResourceDispatcher::new(ResourceKind::Irq, 3, 4, "irq3");
        let tracker = node.state_tracker().unwrap();
        tracker
            .user_signal(
                Signals::empty(),
                Signals::USER_3,
                node.allowed_user_signals(),
            )
            .unwrap();
        assert!(tracker.state().satisfied().contains(Signals::USER_3));
        assert!(tracker
            .user_signal(Signals::empty(), Signals::SIGNALED, node.allowed_user_signals())
            .is_err());
    }
}
