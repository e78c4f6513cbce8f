//! The process-wide map from descriptor number to the reactor object that
//! owns it (spec §3's "descriptor registry"), plus the secondary map of
//! plain callbacks for foreign fds the loop watches but doesn't own a
//! [`Connection`] for.

use std::os::unix::io::RawFd;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::ready::Ready;

/// Object-safe dispatch surface every `Connection<H>` implements,
/// regardless of its concrete `H`. This is the one piece of runtime
/// dispatch the design calls for: the registry holds heterogeneous
/// connection types behind this vtable, but once it finds the right
/// connection, the call into `H`'s methods is a direct, monomorphized call.
pub(crate) trait ConnectionObject {
    fn fd(&self) -> RawFd;
    fn is_closed(&self) -> bool;
    fn dispatch_read(&self);
    fn dispatch_write(&self);
    fn dispatch_err(&self);
    fn dispatch_hup(&self);
}

pub(crate) type ForeignCallback = Box<dyn FnMut(Ready)>;

#[derive(Default)]
pub(crate) struct Registry {
    connections: IndexMap<RawFd, Rc<dyn ConnectionObject>>,
    foreign: IndexMap<RawFd, ForeignCallback>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            connections: IndexMap::new(),
            foreign: IndexMap::new(),
        }
    }

    pub fn insert(&mut self, fd: RawFd, conn: Rc<dyn ConnectionObject>) {
        self.connections.insert(fd, conn);
    }

    pub fn remove(&mut self, fd: RawFd) -> Option<Rc<dyn ConnectionObject>> {
        self.connections.shift_remove(&fd)
    }

    pub fn get(&self, fd: RawFd) -> Option<&Rc<dyn ConnectionObject>> {
        self.connections.get(&fd)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// `DescriptorMap()`: a read-only snapshot of the live descriptor
    /// numbers, in registration order.
    pub fn descriptor_map(&self) -> Vec<RawFd> {
        self.connections.keys().copied().collect()
    }

    pub fn foreign_get_mut(&mut self, fd: RawFd) -> Option<&mut ForeignCallback> {
        self.foreign.get_mut(&fd)
    }

    pub fn foreign_fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.foreign.keys().copied()
    }

    pub fn foreign_insert(&mut self, fd: RawFd, callback: ForeignCallback) -> Option<ForeignCallback> {
        self.foreign.insert(fd, callback)
    }

    pub fn foreign_remove(&mut self, fd: RawFd) -> Option<ForeignCallback> {
        self.foreign.shift_remove(&fd)
    }

    /// `OtherFds(map)`: swap in a whole new foreign-fd map, returning the
    /// one being replaced.
    pub fn replace_foreign(&mut self, map: IndexMap<RawFd, ForeignCallback>) -> IndexMap<RawFd, ForeignCallback> {
        std::mem::replace(&mut self.foreign, map)
    }
}
