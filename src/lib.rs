//! A behavioral model of the RDMA "verbs" resource, work request and completion semantics.
//!
//! `libibverbs` lets userspace processes drive RDMA hardware through a small set of "verbs":
//! open a device, allocate a protection domain, register memory, create completion queues and
//! queue pairs, post work requests and reap work completions. This crate implements those same
//! verbs against an in-process device, so that programs (and conformance scenarios) can check
//! verbs-level protocol outcomes without RDMA hardware or a fabric:
//!
//!  - destroying resources out of dependency order is refused with [`Error::ResourceBusy`], and
//!    the resource stays usable until the blocker is removed;
//!  - work request lists that loop back on themselves are rejected before anything is posted;
//!  - completion queues can be armed for a single notification event on a completion channel,
//!    whose file descriptor can be polled like the real one;
//!  - memory region access rights are honored when a frame is scattered into receive buffers.
//!
//! Frames that leave a raw packet queue pair are plain Ethernet/IPv4/UDP byte buffers; see the
//! [`packet`] module for the codec and [`scenario`] for helpers that move frames between
//! contexts and check completions.
//!
//! Resources are referred to by typed, generation-checked [`Handle`]s. A handle is only a name:
//! the resource itself is owned by the [`Context`] that created it, and every verb is a method on
//! that context.
//!
//! For more information on RDMA verbs, see the [InfiniBand Architecture Specification][infini]
//! vol. 1, especially chapter 11, and the upstream [`libibverbs/verbs.h`] file for the C
//! definitions, as well as the manpages for the `ibv_*` methods. Most of the per-verb
//! documentation here follows [RDMAmojo].
//!
//! # Thread safety
//!
//! A `Context` is a single logical actor: every verb takes `&self` or `&mut self`, and two
//! contexts share no state. Move a context to another thread to use it there.
//!
//! [`libibverbs/verbs.h`]: https://github.com/linux-rdma/rdma-core/blob/master/libibverbs/verbs.h
//! [infini]: http://www.infinibandta.org/content/pages.php?pg=technology_public_specification
//! [RDMAmojo]: http://www.rdmamojo.com/

#![deny(missing_docs)]
#![warn(rust_2018_idioms)]
// avoid warnings about RDMAmojo, iWARP, InfiniBand, etc. not being in backticks
#![allow(clippy::doc_markdown)]

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use log::{debug, warn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

mod arena;
mod cq;
mod error;
mod graph;
mod mr;
pub mod packet;
mod qp;
pub mod scenario;
mod wr;

pub use arena::Handle;
pub use cq::{
    CompletionChannel, CompletionQueue, WaitPolicy, WcFlags, WcOpcode, WcStatus, WorkCompletion,
};
pub use error::{Error, Result};
pub use graph::{
    Blocker, ChannelHandle, CqHandle, MembershipHandle, MrHandle, PdHandle, ProtectionDomain,
    QpHandle, ResourceId, ResourceKind,
};
pub use mr::{AccessFlags, MemoryRegion, Sge, DEFAULT_ACCESS_FLAGS, PAGE_SIZE};
pub use qp::{
    MulticastMembership, QpAttr, QpAttrMask, QpCaps, QpState, QpType, QueuePair,
    QueuePairBuilder, QueuePairEndpoint,
};
pub use wr::{
    Delivery, Fault, OutboundFrame, Packet, PostError, RecvWr, SendFlags, SendOpcode, SendWr,
    WrList,
};

/// The only physical port of the model device.
pub const PORT_NUM: u8 = 1;

/// Mellanox Technologies, the OUI of the simulated device GUIDs.
const MODEL_OUI: u64 = 0x00_02_c9;

static NEXT_GUID: AtomicU64 = AtomicU64::new(1);
static NEXT_CONTEXT: AtomicU32 = AtomicU32::new(1);

/// Get list of available RDMA devices.
///
/// The model always exposes a single device with [`DeviceAttr::default`] limits. Build a
/// [`DeviceList`] from [`Device::new`] to model other hardware.
pub fn devices() -> DeviceList {
    DeviceList(vec![Device::new("mlx5_0", DeviceAttr::default())])
}

/// List of available RDMA devices.
#[must_use]
#[derive(Debug, Clone, Default)]
pub struct DeviceList(Vec<Device>);

impl DeviceList {
    /// Returns an iterator over all found devices.
    pub fn iter(&self) -> std::slice::Iter<'_, Device> {
        self.0.iter()
    }

    /// Returns the number of devices.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no devices.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the device at the given `index`, or `None` if out of bounds.
    pub fn get(&self, index: usize) -> Option<&Device> {
        self.0.get(index)
    }

    /// Opens the first device of the list.
    ///
    /// # Errors
    ///
    ///  - `NoDevice` (`ENODEV`): the list is empty, or the first device cannot be opened.
    pub fn open_first(&self) -> Result<Context> {
        self.0.first().ok_or(Error::NoDevice)?.open()
    }
}

impl From<Vec<Device>> for DeviceList {
    fn from(devices: Vec<Device>) -> Self {
        DeviceList(devices)
    }
}

impl<'a> IntoIterator for &'a DeviceList {
    type Item = &'a Device;
    type IntoIter = std::slice::Iter<'a, Device>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Device limits, as reported by `ibv_query_device`.
///
/// These are read once when a [`Context`] is opened and are fixed for its lifetime.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct DeviceAttr {
    /// Maximum number of entries in a completion queue.
    pub max_cqe: u32,
    /// Maximum number of outstanding work requests on any work queue.
    pub max_qp_wr: u32,
    /// Maximum number of scatter/gather entries per work request.
    pub max_sge: u32,
    /// Maximum number of bytes a send request may carry inline.
    pub max_inline_data: u32,
    /// Number of completion vectors available for completion queues.
    pub num_comp_vectors: u32,
    /// Number of physical ports.
    pub phys_port_cnt: u8,
}

impl Default for DeviceAttr {
    fn default() -> Self {
        DeviceAttr {
            max_cqe: 4_194_303,
            max_qp_wr: 32_768,
            max_sge: 30,
            max_inline_data: 512,
            num_comp_vectors: 8,
            phys_port_cnt: 1,
        }
    }
}

impl DeviceAttr {
    /// The deepest queue that both a completion queue and a work queue of this device can hold.
    pub fn pool_size(&self) -> u32 {
        self.max_cqe.min(self.max_qp_wr)
    }
}

/// A Global unique identifier for ibv.
///
/// ibverbs stores the GUID in network order (big endian), while a `u64` is stored in host
/// endianness, so the bytes are kept as they appear on the wire.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Default, Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct Guid {
    raw: [u8; 8],
}

impl Guid {
    /// Upper 24 bits of the GUID are OUI (Organizationally Unique Identifier,
    /// http://standards-oui.ieee.org/oui/oui.txt). The function returns OUI as
    /// a 24-bit number inside a u32.
    pub fn oui(&self) -> u32 {
        let padded = [0, self.raw[0], self.raw[1], self.raw[2]];
        u32::from_be_bytes(padded)
    }

    /// Returns `true` if this GUID is all zeroes, which is considered reserved.
    pub fn is_reserved(&self) -> bool {
        self.raw == [0; 8]
    }
}

impl From<u64> for Guid {
    fn from(guid: u64) -> Self {
        Self {
            raw: guid.to_be_bytes(),
        }
    }
}

impl From<Guid> for u64 {
    fn from(guid: Guid) -> Self {
        u64::from_be_bytes(guid.raw)
    }
}

/// A Global identifier for ibv.
///
/// The 16 bytes are laid out like `union ibv_gid`: the first eight are the subnet prefix and
/// the last eight the interface id, both big endian. Multicast group ids are gids too; see
/// [`packet::multicast_gid`].
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Default, Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct Gid {
    raw: [u8; 16],
}

impl Gid {
    /// The raw bytes of the gid.
    pub fn raw(&self) -> &[u8; 16] {
        &self.raw
    }

    /// Expose the subnet_prefix component of the `Gid` as a u64.
    pub fn subnet_prefix(&self) -> u64 {
        let mut prefix = [0; 8];
        prefix.copy_from_slice(&self.raw[..8]);
        u64::from_be_bytes(prefix)
    }

    /// Expose the interface_id component of the `Gid` as a u64.
    pub fn interface_id(&self) -> u64 {
        let mut id = [0; 8];
        id.copy_from_slice(&self.raw[8..]);
        u64::from_be_bytes(id)
    }
}

impl From<Gid> for [u8; 16] {
    fn from(gid: Gid) -> Self {
        gid.raw
    }
}

impl From<[u8; 16]> for Gid {
    fn from(raw: [u8; 16]) -> Self {
        Self { raw }
    }
}

/// An RDMA device.
#[derive(Debug, Clone)]
pub struct Device {
    name: String,
    guid: Guid,
    attr: DeviceAttr,
}

impl Device {
    /// Describe a device with the given name and limits. Each device gets a fresh GUID.
    pub fn new(name: impl Into<String>, attr: DeviceAttr) -> Self {
        let serial = NEXT_GUID.fetch_add(1, Ordering::Relaxed);
        Device {
            name: name.into(),
            guid: Guid::from((MODEL_OUI << 40) | serial),
            attr,
        }
    }

    /// Replace the GUID of this device.
    pub fn with_guid(mut self, guid: Guid) -> Self {
        self.guid = guid;
        self
    }

    /// Opens an RMDA device and creates a context for further use.
    ///
    /// This context will later be used to query its resources or for creating resources.
    ///
    /// # Errors
    ///
    ///  - `NoDevice` (`ENODEV`): the device has no physical port or no completion vector.
    pub fn open(&self) -> Result<Context> {
        Context::with_device(self.clone())
    }

    /// Returns the name associated with this RDMA device.
    ///
    /// This name is unique within a specific machine, but not across a fabric. Use the device
    /// GUID, returned by [`Device::guid`], to tell devices apart.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the Global Unique IDentifier (GUID) of this RDMA device.
    ///
    /// # Errors
    ///
    ///  - `NoDevice` (`ENODEV`): the GUID is reserved (all zeroes).
    pub fn guid(&self) -> Result<Guid> {
        if self.guid.is_reserved() {
            Err(Error::NoDevice)
        } else {
            Ok(self.guid)
        }
    }

    /// The limits this device reports.
    pub fn attr(&self) -> &DeviceAttr {
        &self.attr
    }
}

/// An RDMA context bound to a device.
///
/// The context owns every resource created through it. Resources are destroyed explicitly, in
/// reverse dependency order; see [`Context::destroy`].
#[must_use]
pub struct Context {
    id: u32,
    device: Device,
    lid: u16,
    pub(crate) graph: graph::ResourceGraph,
    closed: bool,
    next_key: u32,
    next_qp_num: u32,
    next_addr: u64,
}

impl Context {
    /// Opens a context for the given device.
    fn with_device(device: Device) -> Result<Context> {
        let attr = device.attr;
        if attr.phys_port_cnt == 0 || attr.num_comp_vectors == 0 {
            return Err(Error::NoDevice);
        }

        let id = NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed);
        debug!("opened context {} on {} ({:?})", id, device.name, attr);
        Ok(Context {
            id,
            lid: (id % 0xbfff) as u16 + 1,
            device,
            graph: graph::ResourceGraph::new(id),
            closed: false,
            next_key: 0x100,
            next_qp_num: 0x40,
            next_addr: 0x10_0000,
        })
    }

    /// Identifier of this context. Every handle it issues carries it.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The device this context was opened on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Query the device limits.
    ///
    /// # Errors
    ///
    ///  - `ContextClosed`: the context was closed.
    pub fn query_device(&self) -> Result<DeviceAttr> {
        self.check_open()?;
        Ok(self.device.attr)
    }

    /// The local identifier assigned to the port of this context.
    pub fn lid(&self) -> u16 {
        self.lid
    }

    /// Close the context.
    ///
    /// # Errors
    ///
    ///  - `ResourceBusy` (`EBUSY`): a protection domain, completion queue or completion channel
    ///    is still live. The context stays open.
    ///  - `ContextClosed`: the context was already closed.
    pub fn close(&mut self) -> Result<()> {
        self.check_open()?;
        if let Some(blocker) = self.graph.blocker(None) {
            warn!("refusing to close context {}: {}", self.id, blocker);
            return Err(Error::ResourceBusy {
                target: ResourceKind::Context,
                blocker,
            });
        }
        self.closed = true;
        debug!("closed context {}", self.id);
        Ok(())
    }

    /// Returns `true` once [`Context::close`] has succeeded.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::ContextClosed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn alloc_key(&mut self) -> u32 {
        let key = self.next_key;
        self.next_key = self.next_key.wrapping_add(1);
        key
    }

    pub(crate) fn alloc_qp_num(&mut self) -> u32 {
        let num = self.next_qp_num;
        // qp numbers are 24 bits wide
        self.next_qp_num = (self.next_qp_num + 1) & 0x00ff_ffff;
        num
    }

    /// Reserve a page-aligned model address range of `len` bytes.
    pub(crate) fn alloc_addr(&mut self, len: usize) -> u64 {
        let addr = self.next_addr;
        let pages = (len as u64).div_ceil(PAGE_SIZE).max(1);
        self.next_addr += pages * PAGE_SIZE;
        addr
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if !self.closed && !self.graph.is_empty() {
            warn!(
                "context {} dropped with live resources ({:?})",
                self.id,
                self.graph.blocker(None)
            );
        }
    }
}
