use std::ops::{Range, RangeBounds};

use bitflags::bitflags;
use log::debug;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::{MrHandle, PdHandle, Resource, ResourceId, ResourceKind};
use crate::Context;

/// Granularity of the addresses handed out to memory regions.
pub const PAGE_SIZE: u64 = 4096;

bitflags! {
    /// Access flags for use with `QueuePair` and `MemoryRegion`.
    ///
    /// Local read access is always enabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct AccessFlags: u32 {
        /// The device may write to the region (required to receive into it).
        const LOCAL_WRITE = 1;
        /// Remote peers may write to the region.
        const REMOTE_WRITE = 1 << 1;
        /// Remote peers may read from the region.
        const REMOTE_READ = 1 << 2;
        /// Remote peers may perform atomic operations on the region.
        const REMOTE_ATOMIC = 1 << 3;
    }
}

/// Default access flags.
pub const DEFAULT_ACCESS_FLAGS: AccessFlags = AccessFlags::LOCAL_WRITE
    .union(AccessFlags::REMOTE_WRITE)
    .union(AccessFlags::REMOTE_READ);

/// A scatter/gather element: a contiguous slice of a registered memory region.
///
/// Obtained through [`MemoryRegion::slice`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Sge {
    /// Start address of the slice.
    pub addr: u64,
    /// Length of the slice in bytes.
    pub length: u32,
    /// Local key of the region the slice belongs to.
    pub lkey: u32,
}

impl Sge {
    /// Get the length of the slice.
    pub fn len(&self) -> usize {
        self.length as usize
    }

    /// Returns true if the element covers zero bytes.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

/// A memory region that has been registered for use with RDMA.
///
/// The region owns its bytes. They are read by sends and written by receives, and can be
/// accessed through [`Context::mr_bytes`] and [`Context::mr_bytes_mut`].
#[derive(Debug)]
pub struct MemoryRegion {
    pd: PdHandle,
    addr: u64,
    lkey: u32,
    rkey: u32,
    access: AccessFlags,
    data: Vec<u8>,
}

impl Resource for MemoryRegion {
    const KIND: ResourceKind = ResourceKind::MemoryRegion;

    fn depends_on(&self, target: ResourceId) -> bool {
        target == ResourceId::ProtectionDomain(self.pd)
    }
}

#[allow(clippy::len_without_is_empty)]
impl MemoryRegion {
    /// The protection domain this region was registered in.
    pub fn pd(&self) -> PdHandle {
        self.pd
    }

    /// Start address of the region. Always a multiple of [`PAGE_SIZE`].
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Length of the region in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// The local key, used in scatter/gather elements.
    pub fn lkey(&self) -> u32 {
        self.lkey
    }

    /// The remote key, handed to peers for direct memory access.
    pub fn rkey(&self) -> u32 {
        self.rkey
    }

    /// The access rights the region was registered with.
    pub fn access(&self) -> AccessFlags {
        self.access
    }

    /// The registered bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Make a scatter/gather element for a subslice of this region.
    ///
    /// # Errors
    ///
    ///  - `InvalidArgument`: the range is empty or extends past the end of the region.
    pub fn slice(&self, bounds: impl RangeBounds<usize>) -> Result<Sge> {
        let (addr, length) = calc_addr_len(bounds, self.addr, self.data.len())?;
        Ok(Sge {
            addr,
            length,
            lkey: self.lkey,
        })
    }

    /// The byte range of this region covered by `sge`, if `sge` lies entirely inside it.
    pub(crate) fn range_of(&self, sge: &Sge) -> Option<Range<usize>> {
        if sge.lkey != self.lkey || sge.addr < self.addr {
            return None;
        }
        let start = usize::try_from(sge.addr - self.addr).ok()?;
        let end = start.checked_add(sge.len())?;
        (end <= self.data.len()).then_some(start..end)
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

fn calc_addr_len(
    bounds: impl RangeBounds<usize>,
    addr: u64,
    bytes_len: usize,
) -> Result<(u64, u32)> {
    let start = match bounds.start_bound() {
        std::ops::Bound::Included(i) => Some(*i),
        std::ops::Bound::Excluded(i) => i.checked_add(1),
        std::ops::Bound::Unbounded => Some(0),
    };
    let end = match bounds.end_bound() {
        std::ops::Bound::Included(i) => i.checked_add(1),
        std::ops::Bound::Excluded(i) => Some(*i),
        std::ops::Bound::Unbounded => Some(bytes_len),
    };
    let (start, end) = start
        .zip(end)
        .filter(|&(start, end)| start < end && end <= bytes_len)
        .ok_or(Error::InvalidArgument("slice is empty or outside the region"))?;
    let length = u32::try_from(end - start)
        .map_err(|_| Error::InvalidArgument("slice longer than 4 GiB"))?;
    Ok((addr + start as u64, length))
}

impl Context {
    /// Allocates and registers a zeroed Memory Region (MR) of `len` bytes in `pd`.
    ///
    /// Every successful registration results in an MR with unique (within this context) `lkey`
    /// and `rkey` values, and a page-aligned start address.
    ///
    /// # Errors
    ///
    ///  - `InvalidArgument` (`EINVAL`): `len` is 0, or remote write or remote atomic access was
    ///    requested without local write access.
    ///  - `StaleHandle`: `pd` is not a live protection domain of this context.
    ///  - `ContextClosed`: the context was closed.
    pub fn reg_mr(&mut self, pd: PdHandle, len: usize, access: AccessFlags) -> Result<MrHandle> {
        self.register(pd, vec![0; len], access)
    }

    /// Registers already initialized bytes as a Memory Region (MR) in `pd`.
    ///
    /// See [`Context::reg_mr`].
    pub fn register(
        &mut self,
        pd: PdHandle,
        data: impl Into<Vec<u8>>,
        access: AccessFlags,
    ) -> Result<MrHandle> {
        self.check_open()?;
        self.graph.pds.get(pd)?;
        let data = data.into();
        if data.is_empty() {
            return Err(Error::InvalidArgument("memory region must not be empty"));
        }
        if access.intersects(AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_ATOMIC)
            && !access.contains(AccessFlags::LOCAL_WRITE)
        {
            return Err(Error::InvalidArgument(
                "remote write access requires local write access",
            ));
        }

        let addr = self.alloc_addr(data.len());
        let lkey = self.alloc_key();
        let rkey = self.alloc_key();
        let len = data.len();
        let mr = self.graph.mrs.insert(MemoryRegion {
            pd,
            addr,
            lkey,
            rkey,
            access,
            data,
        });
        debug!(
            "registered {:?}: {} bytes at {:#x}, lkey {:#x}, access {:?}",
            mr, len, addr, lkey, access
        );
        Ok(mr)
    }

    /// Look up a memory region.
    pub fn mr(&self, mr: MrHandle) -> Result<&MemoryRegion> {
        self.graph.mrs.get(mr)
    }

    /// The bytes of a memory region.
    pub fn mr_bytes(&self, mr: MrHandle) -> Result<&[u8]> {
        Ok(self.graph.mrs.get(mr)?.bytes())
    }

    /// The bytes of a memory region, for filling send buffers.
    pub fn mr_bytes_mut(&mut self, mr: MrHandle) -> Result<&mut [u8]> {
        Ok(self.graph.mrs.get_mut(mr)?.bytes_mut())
    }

    /// Make a scatter/gather element covering `bounds` of a memory region.
    ///
    /// # Errors
    ///
    ///  - `InvalidArgument`: the range is empty or extends past the end of the region.
    ///  - `StaleHandle`: `mr` is not a live memory region of this context.
    pub fn mr_slice(&self, mr: MrHandle, bounds: impl RangeBounds<usize>) -> Result<Sge> {
        self.graph.mrs.get(mr)?.slice(bounds)
    }
}
