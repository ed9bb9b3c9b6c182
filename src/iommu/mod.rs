// SPDX-License-Identifier: MPL-2.0

//! The IOMMU context: IOVA allocation and DMA mapping bookkeeping.
//!
//! An [`IommuContext`] owns the kernel-permitted IOVA ranges of one device
//! group, the allocators carving IOVAs out of them and an ordered index of
//! the live sticky mappings. Mappings come in two lifetime classes:
//!
//! - *sticky* mappings are pinned on first use and live until explicitly
//!   unmapped or the context is torn down; they are discoverable by virtual
//!   address in the hot I/O path;
//! - *ephemeral* mappings live across a single device round-trip. They are
//!   unmapped eagerly but their IOVAs are not reused until the last live
//!   ephemeral mapping is gone, at which point the watermark resets.
//!
//! Multiple threads may use one context concurrently. A mutex serializes
//! the allocator cursors, another the mapping index; the live-ephemeral
//! counter is a release/acquire atomic so the unmap that drops the count to
//! zero happens-before the watermark recycle.

mod iova;
pub(crate) mod map;

use std::{
    os::unix::io::RawFd,
    sync::{
        Mutex,
        atomic::{AtomicU32, Ordering, fence},
    },
};

use bitflags::bitflags;
use log::{debug, error};

pub use iova::IovaRange;

use crate::{
    Error, Result,
    vfio::{self, BarMapping, DmaTransport},
};

bitflags! {
    /// Lifetime class of a DMA mapping.
    pub struct MappingFlags: u32 {
        /// Pinned for reuse until explicitly unmapped.
        const STICKY = 1 << 0;
        /// Single device round-trip; batch-recyclable IOVA.
        const EPHEMERAL = 1 << 1;
    }
}

/// A DMA mapping: a virtual-address interval and the IOVA it translates to.
#[derive(Debug, Clone, Copy)]
pub struct Mapping {
    pub vaddr: usize,
    pub len: usize,
    pub iova: u64,
    pub flags: MappingFlags,
}

/// One device group's IOVA space and mapping table.
pub struct IommuContext {
    transport: Box<dyn DmaTransport>,
    alloc: Mutex<iova::IovaAllocator>,
    map: Mutex<map::IovaMap>,
    nephemeral: AtomicU32,
}

impl IommuContext {
    /// Attaches to the device group identified by `name`.
    ///
    /// `name` may be a PCI address, an IOMMU group number or path, or an
    /// iommufd character-device path; the transport backend is chosen
    /// accordingly (see [`crate::vfio`]).
    pub fn open(name: &str) -> Result<Self> {
        Ok(Self::with_transport(vfio::open(name)?))
    }

    /// Attaches to the first passthrough-bound device group found.
    pub fn open_default() -> Result<Self> {
        Self::open(&vfio::default_name()?)
    }

    /// Builds a context over a caller-supplied transport.
    pub fn with_transport(transport: Box<dyn DmaTransport>) -> Self {
        let ranges = transport.iova_ranges().to_vec();
        Self {
            transport,
            alloc: Mutex::new(iova::IovaAllocator::new(ranges)),
            map: Mutex::new(map::IovaMap::new()),
            nephemeral: AtomicU32::new(0),
        }
    }

    /// The kernel-permitted IOVA intervals of this context.
    pub fn iova_ranges(&self) -> Vec<IovaRange> {
        self.alloc.lock().unwrap().ranges().to_vec()
    }

    /// Maps `len` bytes at `vaddr` for DMA with a sticky lifetime and
    /// returns the assigned IOVA.
    ///
    /// Mapping an address that is already covered returns the existing
    /// translation instead of creating a second mapping. `len` must be a
    /// positive multiple of the page size.
    pub fn map_vaddr(&self, vaddr: *mut u8, len: usize) -> Result<u64> {
        if let Some(iova) = self.vaddr_to_iova(vaddr) {
            return Ok(iova);
        }

        let iova = self.alloc.lock().unwrap().alloc_sticky(len as u64)?;

        if let Err(e) = self.transport.map(vaddr, len, iova) {
            debug!("failed to map dma: {}", e);
            return Err(e);
        }

        self.map.lock().unwrap().insert(Mapping {
            vaddr: vaddr as usize,
            len,
            iova,
            flags: MappingFlags::STICKY,
        })?;

        Ok(iova)
    }

    /// Tears down the sticky mapping containing `vaddr`.
    pub fn unmap_vaddr(&self, vaddr: *mut u8) -> Result<()> {
        let m = self
            .find_mapping(vaddr as usize)
            .ok_or(Error::InvalidArgs)?;

        if let Err(e) = self.transport.unmap(m.iova, m.len) {
            debug!("failed to unmap dma: {}", e);
            return Err(e);
        }

        self.map.lock().unwrap().remove(m.vaddr)?;
        Ok(())
    }

    /// Maps `len` bytes at `vaddr` for one device round-trip.
    ///
    /// The returned [`Mapping`] must be handed back to
    /// [`unmap_ephemeral`](Self::unmap_ephemeral) once the device is done
    /// with the buffer. Ephemeral mappings are not entered into the lookup
    /// index.
    pub fn map_vaddr_ephemeral(&self, vaddr: *mut u8, len: usize) -> Result<Mapping> {
        if len == 0 {
            return Err(Error::InvalidArgs);
        }

        let iova = {
            let mut alloc = self.alloc.lock().unwrap();
            let iova = alloc.alloc_ephemeral(len)?;
            self.nephemeral.fetch_add(1, Ordering::Relaxed);
            iova
        };

        if let Err(e) = self.transport.map(vaddr, len, iova) {
            error!("failed to map ephemeral dma: {}", e);
            self.ephemeral_put();
            return Err(e);
        }

        Ok(Mapping {
            vaddr: vaddr as usize,
            len,
            iova,
            flags: MappingFlags::EPHEMERAL,
        })
    }

    /// Tears down an ephemeral mapping.
    pub fn unmap_ephemeral(&self, mapping: &Mapping) -> Result<()> {
        self.transport.unmap(mapping.iova, mapping.len)?;
        self.ephemeral_put();
        Ok(())
    }

    /// Drops one live-ephemeral reference, recycling the watermark when the
    /// batch drains.
    fn ephemeral_put(&self) {
        if self.nephemeral.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            self.alloc.lock().unwrap().recycle_ephemeral();
        }
    }

    /// Resolves a virtual address to its device-visible IOVA.
    pub fn vaddr_to_iova(&self, vaddr: *const u8) -> Option<u64> {
        let vaddr = vaddr as usize;
        let m = self.find_mapping(vaddr)?;
        Some(m.iova + (vaddr - m.vaddr) as u64)
    }

    fn find_mapping(&self, vaddr: usize) -> Option<Mapping> {
        self.map.lock().unwrap().find(vaddr)
    }

    /// Tears down every sticky mapping, invoking `f` as each goes away.
    pub fn clear_with<F: FnMut(&Mapping)>(&self, mut f: F) {
        self.map.lock().unwrap().clear_with(|m| {
            if let Err(e) = self.transport.unmap(m.iova, m.len) {
                debug!("failed to unmap dma at teardown: {}", e);
            }
            f(m);
        });
    }

    /// The number of live sticky mappings.
    pub fn num_mappings(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    /// Visits every live sticky mapping in address order.
    ///
    /// Useful for audits; the index is locked for the duration of the
    /// walk.
    pub fn for_each_mapping<F: FnMut(&Mapping)>(&self, f: F) {
        self.map.lock().unwrap().for_each(f);
    }

    pub(crate) fn set_irqs(&self, eventfds: &[RawFd]) -> Result<()> {
        self.transport.set_irqs(eventfds)
    }

    pub(crate) fn disable_irqs(&self) -> Result<()> {
        self.transport.disable_irqs()
    }

    /// Resets the device if it advertises the capability.
    pub fn reset(&self) -> Result<()> {
        self.transport.reset()
    }

    pub(crate) fn map_bar(&self, index: u32) -> Result<BarMapping> {
        self.transport.map_bar(index)
    }

    #[cfg(test)]
    fn audit(&self) {
        let mut mappings: Vec<Mapping> = Vec::new();
        self.for_each_mapping(|m| mappings.push(*m));

        let ranges = self.iova_ranges();
        for (i, a) in mappings.iter().enumerate() {
            assert!(
                ranges
                    .iter()
                    .any(|r| r.start <= a.iova && a.iova + a.len as u64 - 1 <= r.last),
                "sticky iova outside every permitted range"
            );
            for b in mappings.iter().skip(i + 1) {
                assert!(
                    a.vaddr + a.len <= b.vaddr || b.vaddr + b.len <= a.vaddr,
                    "virtual intervals overlap"
                );
                assert!(
                    a.iova + a.len as u64 <= b.iova || b.iova + b.len as u64 <= a.iova,
                    "iova intervals overlap"
                );
            }
        }
    }
}

impl Drop for IommuContext {
    fn drop(&mut self) {
        self.clear_with(|_| ());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, atomic::AtomicBool};

    use super::*;
    use crate::mem::{self, Pages};

    /// A transport that accepts every translation without programming
    /// anything.
    #[derive(Default)]
    struct FakeTransport {
        ranges: Vec<IovaRange>,
        fail_map: AtomicBool,
    }

    impl DmaTransport for FakeTransport {
        fn iova_ranges(&self) -> &[IovaRange] {
            &self.ranges
        }

        fn map(&self, _vaddr: *mut u8, _len: usize, _iova: u64) -> Result<()> {
            if self.fail_map.load(Ordering::Relaxed) {
                return Err(Error::Io(std::io::Error::from_raw_os_error(libc::ENOSPC)));
            }
            Ok(())
        }

        fn unmap(&self, _iova: u64, _len: usize) -> Result<()> {
            Ok(())
        }

        fn set_irqs(&self, _eventfds: &[RawFd]) -> Result<()> {
            Err(Error::Unsupported)
        }

        fn disable_irqs(&self) -> Result<()> {
            Err(Error::Unsupported)
        }

        fn reset(&self) -> Result<()> {
            Err(Error::Unsupported)
        }

        fn map_bar(&self, _index: u32) -> Result<BarMapping> {
            Err(Error::Unsupported)
        }
    }

    fn context() -> IommuContext {
        IommuContext::with_transport(Box::new(FakeTransport::default()))
    }

    #[test]
    fn lookup_resolves_interior_offsets() {
        let ctx = context();
        let pgsz = mem::page_size();
        let buf = Pages::alloc(3 * pgsz).unwrap();

        let iova = ctx.map_vaddr(buf.as_ptr(), buf.len()).unwrap();
        assert_eq!(iova, 0x10000);

        // An address one byte past the first page resolves to the matching
        // offset within the mapping.
        let probe = unsafe { buf.as_ptr().add(pgsz + 1) };
        assert_eq!(ctx.vaddr_to_iova(probe), Some(iova + pgsz as u64 + 1));
        assert_eq!(ctx.vaddr_to_iova(unsafe { buf.as_ptr().add(buf.len()) }), None);
    }

    #[test]
    fn mapping_twice_reuses_the_translation() {
        let ctx = context();
        let buf = Pages::alloc(mem::page_size()).unwrap();

        let a = ctx.map_vaddr(buf.as_ptr(), buf.len()).unwrap();
        let b = ctx.map_vaddr(buf.as_ptr(), buf.len()).unwrap();
        assert_eq!(a, b);
        assert_eq!(ctx.num_mappings(), 1);
    }

    #[test]
    fn remapping_after_unmap_yields_a_fresh_iova() {
        let ctx = context();
        let buf = Pages::alloc(mem::page_size()).unwrap();

        let a = ctx.map_vaddr(buf.as_ptr(), buf.len()).unwrap();
        ctx.unmap_vaddr(buf.as_ptr()).unwrap();
        let b = ctx.map_vaddr(buf.as_ptr(), buf.len()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn unmapping_an_unknown_address_fails() {
        let ctx = context();
        assert!(matches!(
            ctx.unmap_vaddr(0x1000 as *mut u8),
            Err(Error::InvalidArgs)
        ));
    }

    #[test]
    fn ephemeral_batch_recycles_when_it_drains() {
        let ctx = context();
        let buf = Pages::alloc(2 * mem::page_size()).unwrap();

        let a = ctx.map_vaddr_ephemeral(buf.as_ptr(), 1).unwrap();
        let b = ctx
            .map_vaddr_ephemeral(unsafe { buf.as_ptr().add(mem::page_size()) }, 1)
            .unwrap();
        assert_ne!(a.iova, b.iova);
        assert!(a.flags.contains(MappingFlags::EPHEMERAL));

        ctx.unmap_ephemeral(&a).unwrap();
        // The batch is still live; the watermark must not have reset.
        let c = ctx.map_vaddr_ephemeral(buf.as_ptr(), 1).unwrap();
        assert!(c.iova < b.iova);

        ctx.unmap_ephemeral(&b).unwrap();
        ctx.unmap_ephemeral(&c).unwrap();
        assert_eq!(ctx.nephemeral.load(Ordering::Relaxed), 0);

        // Counter drained: the next allocation starts from the top again.
        let d = ctx.map_vaddr_ephemeral(buf.as_ptr(), 1).unwrap();
        assert_eq!(d.iova, a.iova);
        ctx.unmap_ephemeral(&d).unwrap();
    }

    #[test]
    fn failed_ephemeral_map_compensates_the_counter() {
        let failing = FakeTransport {
            fail_map: AtomicBool::new(true),
            ..Default::default()
        };
        let ctx = IommuContext::with_transport(Box::new(failing));
        let buf = Pages::alloc(mem::page_size()).unwrap();

        assert!(ctx.map_vaddr_ephemeral(buf.as_ptr(), 1).is_err());
        assert_eq!(ctx.nephemeral.load(Ordering::Relaxed), 0);

        // The watermark was recycled along with the drained counter.
        let mut alloc = ctx.alloc.lock().unwrap();
        let top = alloc.ephemeral_watermark();
        let next = alloc.alloc_ephemeral(1).unwrap();
        assert_eq!(next + mem::page_size() as u64, top);
    }

    #[test]
    fn concurrent_map_unmap_cycles_leave_the_index_empty() {
        const THREADS: usize = 8;
        const CYCLES: usize = 64;

        let ctx = Arc::new(context());
        let mut handles = Vec::new();

        for _ in 0..THREADS {
            let ctx = Arc::clone(&ctx);
            handles.push(std::thread::spawn(move || {
                // Each thread uses its own buffers, so the virtual regions
                // are disjoint by construction.
                let buf = Pages::alloc(2 * mem::page_size()).unwrap();
                for _ in 0..CYCLES {
                    let iova = ctx.map_vaddr(buf.as_ptr(), buf.len()).unwrap();
                    assert_eq!(ctx.vaddr_to_iova(buf.as_ptr()), Some(iova));
                    ctx.unmap_vaddr(buf.as_ptr()).unwrap();
                }
            }));
        }

        for _ in 0..16 {
            ctx.audit();
            std::thread::yield_now();
        }
        for handle in handles {
            handle.join().unwrap();
        }

        ctx.audit();
        assert_eq!(ctx.num_mappings(), 0);
    }
}
