// SPDX-License-Identifier: MPL-2.0

//! The VFIO device-descriptor surface shared by both backends.
//!
//! Once a device file descriptor is obtained (from a group or from the
//! iommufd character device, see the sibling modules), the ioctls on it are
//! identical: device info, per-index interrupt info, eventfd wiring, region
//! info with BAR mmap and device reset.

use std::{
    fs::File,
    mem,
    os::unix::io::{AsRawFd, RawFd},
    ptr::NonNull,
};

use bitflags::bitflags;
use log::debug;

use super::bindings::{self, ioctl, vfio_device_info, vfio_irq_info, vfio_irq_set, vfio_region_info};
use crate::{Error, Result};

bitflags! {
    /// Flags reported by `VFIO_DEVICE_GET_INFO`.
    pub struct DeviceFlags: u32 {
        const RESET = bindings::VFIO_DEVICE_FLAGS_RESET;
        const PCI = bindings::VFIO_DEVICE_FLAGS_PCI;
    }
}

#[derive(Debug, Clone, Copy)]
struct IrqInfo {
    index: u32,
    flags: u32,
    count: u32,
}

/// An open VFIO device descriptor.
#[derive(Debug)]
pub(crate) struct VfioDevice {
    file: File,
    flags: DeviceFlags,
    irq: Option<IrqInfo>,
}

impl VfioDevice {
    /// Queries device and interrupt info on a freshly obtained device fd.
    ///
    /// The interrupt index is the first of MSI-X, MSI and INTx that the
    /// device reports a non-zero vector count for.
    pub(crate) fn new(file: File) -> Result<Self> {
        let fd = file.as_raw_fd();

        let mut info = vfio_device_info {
            argsz: mem::size_of::<vfio_device_info>() as u32,
            ..Default::default()
        };
        // SAFETY: `info` matches the layout VFIO_DEVICE_GET_INFO expects.
        unsafe { ioctl(fd, bindings::VFIO_DEVICE_GET_INFO, &mut info)? };

        let flags = DeviceFlags::from_bits_truncate(info.flags);

        let mut irq = None;
        for index in [
            bindings::VFIO_PCI_MSIX_IRQ_INDEX,
            bindings::VFIO_PCI_MSI_IRQ_INDEX,
            bindings::VFIO_PCI_INTX_IRQ_INDEX,
        ] {
            if index >= info.num_irqs {
                continue;
            }
            let mut irq_info = vfio_irq_info {
                argsz: mem::size_of::<vfio_irq_info>() as u32,
                index,
                ..Default::default()
            };
            // SAFETY: `irq_info` matches the layout the ioctl expects.
            if unsafe { ioctl(fd, bindings::VFIO_DEVICE_GET_IRQ_INFO, &mut irq_info) }.is_err() {
                continue;
            }
            if irq_info.count > 0 {
                irq = Some(IrqInfo {
                    index,
                    flags: irq_info.flags,
                    count: irq_info.count,
                });
                break;
            }
        }
        debug!("device flags {:#x}, irq {:?}", info.flags, irq);

        Ok(Self { file, flags, irq })
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub(crate) fn flags(&self) -> DeviceFlags {
        self.flags
    }

    /// Binds one eventfd per interrupt vector, starting at vector 0.
    pub(crate) fn set_irqs(&self, eventfds: &[RawFd]) -> Result<()> {
        let Some(irq) = self.irq else {
            return Err(Error::Unsupported);
        };
        if irq.flags & bindings::VFIO_IRQ_INFO_EVENTFD == 0 {
            debug!("device irq does not support eventfd");
            return Err(Error::Unsupported);
        }
        if eventfds.is_empty() || eventfds.len() > irq.count as usize {
            return Err(Error::InvalidArgs);
        }

        // The ioctl takes a variable-length struct: header followed by one
        // i32 eventfd per vector.
        let header_size = mem::size_of::<vfio_irq_set>();
        let argsz = header_size + eventfds.len() * mem::size_of::<RawFd>();
        let mut buf = vec![0u8; argsz];

        let header = vfio_irq_set {
            argsz: argsz as u32,
            flags: bindings::VFIO_IRQ_SET_DATA_EVENTFD | bindings::VFIO_IRQ_SET_ACTION_TRIGGER,
            index: irq.index,
            start: 0,
            count: eventfds.len() as u32,
        };
        // SAFETY: `buf` is at least `header_size` bytes and the writes stay
        // in bounds.
        unsafe {
            std::ptr::write_unaligned(buf.as_mut_ptr().cast::<vfio_irq_set>(), header);
            std::ptr::copy_nonoverlapping(
                eventfds.as_ptr().cast::<u8>(),
                buf.as_mut_ptr().add(header_size),
                eventfds.len() * mem::size_of::<RawFd>(),
            );
        }

        // SAFETY: `buf` holds a well-formed vfio_irq_set of `argsz` bytes.
        unsafe { ioctl(self.as_raw_fd(), bindings::VFIO_DEVICE_SET_IRQS, buf.as_mut_ptr())? };
        Ok(())
    }

    pub(crate) fn disable_irqs(&self) -> Result<()> {
        let Some(irq) = self.irq else {
            return Err(Error::Unsupported);
        };
        let mut irq_set = vfio_irq_set {
            argsz: mem::size_of::<vfio_irq_set>() as u32,
            flags: bindings::VFIO_IRQ_SET_DATA_NONE | bindings::VFIO_IRQ_SET_ACTION_TRIGGER,
            index: irq.index,
            start: 0,
            count: 0,
        };
        // SAFETY: `irq_set` matches the layout the ioctl expects.
        unsafe { ioctl(self.as_raw_fd(), bindings::VFIO_DEVICE_SET_IRQS, &mut irq_set)? };
        Ok(())
    }

    pub(crate) fn reset(&self) -> Result<()> {
        if !self.flags.contains(DeviceFlags::RESET) {
            return Err(Error::Unsupported);
        }
        // SAFETY: VFIO_DEVICE_RESET takes no argument.
        unsafe { ioctl(self.as_raw_fd(), bindings::VFIO_DEVICE_RESET, std::ptr::null_mut::<u8>())? };
        Ok(())
    }

    /// Maps a device region (e.g. a PCI BAR) into the process.
    pub(crate) fn map_region(&self, index: u32) -> Result<BarMapping> {
        let mut info = vfio_region_info {
            argsz: mem::size_of::<vfio_region_info>() as u32,
            index,
            ..Default::default()
        };
        // SAFETY: `info` matches the layout the ioctl expects.
        unsafe { ioctl(self.as_raw_fd(), bindings::VFIO_DEVICE_GET_REGION_INFO, &mut info)? };

        if info.flags & bindings::VFIO_REGION_INFO_FLAG_MMAP == 0 || info.size == 0 {
            debug!("region {} is not mappable (flags {:#x})", index, info.flags);
            return Err(Error::Unsupported);
        }

        let mut prot = 0;
        if info.flags & bindings::VFIO_REGION_INFO_FLAG_READ != 0 {
            prot |= libc::PROT_READ;
        }
        if info.flags & bindings::VFIO_REGION_INFO_FLAG_WRITE != 0 {
            prot |= libc::PROT_WRITE;
        }

        // SAFETY: mapping a fresh region of the device fd does not alias any
        // existing Rust object.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                info.size as usize,
                prot,
                libc::MAP_SHARED,
                self.as_raw_fd(),
                info.offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        Ok(BarMapping {
            ptr: NonNull::new(ptr.cast()).unwrap(),
            len: info.size as usize,
        })
    }
}

/// A BAR (or other device region) mapped into the process.
///
/// All accesses are volatile: the memory is device-backed and reads and
/// writes have side effects the compiler must not elide or reorder away.
#[derive(Debug)]
pub struct BarMapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping stays valid for the lifetime of the value; callers
// serialize doorbell accesses through the owning queue.
unsafe impl Send for BarMapping {}
unsafe impl Sync for BarMapping {}

impl BarMapping {
    /// An anonymous stand-in region for exercising register plumbing
    /// without a device.
    #[cfg(test)]
    pub(crate) fn anonymous(len: usize) -> Self {
        // SAFETY: a fresh private anonymous mapping does not alias
        // anything.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert!(ptr != libc::MAP_FAILED);
        Self {
            ptr: NonNull::new(ptr.cast()).unwrap(),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A raw pointer to a 32-bit register inside the mapping.
    pub(crate) fn register32(&self, offset: usize) -> *mut u32 {
        assert!(offset + 4 <= self.len && offset % 4 == 0);
        // SAFETY: the offset was checked to be in bounds.
        unsafe { self.ptr.as_ptr().add(offset).cast() }
    }

    pub fn read32(&self, offset: usize) -> u32 {
        // SAFETY: register32 validated the offset.
        unsafe { self.register32(offset).read_volatile() }
    }

    pub fn write32(&self, offset: usize, value: u32) {
        // SAFETY: register32 validated the offset.
        unsafe { self.register32(offset).write_volatile(value) }
    }

    pub fn read64(&self, offset: usize) -> u64 {
        assert!(offset + 8 <= self.len && offset % 8 == 0);
        // SAFETY: the offset was checked to be in bounds and aligned.
        unsafe { self.ptr.as_ptr().add(offset).cast::<u64>().read_volatile() }
    }

    /// Writes a 64-bit register as a low/high pair of 32-bit stores.
    ///
    /// NVMe controllers accept split accesses to ASQ/ACQ; a single 64-bit
    /// store is not guaranteed to reach PCIe as one transaction anyway.
    pub fn write64(&self, offset: usize, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }
}

impl Drop for BarMapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len denote the live mapping created in `map_region`.
        if unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) } != 0 {
            debug!("munmap of device region failed: {}", std::io::Error::last_os_error());
        }
    }
}
