// SPDX-License-Identifier: MPL-2.0

//! The iommufd backend.
//!
//! With `CONFIG_VFIO_DEVICE_CDEV` the device has its own character device
//! under `/dev/vfio/devices/` and the IOMMU is driven through `/dev/iommu`:
//! the device is bound to the iommufd, an I/O address space (IOAS) is
//! allocated and attached, and DMA is programmed with fixed-IOVA map/unmap
//! commands on the IOAS.

use std::{
    fs::{File, OpenOptions},
    mem,
    os::unix::io::AsRawFd,
    path::Path,
};

use log::debug;

use super::{
    DmaTransport,
    bindings::{
        self, ioctl, iommu_ioas_alloc, iommu_ioas_iova_ranges, iommu_ioas_map, iommu_ioas_unmap,
        iommu_iova_range, vfio_device_attach_iommufd_pt, vfio_device_bind_iommufd,
    },
    device::{BarMapping, DeviceFlags, VfioDevice},
};
use crate::{Result, iommu::IovaRange};

/// The iommufd transport.
///
/// The device descriptor is dropped before the iommufd, detaching it from
/// the IOAS before the address space goes away.
#[derive(Debug)]
pub(crate) struct IommufdTransport {
    device: VfioDevice,
    iommufd: File,
    ioas_id: u32,
    ranges: Vec<IovaRange>,
}

impl IommufdTransport {
    /// Opens the device character device at `cdev_path` and attaches it to
    /// a fresh I/O address space.
    pub(crate) fn open(cdev_path: &Path) -> Result<Self> {
        let device_file = OpenOptions::new().read(true).write(true).open(cdev_path)?;
        let iommufd = OpenOptions::new().read(true).write(true).open("/dev/iommu")?;

        let mut bind = vfio_device_bind_iommufd {
            argsz: mem::size_of::<vfio_device_bind_iommufd>() as u32,
            iommufd: iommufd.as_raw_fd(),
            ..Default::default()
        };
        // SAFETY: `bind` matches the layout the ioctl expects.
        unsafe { ioctl(device_file.as_raw_fd(), bindings::VFIO_DEVICE_BIND_IOMMUFD, &mut bind)? };

        let mut alloc = iommu_ioas_alloc {
            size: mem::size_of::<iommu_ioas_alloc>() as u32,
            ..Default::default()
        };
        // SAFETY: `alloc` matches the layout the ioctl expects.
        unsafe { ioctl(iommufd.as_raw_fd(), bindings::IOMMU_IOAS_ALLOC, &mut alloc)? };
        let ioas_id = alloc.out_ioas_id;

        let mut attach = vfio_device_attach_iommufd_pt {
            argsz: mem::size_of::<vfio_device_attach_iommufd_pt>() as u32,
            pt_id: ioas_id,
            ..Default::default()
        };
        // SAFETY: `attach` matches the layout the ioctl expects.
        unsafe {
            ioctl(device_file.as_raw_fd(), bindings::VFIO_DEVICE_ATTACH_IOMMUFD_PT, &mut attach)?
        };

        let ranges = query_iova_ranges(iommufd.as_raw_fd(), ioas_id)?;
        let device = VfioDevice::new(device_file)?;

        Ok(Self {
            device,
            iommufd,
            ioas_id,
            ranges,
        })
    }
}

/// Queries the permitted IOVA ranges of an IOAS.
fn query_iova_ranges(iommufd: i32, ioas_id: u32) -> Result<Vec<IovaRange>> {
    let mut cmd = iommu_ioas_iova_ranges {
        size: mem::size_of::<iommu_ioas_iova_ranges>() as u32,
        ioas_id,
        ..Default::default()
    };

    // First call with no buffer: the kernel reports the count and fails
    // with EMSGSIZE if it is non-zero.
    // SAFETY: `cmd` matches the layout the ioctl expects.
    match unsafe { ioctl(iommufd, bindings::IOMMU_IOAS_IOVA_RANGES, &mut cmd) } {
        Ok(_) => return Ok(Vec::new()),
        Err(e) if e.raw_os_error() == Some(libc::EMSGSIZE) => {}
        Err(e) => return Err(e.into()),
    }

    let mut entries = vec![iommu_iova_range::default(); cmd.num_iovas as usize];
    cmd.allowed_iovas = entries.as_mut_ptr() as u64;
    // SAFETY: `allowed_iovas` points at `num_iovas` writable entries.
    unsafe { ioctl(iommufd, bindings::IOMMU_IOAS_IOVA_RANGES, &mut cmd)? };

    entries.truncate(cmd.num_iovas as usize);
    Ok(entries
        .iter()
        .map(|r| IovaRange {
            start: r.start,
            last: r.last,
        })
        .collect())
}

impl DmaTransport for IommufdTransport {
    fn iova_ranges(&self) -> &[IovaRange] {
        &self.ranges
    }

    fn map(&self, vaddr: *mut u8, len: usize, iova: u64) -> Result<()> {
        let mut cmd = iommu_ioas_map {
            size: mem::size_of::<iommu_ioas_map>() as u32,
            flags: bindings::IOMMU_IOAS_MAP_FIXED_IOVA
                | bindings::IOMMU_IOAS_MAP_WRITEABLE
                | bindings::IOMMU_IOAS_MAP_READABLE,
            ioas_id: self.ioas_id,
            user_va: vaddr as u64,
            length: len as u64,
            iova,
            ..Default::default()
        };
        // SAFETY: `cmd` matches the layout the ioctl expects.
        unsafe { ioctl(self.iommufd.as_raw_fd(), bindings::IOMMU_IOAS_MAP, &mut cmd)? };
        Ok(())
    }

    fn unmap(&self, iova: u64, len: usize) -> Result<()> {
        let mut cmd = iommu_ioas_unmap {
            size: mem::size_of::<iommu_ioas_unmap>() as u32,
            ioas_id: self.ioas_id,
            iova,
            length: len as u64,
        };
        // SAFETY: `cmd` matches the layout the ioctl expects.
        unsafe { ioctl(self.iommufd.as_raw_fd(), bindings::IOMMU_IOAS_UNMAP, &mut cmd)? };
        Ok(())
    }

    fn set_irqs(&self, eventfds: &[std::os::unix::io::RawFd]) -> Result<()> {
        self.device.set_irqs(eventfds)
    }

    fn disable_irqs(&self) -> Result<()> {
        self.device.disable_irqs()
    }

    fn reset(&self) -> Result<()> {
        self.device.reset()
    }

    fn map_bar(&self, index: u32) -> Result<BarMapping> {
        self.device.map_region(index)
    }
}

impl Drop for IommufdTransport {
    fn drop(&mut self) {
        if self.device.flags().contains(DeviceFlags::RESET) {
            if let Err(e) = self.device.reset() {
                debug!("could not reset device on close: {}", e);
            }
        }
    }
}
