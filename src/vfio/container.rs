// SPDX-License-Identifier: MPL-2.0

//! The legacy VFIO group/container backend.
//!
//! A container (`/dev/vfio/vfio`) represents one IOMMU address space; a
//! group file is attached to it and the device descriptor is obtained from
//! the group. DMA is programmed through type-1 IOMMU ioctls on the
//! container.

use std::{
    ffi::CString,
    fs::{File, OpenOptions},
    mem,
    os::unix::io::{AsRawFd, FromRawFd},
    path::Path,
};

use log::{debug, info};

use super::{
    DmaTransport,
    bindings::{
        self, ioctl, ioctl_val, vfio_group_status, vfio_info_cap_header,
        vfio_iommu_type1_dma_map, vfio_iommu_type1_dma_unmap, vfio_iommu_type1_info,
        vfio_iommu_type1_info_cap_iova_range, vfio_iova_range,
    },
    device::{BarMapping, DeviceFlags, VfioDevice},
};
use crate::{Error, Result, iommu::IovaRange};

/// The legacy group/container transport.
///
/// Field order doubles as teardown order: the device descriptor is closed
/// before the group, the group before the container.
#[derive(Debug)]
pub(crate) struct LegacyTransport {
    device: VfioDevice,
    #[expect(dead_code)]
    group: File,
    container: File,
    ranges: Vec<IovaRange>,
}

impl LegacyTransport {
    /// Attaches to `group_path` and obtains the descriptor of the device
    /// named `device_name` (a PCI address like `0000:01:00.0`).
    pub(crate) fn open(group_path: &Path, device_name: &str) -> Result<Self> {
        let container = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/vfio/vfio")?;
        let container_fd = container.as_raw_fd();

        // SAFETY: VFIO_GET_API_VERSION takes no argument.
        let version = unsafe { ioctl_val(container_fd, bindings::VFIO_GET_API_VERSION, 0)? };
        if version != bindings::VFIO_API_VERSION {
            debug!("unexpected vfio api version {}", version);
            return Err(Error::Unsupported);
        }

        // Prefer the v2 type-1 IOMMU; fall back to v1.
        let mut iommu_type = bindings::VFIO_TYPE1V2_IOMMU;
        // SAFETY: VFIO_CHECK_EXTENSION takes the extension id by value.
        if unsafe { ioctl_val(container_fd, bindings::VFIO_CHECK_EXTENSION, iommu_type)? } != 1 {
            iommu_type = bindings::VFIO_TYPE1_IOMMU;
            // SAFETY: as above.
            if unsafe { ioctl_val(container_fd, bindings::VFIO_CHECK_EXTENSION, iommu_type)? } != 1 {
                debug!("vfio type 1 iommu not supported");
                return Err(Error::Unsupported);
            }
        }

        let group = OpenOptions::new().read(true).write(true).open(group_path)?;
        let group_fd = group.as_raw_fd();

        let mut status = vfio_group_status {
            argsz: mem::size_of::<vfio_group_status>() as u32,
            ..Default::default()
        };
        // SAFETY: `status` matches the layout the ioctl expects.
        unsafe { ioctl(group_fd, bindings::VFIO_GROUP_GET_STATUS, &mut status)? };
        if status.flags & bindings::VFIO_GROUP_FLAGS_VIABLE == 0 {
            debug!("vfio group is not viable; are all group devices bound to vfio-pci?");
            return Err(Error::InvalidArgs);
        }

        let mut fd_arg = container_fd;
        // SAFETY: the ioctl reads an i32 container fd through the pointer.
        unsafe { ioctl(group_fd, bindings::VFIO_GROUP_SET_CONTAINER, &mut fd_arg)? };
        // SAFETY: VFIO_SET_IOMMU takes the IOMMU type by value.
        unsafe { ioctl_val(container_fd, bindings::VFIO_SET_IOMMU, iommu_type)? };

        let ranges = query_iova_ranges(container_fd)?;

        let name = CString::new(device_name).map_err(|_| Error::InvalidArgs)?;
        // SAFETY: the ioctl reads a NUL-terminated device name and returns a
        // new descriptor.
        let device_fd = unsafe {
            ioctl(group_fd, bindings::VFIO_GROUP_GET_DEVICE_FD, name.as_ptr().cast_mut())?
        };
        // SAFETY: the ioctl returned ownership of a fresh descriptor.
        let device = VfioDevice::new(unsafe { File::from_raw_fd(device_fd) })?;

        Ok(Self {
            device,
            group,
            container,
            ranges,
        })
    }
}

/// Queries type-1 IOMMU info and extracts the permitted-IOVA capability.
///
/// Returns an empty list if the kernel does not report the capability; the
/// caller installs a conservative default then.
fn query_iova_ranges(container_fd: i32) -> Result<Vec<IovaRange>> {
    let mut info = vfio_iommu_type1_info {
        argsz: mem::size_of::<vfio_iommu_type1_info>() as u32,
        ..Default::default()
    };
    // SAFETY: `info` matches the layout the ioctl expects.
    unsafe { ioctl(container_fd, bindings::VFIO_IOMMU_GET_INFO, &mut info)? };

    if info.argsz as usize <= mem::size_of::<vfio_iommu_type1_info>() {
        return Ok(Vec::new());
    }

    // Extended info: retry with the full size the kernel asked for.
    let mut buf = vec![0u8; info.argsz as usize];
    // SAFETY: `buf` is at least as large as the header and zeroed.
    unsafe {
        std::ptr::write_unaligned(
            buf.as_mut_ptr().cast::<vfio_iommu_type1_info>(),
            vfio_iommu_type1_info {
                argsz: info.argsz,
                ..Default::default()
            },
        );
        ioctl(container_fd, bindings::VFIO_IOMMU_GET_INFO, buf.as_mut_ptr())?;
    }

    // SAFETY: the kernel filled at least the fixed-size header.
    let info = unsafe { std::ptr::read_unaligned(buf.as_ptr().cast::<vfio_iommu_type1_info>()) };
    if info.flags & bindings::VFIO_IOMMU_INFO_CAPS == 0 {
        return Ok(Vec::new());
    }

    let mut ranges = Vec::new();
    let mut offset = info.cap_offset as usize;
    while offset != 0 && offset + mem::size_of::<vfio_info_cap_header>() <= buf.len() {
        // SAFETY: the offset was bounds-checked against the kernel-filled
        // buffer.
        let header = unsafe {
            std::ptr::read_unaligned(buf.as_ptr().add(offset).cast::<vfio_info_cap_header>())
        };

        if header.id == bindings::VFIO_IOMMU_TYPE1_INFO_CAP_IOVA_RANGE {
            let cap_size = mem::size_of::<vfio_iommu_type1_info_cap_iova_range>();
            if offset + cap_size > buf.len() {
                break;
            }
            // SAFETY: bounds checked above.
            let cap = unsafe {
                std::ptr::read_unaligned(
                    buf.as_ptr()
                        .add(offset)
                        .cast::<vfio_iommu_type1_info_cap_iova_range>(),
                )
            };
            for i in 0..cap.nr_iovas as usize {
                let entry_offset = offset + cap_size + i * mem::size_of::<vfio_iova_range>();
                if entry_offset + mem::size_of::<vfio_iova_range>() > buf.len() {
                    break;
                }
                // SAFETY: bounds checked above.
                let range = unsafe {
                    std::ptr::read_unaligned(buf.as_ptr().add(entry_offset).cast::<vfio_iova_range>())
                };
                info!("iova range {} is [{:#x}; {:#x}]", i, range.start, range.end);
                ranges.push(IovaRange {
                    start: range.start,
                    last: range.end,
                });
            }
        }

        offset = header.next as usize;
    }

    Ok(ranges)
}

impl DmaTransport for LegacyTransport {
    fn iova_ranges(&self) -> &[IovaRange] {
        &self.ranges
    }

    fn map(&self, vaddr: *mut u8, len: usize, iova: u64) -> Result<()> {
        let mut dma_map = vfio_iommu_type1_dma_map {
            argsz: mem::size_of::<vfio_iommu_type1_dma_map>() as u32,
            flags: bindings::VFIO_DMA_MAP_FLAG_READ | bindings::VFIO_DMA_MAP_FLAG_WRITE,
            vaddr: vaddr as u64,
            iova,
            size: len as u64,
        };
        // SAFETY: `dma_map` matches the layout the ioctl expects.
        unsafe { ioctl(self.container.as_raw_fd(), bindings::VFIO_IOMMU_MAP_DMA, &mut dma_map)? };
        Ok(())
    }

    fn unmap(&self, iova: u64, len: usize) -> Result<()> {
        let mut dma_unmap = vfio_iommu_type1_dma_unmap {
            argsz: mem::size_of::<vfio_iommu_type1_dma_unmap>() as u32,
            iova,
            size: len as u64,
            ..Default::default()
        };
        // SAFETY: `dma_unmap` matches the layout the ioctl expects.
        unsafe {
            ioctl(self.container.as_raw_fd(), bindings::VFIO_IOMMU_UNMAP_DMA, &mut dma_unmap)?
        };
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

impl Drop for LegacyTransport {
    fn drop(&mut self) {
        if self.device.flags().contains(DeviceFlags::RESET) {
            if let Err(e) = self.device.reset() {
                debug!("could not reset device on close: {}", e);
            }
        }
    }
}
