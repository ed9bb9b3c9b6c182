// SPDX-License-Identifier: MPL-2.0

//! The pluggable DMA transport.
//!
//! A transport attaches the process to the kernel passthrough facility for
//! one device, programs the IOMMU with `(vaddr, len, iova)` translations,
//! wires device interrupts to eventfds and maps device BARs. Two backends
//! implement [`DmaTransport`]:
//!
//! - [`iommufd`]: the file-descriptor based IOMMU interface, preferred when
//!   `/dev/vfio/devices` exists (the kernel was built with
//!   `CONFIG_VFIO_DEVICE_CDEV=y`);
//! - [`container`]: the legacy group/container interface.
//!
//! The choice is made once per process: a failed capability probe marks the
//! preferred backend broken for the lifetime of the process.

pub(crate) mod bindings;
mod container;
mod device;
mod iommufd;

use std::{
    fs,
    os::unix::io::{FromRawFd, OwnedFd, RawFd},
    path::{Path, PathBuf},
    sync::OnceLock,
};

use log::{debug, info};

pub use device::BarMapping;

use crate::{Error, Result, iommu::IovaRange};

/// The narrow interface the IOMMU context drives a device group through.
///
/// Implementations own every descriptor involved and release them in
/// dependency order on drop (device before group before container).
pub trait DmaTransport: Send + Sync {
    /// Kernel-permitted IOVA intervals, possibly empty if unknown.
    fn iova_ranges(&self) -> &[IovaRange];

    /// Programs the IOMMU so the device sees `iova..iova + len` translating
    /// to the physical backing of `vaddr`.
    fn map(&self, vaddr: *mut u8, len: usize, iova: u64) -> Result<()>;

    fn unmap(&self, iova: u64, len: usize) -> Result<()>;

    /// Binds one eventfd per interrupt vector, starting at vector 0.
    fn set_irqs(&self, eventfds: &[RawFd]) -> Result<()>;

    fn disable_irqs(&self) -> Result<()>;

    /// Resets the device, failing with [`Error::Unsupported`] if the device
    /// does not advertise the capability.
    fn reset(&self) -> Result<()>;

    /// Maps a device region (a PCI BAR) into the process.
    fn map_bar(&self, index: u32) -> Result<BarMapping>;
}

/// Whether the iommufd backend is unavailable on this kernel.
///
/// Probed once per process, the way a C library would do it in a
/// constructor: `/dev/vfio/devices` must exist and be a directory.
fn iommufd_broken() -> bool {
    static BROKEN: OnceLock<bool> = OnceLock::new();
    *BROKEN.get_or_init(|| {
        let broken = !Path::new("/dev/vfio/devices").is_dir();
        if broken {
            info!("iommufd broken; probably missing CONFIG_VFIO_DEVICE_CDEV=y");
        }
        broken
    })
}

/// How the caller identified the device group.
#[derive(Debug)]
enum DeviceId {
    /// A PCI address such as `0000:01:00.0`.
    Bdf(String),
    /// An IOMMU group number or `/dev/vfio/<n>` path.
    Group(PathBuf),
    /// An explicit `/dev/vfio/devices/vfioN` character device.
    Cdev(PathBuf),
}

fn parse_name(name: &str) -> DeviceId {
    if name.starts_with("/dev/vfio/devices/") {
        DeviceId::Cdev(PathBuf::from(name))
    } else if name.starts_with("/dev/vfio/") {
        DeviceId::Group(PathBuf::from(name))
    } else if name.parse::<u32>().is_ok() {
        DeviceId::Group(PathBuf::from(format!("/dev/vfio/{}", name)))
    } else {
        DeviceId::Bdf(name.to_string())
    }
}

/// Resolves the iommufd character device of a PCI function via sysfs.
fn cdev_of_bdf(bdf: &str) -> Option<PathBuf> {
    let vfio_dev = format!("/sys/bus/pci/devices/{}/vfio-dev", bdf);
    let entry = fs::read_dir(vfio_dev).ok()?.flatten().next()?;
    Some(PathBuf::from("/dev/vfio/devices").join(entry.file_name()))
}

/// Resolves the VFIO group file of a PCI function via sysfs.
fn group_of_bdf(bdf: &str) -> Result<PathBuf> {
    let link = fs::read_link(format!("/sys/bus/pci/devices/{}/iommu_group", bdf))?;
    let group = link.file_name().ok_or(Error::InvalidArgs)?;
    Ok(PathBuf::from("/dev/vfio").join(group))
}

/// Picks the name of some device in an IOMMU group via sysfs.
fn device_in_group(group_path: &Path) -> Result<String> {
    let group = group_path.file_name().ok_or(Error::InvalidArgs)?;
    let devices = PathBuf::from("/sys/kernel/iommu_groups")
        .join(group)
        .join("devices");
    let entry = fs::read_dir(devices)?
        .flatten()
        .next()
        .ok_or(Error::InvalidArgs)?;
    entry
        .file_name()
        .into_string()
        .map_err(|_| Error::InvalidArgs)
}

/// Opens the transport for the device group identified by `name`.
///
/// `name` may be a PCI address (`0000:01:00.0`), an IOMMU group number or
/// `/dev/vfio/<n>` path, or an explicit `/dev/vfio/devices/vfioN` path.
pub(crate) fn open(name: &str) -> Result<Box<dyn DmaTransport>> {
    match parse_name(name) {
        DeviceId::Cdev(path) => {
            if iommufd_broken() {
                return Err(Error::Unsupported);
            }
            Ok(Box::new(iommufd::IommufdTransport::open(&path)?))
        }
        DeviceId::Group(path) => {
            let device = device_in_group(&path)?;
            Ok(Box::new(container::LegacyTransport::open(&path, &device)?))
        }
        DeviceId::Bdf(bdf) => {
            if !iommufd_broken() {
                if let Some(cdev) = cdev_of_bdf(&bdf) {
                    debug!("using iommufd cdev {} for {}", cdev.display(), bdf);
                    return Ok(Box::new(iommufd::IommufdTransport::open(&cdev)?));
                }
            }
            let group = group_of_bdf(&bdf)?;
            Ok(Box::new(container::LegacyTransport::open(&group, &bdf)?))
        }
    }
}

/// Finds some passthrough-bound device to use as the process default.
pub(crate) fn default_name() -> Result<String> {
    if !iommufd_broken() {
        if let Ok(entries) = fs::read_dir("/dev/vfio/devices") {
            if let Some(entry) = entries.flatten().next() {
                return Ok(entry.path().to_string_lossy().into_owned());
            }
        }
    }
    for entry in fs::read_dir("/dev/vfio")?.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().parse::<u32>().is_ok() {
            return Ok(entry.path().to_string_lossy().into_owned());
        }
    }
    Err(Error::Unsupported)
}

/// Creates an eventfd suitable for interrupt delivery.
pub(crate) fn eventfd() -> Result<OwnedFd> {
    // SAFETY: eventfd has no memory-safety preconditions.
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    // SAFETY: the descriptor was just created and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_parsing() {
        assert!(matches!(parse_name("0000:01:00.0"), DeviceId::Bdf(_)));
        assert!(matches!(parse_name("17"), DeviceId::Group(_)));
        assert!(matches!(parse_name("/dev/vfio/17"), DeviceId::Group(_)));
        assert!(matches!(
            parse_name("/dev/vfio/devices/vfio0"),
            DeviceId::Cdev(_)
        ));
    }

    #[test]
    fn group_number_expands_to_dev_path() {
        let DeviceId::Group(path) = parse_name("3") else {
            panic!("expected a group id");
        };
        assert_eq!(path, PathBuf::from("/dev/vfio/3"));
    }
}
