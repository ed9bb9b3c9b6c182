// SPDX-License-Identifier: MPL-2.0

//! Userspace NVMe driver library on top of VFIO passthrough.
//!
//! The host kernel exposes the device's configuration and BAR regions as
//! file-backed memory, delivers interrupts through eventfds and programs an
//! IOMMU so that device-issued DMA goes through a process-private address
//! space. This crate mediates between user memory and device-visible I/O
//! virtual addresses (IOVAs) and implements the NVMe queue protocol on top
//! of those mappings.
//!
//! The crate is organized in three layers:
//!
//! - [`vfio`]: the pluggable DMA transport. Programs the IOMMU, wires
//!   interrupts to eventfds and maps device BARs, through either the legacy
//!   group/container interface or the iommufd character device.
//! - [`iommu`]: the [`IommuContext`](iommu::IommuContext). Owns the
//!   kernel-permitted IOVA ranges, the sticky and ephemeral IOVA allocators
//!   and a concurrent index from virtual-address interval to mapping.
//! - [`nvme`]: the queue engine. Submission/completion rings over DMA-mapped
//!   pages, a per-queue request pool keyed by command identifier, PRP
//!   building and a controller facade with one-shot admin helpers.
//!
//! Refer to NVM Express Base Specification Revision 2.0 for the protocol
//! details referenced throughout.

pub mod error;
pub mod iommu;
pub mod mem;
pub mod nvme;
pub mod vfio;

pub use error::{Error, Result};
