// SPDX-License-Identifier: MPL-2.0

//! NVMe command and completion structures.
//!
//! Refer to NVM Express Base Specification Revision 2.0:
//! - Section 5: Admin Command Set
//! - Section 6: NVM Command Set

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{Error, Result};

/// Phase Tag bit in the completion status field.
pub(crate) const STATUS_PHASE_TAG_MASK: u16 = 0x0001;

/// Status Code, Status Code Type and Do Not Retry bits.
///
/// If any of these is set the command failed; 0x0000 is success.
const STATUS_ERROR_MASK: u16 = 0xFFFE;

/// Admin Command Set opcodes.
///
/// See NVMe Spec 2.0, Section 5 (Admin Command Set).
#[repr(u8)]
enum AdminOpcode {
    /// Delete I/O Submission Queue command. See Section 5.7.
    DeleteIoSq = 0x00,
    /// Create I/O Submission Queue command. See Section 5.5.
    CreateIoSq = 0x01,
    /// Get Log Page command. See Section 5.16.
    GetLogPage = 0x02,
    /// Delete I/O Completion Queue command. See Section 5.6.
    DeleteIoCq = 0x04,
    /// Create I/O Completion Queue command. See Section 5.4.
    CreateIoCq = 0x05,
    /// Identify command. See Section 5.17.
    Identify = 0x06,
    /// Set Features command. See Section 5.27.
    SetFeatures = 0x09,
    /// Get Features command. See Section 5.15.
    GetFeatures = 0x0A,
    /// Asynchronous Event Request command. See Section 5.2.
    AsyncEventRequest = 0x0C,
}

/// I/O Command Set opcodes (NVM Command Set).
#[repr(u8)]
enum IoOpcode {
    Flush = 0x00,
    Write = 0x01,
    Read = 0x02,
}

/// Submission Queue Entry, 64 bytes.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct NvmeCommand {
    /// Opcode.
    pub opcode: u8,
    /// Fused operation and PSDT flags.
    pub flags: u8,
    /// Command identifier.
    pub cid: u16,
    /// Namespace identifier.
    pub nsid: u32,
    /// Reserved.
    pub _rsvd: u64,
    /// Metadata pointer.
    pub mptr: u64,
    /// Data pointer: PRP entry 1 and PRP entry 2.
    pub dptr: [u64; 2],
    /// Command dword 10.
    pub cdw10: u32,
    /// Command dword 11.
    pub cdw11: u32,
    /// Command dword 12.
    pub cdw12: u32,
    /// Command dword 13.
    pub cdw13: u32,
    /// Command dword 14.
    pub cdw14: u32,
    /// Command dword 15.
    pub cdw15: u32,
}

/// Completion Queue Entry, 16 bytes.
///
/// Dword 3 packs the Command Identifier (bits 0-15), the Phase Tag (bit 16)
/// and the Status Field (bits 17-31); the latter two land in
/// [`status`](Self::status) here.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct NvmeCompletion {
    /// Dword 0: command specific.
    pub dword0: u32,
    /// Dword 1: command specific.
    pub dword1: u32,
    /// Submission Queue head pointer at the time of this completion.
    pub sq_head: u16,
    /// Submission Queue identifier.
    pub sq_id: u16,
    /// Command identifier of the completed command.
    pub cid: u16,
    /// Phase tag and status field.
    pub status: u16,
}

impl NvmeCompletion {
    /// The Phase Tag of this entry.
    pub fn phase(&self) -> bool {
        self.status & STATUS_PHASE_TAG_MASK != 0
    }

    /// Whether the Status Code or Do Not Retry bits report a failure.
    pub fn has_error(&self) -> bool {
        self.status & STATUS_ERROR_MASK != 0
    }

    /// The packed Status Code Type and Status Code (bits 1-15).
    pub fn status_code(&self) -> u16 {
        (self.status & STATUS_ERROR_MASK) >> 1
    }

    /// Maps the status field to a result: any non-zero status is an I/O
    /// error.
    pub fn result(&self) -> Result<()> {
        if self.has_error() {
            return Err(Error::Io(std::io::Error::from_raw_os_error(libc::EIO)));
        }
        Ok(())
    }
}

pub fn identify_controller() -> NvmeCommand {
    NvmeCommand {
        opcode: AdminOpcode::Identify as u8,
        cdw10: 1,
        ..Default::default()
    }
}

pub fn identify_namespace(nsid: u32) -> NvmeCommand {
    NvmeCommand {
        opcode: AdminOpcode::Identify as u8,
        nsid,
        ..Default::default()
    }
}

pub fn identify_namespace_list(base: u32) -> NvmeCommand {
    NvmeCommand {
        opcode: AdminOpcode::Identify as u8,
        nsid: base,
        cdw10: 2,
        ..Default::default()
    }
}

/// `len` is the transfer size in bytes and must be a multiple of 4.
pub fn get_log_page(lid: u8, len: usize) -> NvmeCommand {
    let numd = (len / 4 - 1) as u32;
    NvmeCommand {
        opcode: AdminOpcode::GetLogPage as u8,
        cdw10: (numd & 0xFFFF) << 16 | lid as u32,
        cdw11: numd >> 16,
        ..Default::default()
    }
}

pub fn set_features(fid: u8, value: u32) -> NvmeCommand {
    NvmeCommand {
        opcode: AdminOpcode::SetFeatures as u8,
        cdw10: fid as u32,
        cdw11: value,
        ..Default::default()
    }
}

pub fn get_features(fid: u8) -> NvmeCommand {
    NvmeCommand {
        opcode: AdminOpcode::GetFeatures as u8,
        cdw10: fid as u32,
        ..Default::default()
    }
}

pub fn async_event_request() -> NvmeCommand {
    NvmeCommand {
        opcode: AdminOpcode::AsyncEventRequest as u8,
        ..Default::default()
    }
}

/// `size` is the queue depth; the command encodes it zero-based. The ring
/// at `ring_iova` must be physically contiguous. With an interrupt vector
/// the queue is created with interrupts enabled.
pub fn create_io_completion_queue(qid: u16, size: u32, ring_iova: u64, iv: Option<u16>) -> NvmeCommand {
    let cdw11 = match iv {
        Some(vector) => (vector as u32) << 16 | 0b11,
        None => 0b1,
    };
    NvmeCommand {
        opcode: AdminOpcode::CreateIoCq as u8,
        dptr: [ring_iova, 0],
        cdw10: (size - 1) << 16 | qid as u32,
        cdw11,
        ..Default::default()
    }
}

pub fn create_io_submission_queue(qid: u16, size: u32, ring_iova: u64, cqid: u16) -> NvmeCommand {
    NvmeCommand {
        opcode: AdminOpcode::CreateIoSq as u8,
        dptr: [ring_iova, 0],
        cdw10: (size - 1) << 16 | qid as u32,
        cdw11: (cqid as u32) << 16 | 1,
        ..Default::default()
    }
}

pub fn delete_io_completion_queue(qid: u16) -> NvmeCommand {
    NvmeCommand {
        opcode: AdminOpcode::DeleteIoCq as u8,
        cdw10: qid as u32,
        ..Default::default()
    }
}

pub fn delete_io_submission_queue(qid: u16) -> NvmeCommand {
    NvmeCommand {
        opcode: AdminOpcode::DeleteIoSq as u8,
        cdw10: qid as u32,
        ..Default::default()
    }
}

/// Reads `nblocks` logical blocks starting at `lba`. The data pointer is
/// filled separately once the buffer is DMA-mapped.
pub fn io_read(nsid: u32, lba: u64, nblocks: u16) -> NvmeCommand {
    NvmeCommand {
        opcode: IoOpcode::Read as u8,
        nsid,
        cdw10: lba as u32,
        cdw11: (lba >> 32) as u32,
        cdw12: (nblocks - 1) as u32,
        ..Default::default()
    }
}

pub fn io_write(nsid: u32, lba: u64, nblocks: u16) -> NvmeCommand {
    NvmeCommand {
        opcode: IoOpcode::Write as u8,
        nsid,
        cdw10: lba as u32,
        cdw11: (lba >> 32) as u32,
        cdw12: (nblocks - 1) as u32,
        ..Default::default()
    }
}

pub fn io_flush(nsid: u32) -> NvmeCommand {
    NvmeCommand {
        opcode: IoOpcode::Flush as u8,
        nsid,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_have_the_wire_sizes() {
        assert_eq!(std::mem::size_of::<NvmeCommand>(), 64);
        assert_eq!(std::mem::size_of::<NvmeCompletion>(), 16);
    }

    #[test]
    fn create_io_queue_commands_pack_their_dwords() {
        let cmd = create_io_completion_queue(3, 64, 0xdead_b000, Some(3));
        assert_eq!(cmd.opcode, 0x05);
        assert_eq!(cmd.dptr[0], 0xdead_b000);
        assert_eq!(cmd.cdw10, 63 << 16 | 3);
        assert_eq!(cmd.cdw11, 3 << 16 | 0b11);

        let cmd = create_io_submission_queue(3, 64, 0xbeef_0000, 3);
        assert_eq!(cmd.opcode, 0x01);
        assert_eq!(cmd.cdw10, 63 << 16 | 3);
        assert_eq!(cmd.cdw11, 3 << 16 | 1);
    }

    #[test]
    fn io_read_splits_the_lba() {
        let cmd = io_read(1, 0x1_2345_6789, 8);
        assert_eq!(cmd.opcode, 0x02);
        assert_eq!(cmd.cdw10, 0x2345_6789);
        assert_eq!(cmd.cdw11, 0x1);
        assert_eq!(cmd.cdw12, 7);
    }

    #[test]
    fn successful_status_maps_to_ok() {
        let cqe = NvmeCompletion {
            cid: 7,
            status: 0x0001, // phase bit only
            ..Default::default()
        };
        assert!(!cqe.has_error());
        assert!(cqe.result().is_ok());

        let failed = NvmeCompletion {
            status: 0x2 << 1, // Invalid Field in Command
            ..Default::default()
        };
        assert!(failed.has_error());
        assert_eq!(failed.status_code(), 0x2);
        assert!(matches!(failed.result(), Err(Error::Io(_))));
    }
}
