// SPDX-License-Identifier: MPL-2.0

//! NVMe submission and completion queues.
//!
//! Refer to NVM Express Base Specification Revision 2.0, Section 3.3
//! (Queue Mechanism). Both rings live in contiguous, page-aligned,
//! DMA-mapped memory. The submission side stamps 64-byte entries into the
//! ring and rings the tail doorbell; the completion side consumes 16-byte
//! entries whose phase tag matches the queue's current polarity, toggling
//! the polarity on every wrap.
//!
//! Ordering: the entry store is made globally visible before the tail
//! doorbell write (release fence), and a consumed completion entry is only
//! read after its phase check (acquire fence) since the device writes the
//! ring behind the CPU's back.

use std::{
    collections::VecDeque,
    hint::spin_loop,
    sync::{
        Arc,
        atomic::{Ordering, fence},
    },
    time::{Duration, Instant},
};

use zerocopy::IntoBytes;

use super::{
    cmd::{NvmeCommand, NvmeCompletion},
    rq::CID_AER,
};
use crate::{Error, Result, mem::Pages, vfio::BarMapping};

/// Submission queue.
#[derive(Debug)]
pub struct SubmissionQueue {
    mem: Pages,
    iova: u64,
    depth: u32,
    tail: u32,
    qid: u16,
    bar: Arc<BarMapping>,
    db_offset: usize,
}

impl SubmissionQueue {
    pub(crate) fn new(
        mem: Pages,
        iova: u64,
        depth: u32,
        qid: u16,
        bar: Arc<BarMapping>,
        db_offset: usize,
    ) -> Self {
        assert!(depth.is_power_of_two());
        assert!(mem.len() >= depth as usize * size_of::<NvmeCommand>());
        Self {
            mem,
            iova,
            depth,
            tail: 0,
            qid,
            bar,
            db_offset,
        }
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// The device-visible base address of the ring.
    pub fn iova(&self) -> u64 {
        self.iova
    }

    pub(crate) fn ring_addr(&self) -> *mut u8 {
        self.mem.as_ptr()
    }

    /// Copies `sqe` into the ring at the tail, advances the tail and rings
    /// the tail doorbell.
    ///
    /// Single producer: callers sharing a queue serialize externally; the
    /// request pool bounds how many commands can be outstanding.
    pub fn exec(&mut self, sqe: &NvmeCommand) {
        let offset = self.tail as usize * size_of::<NvmeCommand>();
        self.mem.as_mut_slice()[offset..offset + size_of::<NvmeCommand>()]
            .copy_from_slice(sqe.as_bytes());

        // The entry must be globally visible before the doorbell write
        // makes the new tail visible to the device.
        fence(Ordering::Release);

        self.tail = (self.tail + 1) % self.depth;
        self.bar.write32(self.db_offset, self.tail);
    }
}

/// Completion queue.
#[derive(Debug)]
pub struct CompletionQueue {
    mem: Pages,
    iova: u64,
    depth: u32,
    head: u32,
    phase: bool,
    qid: u16,
    bar: Arc<BarMapping>,
    db_offset: usize,
    efd: Option<std::os::unix::io::RawFd>,
    /// Asynchronous-event completions consumed while spinning for another
    /// command, kept until the event reaper asks for them.
    deferred: VecDeque<NvmeCompletion>,
}

impl CompletionQueue {
    pub(crate) fn new(
        mem: Pages,
        iova: u64,
        depth: u32,
        qid: u16,
        bar: Arc<BarMapping>,
        db_offset: usize,
    ) -> Self {
        assert!(depth.is_power_of_two());
        assert!(mem.len() >= depth as usize * size_of::<NvmeCompletion>());
        Self {
            mem,
            iova,
            depth,
            head: 0,
            phase: true,
            qid,
            bar,
            db_offset,
            efd: None,
            deferred: VecDeque::new(),
        }
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn iova(&self) -> u64 {
        self.iova
    }

    pub(crate) fn ring_addr(&self) -> *mut u8 {
        self.mem.as_ptr()
    }

    pub(crate) fn set_eventfd(&mut self, efd: std::os::unix::io::RawFd) {
        self.efd = Some(efd);
    }

    /// Consumes the next completion entry, or returns `None` if the entry
    /// at the head does not carry the expected phase tag yet.
    ///
    /// The head doorbell is not written here; see
    /// [`update_head`](Self::update_head).
    pub fn get_cqe(&mut self) -> Option<NvmeCompletion> {
        let offset = self.head as usize * size_of::<NvmeCompletion>();
        // SAFETY: the offset is within the ring and the read is volatile
        // because the device writes entries behind the CPU's back.
        let entry = unsafe {
            self.mem
                .as_ptr()
                .add(offset)
                .cast::<NvmeCompletion>()
                .read_volatile()
        };

        if entry.phase() != self.phase {
            return None;
        }

        // The entry payload is only valid once the phase tag matched.
        fence(Ordering::Acquire);

        self.head += 1;
        if self.head == self.depth {
            self.head = 0;
            self.phase = !self.phase;
        }

        Some(entry)
    }

    /// Busy-waits until `n` completions have been consumed.
    ///
    /// This spins on the ring without bound; call it when completions are
    /// known to be imminent, or use [`wait_cqes`](Self::wait_cqes) for a
    /// bounded wait. The caller writes the head doorbell afterwards.
    pub fn get_cqes(&mut self, n: usize) -> Vec<NvmeCompletion> {
        let mut cqes = Vec::with_capacity(n);
        while cqes.len() < n {
            match self.get_cqe() {
                Some(cqe) => cqes.push(cqe),
                None => spin_loop(),
            }
        }
        cqes
    }

    /// Consumes completions into `cqes` until `n` have been observed or
    /// `timeout_ns` nanoseconds have elapsed.
    ///
    /// A zero timeout means wait forever. On timeout the completions
    /// observed so far are retained in `cqes` and [`Error::TimedOut`] is
    /// returned; the count still outstanding is `n - cqes.len()`.
    pub fn wait_cqes(
        &mut self,
        cqes: &mut Vec<NvmeCompletion>,
        n: usize,
        timeout_ns: u64,
    ) -> Result<()> {
        if timeout_ns == 0 {
            cqes.extend(self.get_cqes(n));
            return Ok(());
        }

        let deadline = Instant::now() + Duration::from_nanos(timeout_ns);
        let mut outstanding = n;
        while outstanding > 0 {
            if let Some(cqe) = self.get_cqe() {
                cqes.push(cqe);
                outstanding -= 1;
                continue;
            }
            if Instant::now() >= deadline {
                return Err(Error::TimedOut);
            }
            spin_loop();
        }
        Ok(())
    }

    /// Writes the current head to the head doorbell.
    ///
    /// Called on reap boundaries rather than per entry, so bursty reaps
    /// coalesce their doorbell writes.
    pub fn update_head(&mut self) {
        self.bar.write32(self.db_offset, self.head);
    }

    /// Busy-waits for the completion of the command identified by `cid`.
    ///
    /// A consumed entry carrying the asynchronous-event CID marker belongs
    /// to a command that is deliberately still in flight; it is set aside
    /// for [`take_deferred`](Self::take_deferred) and the wait continues.
    /// Any other foreign CID is spurious and given up with
    /// [`Error::Again`]; the caller decides whether to log and resume
    /// spinning.
    pub fn spin(&mut self, cid: u16) -> Result<NvmeCompletion> {
        loop {
            match self.get_cqe() {
                Some(cqe) => {
                    self.update_head();
                    if cqe.cid == cid {
                        return Ok(cqe);
                    }
                    if cqe.cid & CID_AER != 0 {
                        self.deferred.push_back(cqe);
                        continue;
                    }
                    return Err(Error::Again);
                }
                None => spin_loop(),
            }
        }
    }

    /// Takes the oldest asynchronous-event completion that a spin consumed
    /// on another command's behalf, if any.
    pub fn take_deferred(&mut self) -> Option<NvmeCompletion> {
        self.deferred.pop_front()
    }

    /// Blocks on the interrupt eventfd until the device signals, or until
    /// `timeout_ms` elapses (negative means wait forever).
    pub fn wait_interrupt(&self, timeout_ms: i32) -> Result<()> {
        let Some(efd) = self.efd else {
            return Err(Error::Unsupported);
        };

        let mut pollfd = libc::pollfd {
            fd: efd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: `pollfd` is a single valid entry.
        let ret = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if ret < 0 {
            return Err(Error::last_os_error());
        }
        if ret == 0 {
            return Err(Error::TimedOut);
        }

        let mut counter = 0u64;
        // SAFETY: reading 8 bytes into a u64, the eventfd contract.
        let ret = unsafe {
            libc::read(efd, (&raw mut counter).cast(), size_of::<u64>())
        };
        if ret < 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use zerocopy::FromBytes;

    use super::*;
    use crate::{mem, nvme::regs::Doorbell};

    const DEPTH: u32 = 4;

    fn queue_pair_parts() -> (SubmissionQueue, CompletionQueue) {
        let bar = Arc::new(BarMapping::anonymous(0x2000));
        let sq = SubmissionQueue::new(
            Pages::alloc(DEPTH as usize * 64).unwrap(),
            0x10000,
            DEPTH,
            1,
            Arc::clone(&bar),
            Doorbell::SqTail.offset(1, 0),
        );
        let cq = CompletionQueue::new(
            Pages::alloc(DEPTH as usize * 16).unwrap(),
            0x11000,
            DEPTH,
            1,
            bar,
            Doorbell::CqHead.offset(1, 0),
        );
        (sq, cq)
    }

    /// Pretends to be the controller: posts a completion with the right
    /// phase for the pass the ring is on.
    fn post_cqe(cq: &mut CompletionQueue, slot: u32, pass: u32, cid: u16) {
        let phase = pass % 2 == 0;
        let cqe = NvmeCompletion {
            cid,
            status: phase as u16,
            ..Default::default()
        };
        let offset = slot as usize * 16;
        // SAFETY: the slot is within the ring.
        unsafe {
            cq.mem
                .as_mut_slice()
                .as_mut_ptr()
                .add(offset)
                .cast::<NvmeCompletion>()
                .write_volatile(cqe)
        };
    }

    #[test]
    fn submission_advances_tail_and_rings_the_doorbell() {
        let (mut sq, _cq) = queue_pair_parts();
        let db = Doorbell::SqTail.offset(1, 0);

        let mut sqe = NvmeCommand {
            opcode: 0x06,
            cid: 3,
            ..Default::default()
        };
        sq.exec(&sqe);
        assert_eq!(sq.bar.read32(db), 1);

        let stored = NvmeCommand::read_from_bytes(&sq.mem.as_slice()[..64]).unwrap();
        assert_eq!(stored.opcode, 0x06);
        assert_eq!(stored.cid, 3);

        // The tail wraps modulo the depth.
        for i in 0..DEPTH - 1 {
            sqe.cid = i as u16;
            sq.exec(&sqe);
        }
        assert_eq!(sq.bar.read32(db), 0);
    }

    #[test]
    fn empty_ring_yields_no_cqe() {
        let (_sq, mut cq) = queue_pair_parts();
        assert!(cq.get_cqe().is_none());
    }

    #[test]
    fn phase_tag_flips_on_every_wrap() {
        let (_sq, mut cq) = queue_pair_parts();

        for pass in 0..3u32 {
            for slot in 0..DEPTH {
                post_cqe(&mut cq, slot, pass, (pass * DEPTH + slot) as u16);
            }
            for slot in 0..DEPTH {
                let cqe = cq.get_cqe().expect("entry with the current phase");
                assert_eq!(cqe.cid, (pass * DEPTH + slot) as u16);
            }
            // Entries of the finished pass are stale now.
            assert!(cq.get_cqe().is_none());
        }
    }

    #[test]
    fn head_doorbell_is_written_on_request_only() {
        let (_sq, mut cq) = queue_pair_parts();
        let db = Doorbell::CqHead.offset(1, 0);

        post_cqe(&mut cq, 0, 0, 1);
        post_cqe(&mut cq, 1, 0, 2);
        assert_eq!(cq.get_cqes(2).len(), 2);
        assert_eq!(cq.bar.read32(db), 0);

        cq.update_head();
        assert_eq!(cq.bar.read32(db), 2);
    }

    #[test]
    fn bounded_wait_reports_the_partial_reap() {
        let (_sq, mut cq) = queue_pair_parts();
        post_cqe(&mut cq, 0, 0, 9);

        let mut cqes = Vec::new();
        let err = cq.wait_cqes(&mut cqes, 2, 1_000_000).unwrap_err();
        assert!(matches!(err, Error::TimedOut));
        // The completion observed before the deadline is retained.
        assert_eq!(cqes.len(), 1);
        assert_eq!(cqes[0].cid, 9);
    }

    #[test]
    fn bounded_wait_succeeds_when_everything_is_there() {
        let (_sq, mut cq) = queue_pair_parts();
        post_cqe(&mut cq, 0, 0, 1);
        post_cqe(&mut cq, 1, 0, 2);

        let mut cqes = Vec::new();
        cq.wait_cqes(&mut cqes, 2, 50_000_000).unwrap();
        assert_eq!(cqes.len(), 2);
    }

    #[test]
    fn spin_gives_up_on_a_foreign_completion() {
        let (_sq, mut cq) = queue_pair_parts();
        post_cqe(&mut cq, 0, 0, 5);
        post_cqe(&mut cq, 1, 0, 7);

        // The first entry belongs to someone else; the caller retries and
        // gets its own.
        assert!(matches!(cq.spin(7), Err(Error::Again)));
        let cqe = cq.spin(7).unwrap();
        assert_eq!(cqe.cid, 7);
    }

    #[test]
    fn spin_defers_event_completions_instead_of_dropping_them() {
        let (_sq, mut cq) = queue_pair_parts();
        assert!(cq.take_deferred().is_none());

        post_cqe(&mut cq, 0, 0, 2 | CID_AER);
        post_cqe(&mut cq, 1, 0, 7);

        // The event completion is consumed mid-spin but kept aside; the
        // spin still resolves its own command.
        let cqe = cq.spin(7).unwrap();
        assert_eq!(cqe.cid, 7);

        let event = cq.take_deferred().expect("event completion is kept");
        assert_eq!(event.cid, 2 | CID_AER);
        assert!(cq.take_deferred().is_none());
    }

    #[test]
    fn rings_are_page_aligned() {
        let (sq, cq) = queue_pair_parts();
        assert_eq!(sq.ring_addr() as usize % mem::page_size(), 0);
        assert_eq!(cq.ring_addr() as usize % mem::page_size(), 0);
    }
}
