// SPDX-License-Identifier: MPL-2.0

//! Controller bring-up and one-shot command helpers.
//!
//! Refer to NVM Express Base Specification Revision 2.0, Section 3.5
//! (Controller Initialization). The controller is disabled, the admin
//! queue rings are allocated and DMA-mapped, AQA/ASQ/ACQ are programmed
//! and the controller is re-enabled with the host page size and the
//! standard entry sizes. I/O queue pairs are created and deleted through
//! admin commands on the admin queue.

use std::{
    ffi::c_void,
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};

use super::{
    QueuePair, cmd,
    cmd::{NvmeCommand, NvmeCompletion},
    queue::{CompletionQueue, SubmissionQueue},
    regs::{
        CC_ENABLE, CC_IOCQES_SHIFT, CC_IOSQES_SHIFT, CC_MPS_SHIFT, CSTS_FATAL, CSTS_READY, Cap,
        Doorbell, NvmeRegs32, NvmeRegs64,
    },
    rq::{CID_AER, RequestPool},
};
use crate::{
    Error, Result,
    iommu::IommuContext,
    mem::{self, Pages},
    vfio::BarMapping,
};

/// Highest I/O queue id the controller hands out.
const MAX_IO_QID: u16 = 64;

/// Controller bring-up options.
#[derive(Debug, Clone, Copy)]
pub struct CtrlOpts {
    /// Admin queue depth; a power of two.
    pub aq_depth: u32,
    /// Wire completion interrupts to eventfds. Without them (or on devices
    /// that cannot deliver them) completions are reaped by polling only.
    pub enable_irqs: bool,
}

impl Default for CtrlOpts {
    fn default() -> Self {
        Self {
            aq_depth: 32,
            enable_irqs: true,
        }
    }
}

/// An NVMe controller driven through a DMA transport.
pub struct Controller {
    ctx: Arc<IommuContext>,
    bar: Arc<BarMapping>,
    dstrd: u16,
    pgshift: u32,
    mqes: u32,
    timeout_ms: u64,
    adminq: QueuePair,
    irq_fds: Vec<std::os::unix::io::OwnedFd>,
    qids: Vec<bool>,
}

impl Controller {
    /// Opens the device group `name` and initializes the controller.
    pub fn open(name: &str, opts: CtrlOpts) -> Result<Self> {
        Self::with_context(Arc::new(IommuContext::open(name)?), opts)
    }

    /// Initializes the controller behind an existing context.
    pub fn with_context(ctx: Arc<IommuContext>, opts: CtrlOpts) -> Result<Self> {
        if !opts.aq_depth.is_power_of_two() || opts.aq_depth < 2 {
            return Err(Error::InvalidArgs);
        }

        let bar = Arc::new(ctx.map_bar(0)?);
        let cap = Cap(bar.read64(NvmeRegs64::Cap as usize));
        let dstrd = cap.dstrd();
        let mqes = cap.mqes();
        let timeout_ms = cap.timeout_ms().max(500);

        let pgshift = mem::page_shift();
        if pgshift < cap.mpsmin_shift() || pgshift > cap.mpsmax_shift() {
            debug!(
                "host page shift {} outside controller range [{}, {}]",
                pgshift,
                cap.mpsmin_shift(),
                cap.mpsmax_shift()
            );
            return Err(Error::Unsupported);
        }
        if opts.aq_depth > mqes {
            return Err(Error::InvalidArgs);
        }

        // Quiesce the controller before touching the admin queue registers.
        let cc = bar.read32(NvmeRegs32::Cc as usize);
        if cc & CC_ENABLE != 0 {
            bar.write32(NvmeRegs32::Cc as usize, cc & !CC_ENABLE);
        }
        Self::wait_ready(&bar, false, timeout_ms)?;

        let adminq = Self::alloc_queue_pair(&ctx, &bar, 0, opts.aq_depth, dstrd)?;
        bar.write32(
            NvmeRegs32::Aqa as usize,
            (opts.aq_depth - 1) << 16 | (opts.aq_depth - 1),
        );
        bar.write64(NvmeRegs64::Asq as usize, adminq.sq.iova());
        bar.write64(NvmeRegs64::Acq as usize, adminq.cq.iova());

        let cc = 4 << CC_IOCQES_SHIFT
            | 6 << CC_IOSQES_SHIFT
            | (pgshift - 12) << CC_MPS_SHIFT
            | CC_ENABLE;
        bar.write32(NvmeRegs32::Cc as usize, cc);
        Self::wait_ready(&bar, true, timeout_ms)?;
        info!(
            "controller enabled (vs {:#x})",
            bar.read32(NvmeRegs32::Vs as usize)
        );

        let mut ctrl = Self {
            ctx,
            bar,
            dstrd,
            pgshift,
            mqes,
            timeout_ms,
            adminq,
            irq_fds: Vec::new(),
            qids: vec![false; MAX_IO_QID as usize],
        };

        if opts.enable_irqs {
            match ctrl.grow_irqs(1) {
                Ok(()) => {
                    let efd = std::os::unix::io::AsRawFd::as_raw_fd(&ctrl.irq_fds[0]);
                    ctrl.adminq.cq.set_eventfd(efd);
                }
                Err(Error::Unsupported) => {
                    debug!("interrupts unsupported; reaping by polling only");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(ctrl)
    }

    /// The memory page shift the controller was configured with.
    pub fn pgshift(&self) -> u32 {
        self.pgshift
    }

    pub fn ctx(&self) -> &Arc<IommuContext> {
        &self.ctx
    }

    fn wait_ready(bar: &BarMapping, ready: bool, timeout_ms: u64) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let csts = bar.read32(NvmeRegs32::Csts as usize);
            if csts & CSTS_FATAL != 0 {
                error!("controller fatal status");
                return Err(Error::Io(std::io::Error::from_raw_os_error(libc::EIO)));
            }
            if (csts & CSTS_READY != 0) == ready {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::TimedOut);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Allocates the rings and request records of one queue pair and maps
    /// them sticky for DMA.
    fn alloc_queue_pair(
        ctx: &IommuContext,
        bar: &Arc<BarMapping>,
        qid: u16,
        depth: u32,
        dstrd: u16,
    ) -> Result<QueuePair> {
        let sq_mem = Pages::alloc_n(depth as usize, size_of::<NvmeCommand>())?;
        let cq_mem = Pages::alloc_n(depth as usize, size_of::<NvmeCompletion>())?;
        let prp_mem = Pages::alloc_n(depth as usize, mem::page_size())?;

        let sq_iova = ctx.map_vaddr(sq_mem.as_ptr(), sq_mem.len())?;
        let cq_iova = ctx.map_vaddr(cq_mem.as_ptr(), cq_mem.len())?;
        let prp_iova = ctx.map_vaddr(prp_mem.as_ptr(), prp_mem.len())?;

        Ok(QueuePair {
            id: qid,
            sq: SubmissionQueue::new(
                sq_mem,
                sq_iova,
                depth,
                qid,
                Arc::clone(bar),
                Doorbell::SqTail.offset(qid, dstrd),
            ),
            cq: CompletionQueue::new(
                cq_mem,
                cq_iova,
                depth,
                qid,
                Arc::clone(bar),
                Doorbell::CqHead.offset(qid, dstrd),
            ),
            pool: RequestPool::new(depth, prp_mem, prp_iova),
        })
    }

    fn unmap_queue_memory(&self, qp: &QueuePair) {
        for addr in [
            qp.sq.ring_addr(),
            qp.cq.ring_addr(),
            qp.pool.prp_region_addr(),
        ] {
            if let Err(e) = self.ctx.unmap_vaddr(addr) {
                debug!("failed to unmap queue memory: {}", e);
            }
        }
    }

    fn alloc_qid(&mut self) -> Result<u16> {
        let slot = self
            .qids
            .iter()
            .position(|used| !used)
            .ok_or(Error::NoMemory)?;
        self.qids[slot] = true;
        Ok(slot as u16 + 1)
    }

    /// Ensures `count` interrupt vectors are wired to eventfds.
    fn grow_irqs(&mut self, count: usize) -> Result<()> {
        while self.irq_fds.len() < count {
            self.irq_fds.push(crate::vfio::eventfd()?);
        }
        let fds: Vec<_> = self
            .irq_fds
            .iter()
            .map(|fd| std::os::unix::io::AsRawFd::as_raw_fd(fd))
            .collect();
        self.ctx.set_irqs(&fds)
    }

    /// Creates an I/O queue pair of the given depth on the device and
    /// returns it to the caller.
    pub fn create_queue_pair(&mut self, depth: u32) -> Result<QueuePair> {
        if !depth.is_power_of_two() || depth < 2 || depth > self.mqes {
            return Err(Error::InvalidArgs);
        }

        let qid = self.alloc_qid()?;
        let mut qp = match Self::alloc_queue_pair(&self.ctx, &self.bar, qid, depth, self.dstrd) {
            Ok(qp) => qp,
            Err(e) => {
                self.qids[qid as usize - 1] = false;
                return Err(e);
            }
        };

        // Completion interrupts are optional; the vector shares the queue
        // id when they are wired.
        let iv = if !self.irq_fds.is_empty() && self.grow_irqs(qid as usize + 1).is_ok() {
            let efd = std::os::unix::io::AsRawFd::as_raw_fd(&self.irq_fds[qid as usize]);
            qp.cq.set_eventfd(efd);
            Some(qid)
        } else {
            None
        };

        let create_cq = cmd::create_io_completion_queue(qid, depth, qp.cq.iova(), iv);
        if let Err(e) = self.admin(create_cq, None) {
            self.unmap_queue_memory(&qp);
            self.qids[qid as usize - 1] = false;
            return Err(e);
        }

        let create_sq = cmd::create_io_submission_queue(qid, depth, qp.sq.iova(), qid);
        if let Err(e) = self.admin(create_sq, None) {
            if let Err(de) = self.admin(cmd::delete_io_completion_queue(qid), None) {
                warn!("failed to delete completion queue {}: {}", qid, de);
            }
            self.unmap_queue_memory(&qp);
            self.qids[qid as usize - 1] = false;
            return Err(e);
        }

        Ok(qp)
    }

    /// Deletes an I/O queue pair on the device and releases its memory.
    pub fn delete_queue_pair(&mut self, qp: QueuePair) -> Result<()> {
        let qid = qp.id();
        self.admin(cmd::delete_io_submission_queue(qid), None)?;
        self.admin(cmd::delete_io_completion_queue(qid), None)?;
        self.unmap_queue_memory(&qp);
        self.qids[qid as usize - 1] = false;
        Ok(())
    }

    /// Executes one command on `qp` and spins for its completion.
    ///
    /// A buffer, if any, is mapped ephemerally for the duration of the
    /// round-trip and described to the device through PRPs. Spurious
    /// completions observed while spinning are logged and skipped. A
    /// cleanup failure never masks the primary error.
    pub fn oneshot(
        &self,
        qp: &mut QueuePair,
        sqe: NvmeCommand,
        buf: Option<&mut [u8]>,
    ) -> Result<NvmeCompletion> {
        oneshot_on(&self.ctx, self.pgshift, qp, sqe, buf)
    }

    /// [`oneshot`](Self::oneshot) on the admin queue.
    pub fn admin(&mut self, sqe: NvmeCommand, buf: Option<&mut [u8]>) -> Result<NvmeCompletion> {
        let Self {
            ctx,
            pgshift,
            adminq,
            ..
        } = self;
        oneshot_on(ctx, *pgshift, adminq, sqe, buf)
    }

    /// Submits an Asynchronous Event Request and returns immediately.
    ///
    /// `opaque` is stored on the request record and surfaced again by
    /// [`reap_event`](Self::reap_event) when the controller posts the
    /// event.
    pub fn aer(&mut self, opaque: *mut c_void) -> Result<()> {
        let mut rq = self.adminq.pool.acquire_atomic().ok_or(Error::Busy)?;
        rq.opaque = opaque;

        let mut sqe = cmd::async_event_request();
        // The marker bit routes the deferred completion; the record-stamped
        // CID of `prepare` must not be used here.
        sqe.cid = rq.cid() | CID_AER;
        drop(rq);

        self.adminq.sq.exec(&sqe);
        Ok(())
    }

    /// Reaps one pending asynchronous event from the admin queue, if any.
    ///
    /// Event completions consumed by a concurrent one-shot spin are picked
    /// up here as well; they are deferred, never dropped.
    pub fn reap_event(&mut self) -> Option<(NvmeCompletion, *mut c_void)> {
        loop {
            let cqe = match self.adminq.cq.take_deferred() {
                Some(cqe) => cqe,
                None => {
                    let cqe = self.adminq.cq.get_cqe()?;
                    self.adminq.cq.update_head();
                    cqe
                }
            };

            if cqe.cid & CID_AER == 0 {
                warn!("dropping unexpected admin completion (cid {})", cqe.cid);
                continue;
            }

            // SAFETY: the completion names an in-flight AER record; no
            // handle to it has existed since submission returned.
            let rq = unsafe { self.adminq.pool.from_cid(cqe.cid & !CID_AER)? };
            let opaque = rq.opaque;
            self.adminq.pool.release_atomic(rq);
            return Some((cqe, opaque));
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if !self.irq_fds.is_empty() {
            if let Err(e) = self.ctx.disable_irqs() {
                debug!("failed to disable irqs: {}", e);
            }
        }

        // Stop the controller before its admin rings go away.
        let cc = self.bar.read32(NvmeRegs32::Cc as usize);
        if cc & CC_ENABLE != 0 {
            self.bar.write32(NvmeRegs32::Cc as usize, cc & !CC_ENABLE);
            if let Err(e) = Self::wait_ready(&self.bar, false, self.timeout_ms) {
                debug!("controller did not quiesce on shutdown: {}", e);
            }
        }

        self.unmap_queue_memory(&self.adminq);
    }
}

/// The one-shot engine shared by [`Controller::oneshot`] and
/// [`Controller::admin`].
fn oneshot_on(
    ctx: &IommuContext,
    pgshift: u32,
    qp: &mut QueuePair,
    mut sqe: NvmeCommand,
    buf: Option<&mut [u8]>,
) -> Result<NvmeCompletion> {
    let mut rq = qp.pool.acquire_atomic().ok_or(Error::Busy)?;

    let mut mapping = None;
    if let Some(buf) = buf {
        let m = match ctx.map_vaddr_ephemeral(buf.as_mut_ptr(), buf.len()) {
            Ok(m) => m,
            Err(e) => {
                qp.pool.release_atomic(rq);
                return Err(e);
            }
        };
        if let Err(e) = rq.map_prp(&mut sqe, m.iova, buf.len(), pgshift) {
            if let Err(ue) = ctx.unmap_ephemeral(&m) {
                error!("failed to unmap ephemeral iova: {}", ue);
            }
            qp.pool.release_atomic(rq);
            return Err(e);
        }
        mapping = Some(m);
    }

    rq.prepare(&mut sqe);
    qp.sq.exec(&sqe);

    let reaped = loop {
        match qp.cq.spin(sqe.cid) {
            Ok(cqe) => break Ok(cqe),
            Err(Error::Again) => {
                error!("spurious cqe (cq {})", qp.cq.qid());
                continue;
            }
            Err(e) => break Err(e),
        }
    };

    let mut result = reaped.and_then(|cqe| cqe.result().map(|_| cqe));

    if let Some(m) = mapping {
        if let Err(e) = ctx.unmap_ephemeral(&m) {
            error!("failed to unmap ephemeral iova: {}", e);
            if result.is_ok() {
                result = Err(e);
            }
        }
    }
    qp.pool.release_atomic(rq);

    result
}
