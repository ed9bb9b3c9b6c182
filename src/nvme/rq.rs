// SPDX-License-Identifier: MPL-2.0

//! Per-queue request records and PRP building.
//!
//! Every submission queue owns an array of request records indexed by
//! command identifier. Free records are linked through a lock-free
//! free-list: acquisition is a compare-and-swap on a tagged head, release
//! pushes back the same way. The tag guards against ABA when two threads
//! race an acquire against a release of the same record.
//!
//! Each record also owns one page for a PRP list, so scatter transfers
//! larger than two pages never allocate on the submission path.

use std::{
    cell::UnsafeCell,
    ffi::c_void,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use super::cmd::NvmeCommand;
use crate::{Error, Result, mem, mem::Pages};

/// Marker bit stamped into the CID of an Asynchronous Event Request.
///
/// Pool CIDs are bounded by the queue depth and stay below this bit.
pub const CID_AER: u16 = 1 << 15;

/// A request record: one in-flight command slot of a submission queue.
#[derive(Debug)]
pub struct Request {
    cid: u16,
    /// Caller context surfaced again when the completion is routed.
    pub opaque: *mut c_void,
    prp_list: *mut u64,
    prp_list_iova: u64,
}

impl Request {
    /// The command identifier of this record.
    pub fn cid(&self) -> u16 {
        self.cid
    }

    /// Stamps the record's CID into `sqe`.
    pub fn prepare(&self, sqe: &mut NvmeCommand) {
        sqe.cid = self.cid;
    }

    /// Fills the data pointer of `sqe` for a DMA-mapped span of `len`
    /// bytes at `iova`, using this record's PRP list page if the span
    /// needs one.
    pub fn map_prp(&mut self, sqe: &mut NvmeCommand, iova: u64, len: usize, pgshift: u32) -> Result<()> {
        let entries = mem::page_size() / size_of::<u64>();
        // SAFETY: the record owns one page of PRP-list memory for its
        // whole lifetime.
        let list = unsafe { std::slice::from_raw_parts_mut(self.prp_list, entries) };
        let (prp1, prp2) = build_prps(iova, len, pgshift, Some((list, self.prp_list_iova)))?;
        sqe.dptr = [prp1, prp2];
        Ok(())
    }
}

/// Translates a DMA-mapped span into PRP entries.
///
/// The span is described by one or two direct entries when it fits, and
/// otherwise by `prp1` plus a PRP list covering the pages after the first;
/// `list` supplies the list page and its IOVA in that case.
///
/// Fails with invalid-argument if `len` is zero, if the offset of `iova`
/// within its page is not 4-byte aligned, or if a needed list page is
/// absent or too small.
pub(crate) fn build_prps(
    iova: u64,
    len: usize,
    pgshift: u32,
    list: Option<(&mut [u64], u64)>,
) -> Result<(u64, u64)> {
    let page_size = 1u64 << pgshift;
    let offset = iova & (page_size - 1);

    if len == 0 || offset & 0x3 != 0 {
        return Err(Error::InvalidArgs);
    }
    let len = len as u64;

    // The whole span sits in the page prp1 points into.
    if offset + len <= page_size {
        return Ok((iova, 0));
    }

    let second_page = (iova & !(page_size - 1)) + page_size;

    // Up to two pages worth of data: prp2 points at the page boundary
    // after prp1.
    if len <= 2 * page_size {
        return Ok((iova, second_page));
    }

    let Some((entries, list_iova)) = list else {
        return Err(Error::InvalidArgs);
    };
    let remaining = len - (page_size - offset);
    let nprps = remaining.div_ceil(page_size) as usize;
    if nprps > entries.len() {
        return Err(Error::InvalidArgs);
    }
    for (i, entry) in entries.iter_mut().take(nprps).enumerate() {
        *entry = second_page + i as u64 * page_size;
    }

    Ok((iova, list_iova))
}

/// The request records of one submission queue, keyed by CID.
#[derive(Debug)]
pub struct RequestPool {
    slots: Box<[UnsafeCell<Request>]>,
    /// Free-list head: `(tag << 32) | (cid + 1)`, zero meaning empty.
    free_head: AtomicU64,
    /// Per-slot successor in the free list, in the same `cid + 1`
    /// encoding.
    free_next: Box<[AtomicU32]>,
    /// Backing for the per-record PRP list pages.
    prp_pages: Pages,
}

// SAFETY: a slot is only reachable through the free-list CAS or through
// the CID of a completion the device posted, never both at once.
unsafe impl Send for RequestPool {}
unsafe impl Sync for RequestPool {}

impl RequestPool {
    /// Builds a pool of `depth` records whose PRP list pages live in
    /// `prp_pages` (one page per record, sticky-mapped at `prp_iova`).
    pub(crate) fn new(depth: u32, prp_pages: Pages, prp_iova: u64) -> Self {
        let page_size = mem::page_size();
        assert!(depth as usize <= (CID_AER as usize));
        assert!(prp_pages.len() >= depth as usize * page_size);

        let slots: Box<[UnsafeCell<Request>]> = (0..depth)
            .map(|cid| {
                // SAFETY: offsets stay within prp_pages.
                let prp_list = unsafe { prp_pages.as_ptr().add(cid as usize * page_size) };
                UnsafeCell::new(Request {
                    cid: cid as u16,
                    opaque: std::ptr::null_mut(),
                    prp_list: prp_list.cast(),
                    prp_list_iova: prp_iova + cid as u64 * page_size as u64,
                })
            })
            .collect();

        // Chain every slot onto the free list in CID order.
        let free_next: Box<[AtomicU32]> = (0..depth)
            .map(|cid| AtomicU32::new(if cid + 1 < depth { cid + 2 } else { 0 }))
            .collect();

        Self {
            slots,
            free_head: AtomicU64::new(1),
            free_next,
            prp_pages,
        }
    }

    pub fn depth(&self) -> u32 {
        self.slots.len() as u32
    }

    pub(crate) fn prp_region_addr(&self) -> *mut u8 {
        self.prp_pages.as_ptr()
    }

    /// Pops a free record, or returns `None` without blocking when every
    /// record is in flight.
    pub fn acquire_atomic(&self) -> Option<RequestHandle<'_>> {
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            let cid1 = (head & 0xFFFF_FFFF) as u32;
            if cid1 == 0 {
                return None;
            }
            let cid = cid1 - 1;
            let next = self.free_next[cid as usize].load(Ordering::Relaxed) as u64;
            let tag = (head >> 32).wrapping_add(1);

            match self.free_head.compare_exchange_weak(
                head,
                tag << 32 | next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(RequestHandle {
                        pool: self,
                        cid: cid as u16,
                    });
                }
                Err(current) => head = current,
            }
        }
    }

    /// Pushes a record back onto the free list.
    pub fn release_atomic(&self, rq: RequestHandle<'_>) {
        self.push(rq.cid);
    }

    fn push(&self, cid: u16) {
        let mut head = self.free_head.load(Ordering::Relaxed);
        loop {
            self.free_next[cid as usize].store((head & 0xFFFF_FFFF) as u32, Ordering::Relaxed);
            let tag = (head >> 32).wrapping_add(1);

            match self.free_head.compare_exchange_weak(
                head,
                tag << 32 | (cid as u64 + 1),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Reattaches the in-flight record a completion names.
    ///
    /// # Safety
    ///
    /// `cid` must identify a record that is currently in flight and not
    /// reachable through any live handle; the AER marker bit must already
    /// be stripped.
    pub(crate) unsafe fn from_cid(&self, cid: u16) -> Option<RequestHandle<'_>> {
        if cid as usize >= self.slots.len() {
            return None;
        }
        Some(RequestHandle { pool: self, cid })
    }
}

/// Exclusive use of one request record.
///
/// Dropping the handle without
/// [`release_atomic`](RequestPool::release_atomic) leaves the record in
/// flight; the completion path reattaches it by CID.
#[derive(Debug)]
pub struct RequestHandle<'a> {
    pool: &'a RequestPool,
    cid: u16,
}

impl Deref for RequestHandle<'_> {
    type Target = Request;

    fn deref(&self) -> &Request {
        // SAFETY: holding the handle implies exclusive use of the slot.
        unsafe { &*self.pool.slots[self.cid as usize].get() }
    }
}

impl DerefMut for RequestHandle<'_> {
    fn deref_mut(&mut self) -> &mut Request {
        // SAFETY: as above.
        unsafe { &mut *self.pool.slots[self.cid as usize].get() }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn pool(depth: u32) -> RequestPool {
        let page_size = mem::page_size();
        let prp_pages = Pages::alloc_n(depth as usize, page_size).unwrap();
        RequestPool::new(depth, prp_pages, 0x40_0000)
    }

    #[test]
    fn acquire_hands_out_distinct_cids_until_empty() {
        let pool = pool(4);
        let mut held = Vec::new();
        let mut cids = Vec::new();

        for _ in 0..4 {
            let rq = pool.acquire_atomic().expect("pool has free records");
            cids.push(rq.cid());
            held.push(rq);
        }
        cids.sort_unstable();
        cids.dedup();
        assert_eq!(cids.len(), 4);

        // Exhausted: busy, not out-of-memory.
        assert!(pool.acquire_atomic().is_none());

        pool.release_atomic(held.pop().unwrap());
        assert!(pool.acquire_atomic().is_some());
    }

    #[test]
    fn concurrent_acquire_release_never_duplicates_a_record() {
        const THREADS: usize = 8;
        const CYCLES: usize = 2000;

        let pool = Arc::new(pool(4));
        let in_use: Arc<[std::sync::atomic::AtomicBool]> =
            (0..4).map(|_| std::sync::atomic::AtomicBool::new(false)).collect();

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let in_use = Arc::clone(&in_use);
                std::thread::spawn(move || {
                    for _ in 0..CYCLES {
                        let Some(rq) = pool.acquire_atomic() else {
                            std::hint::spin_loop();
                            continue;
                        };
                        let slot = rq.cid() as usize;
                        assert!(
                            !in_use[slot].swap(true, Ordering::AcqRel),
                            "record handed out twice"
                        );
                        in_use[slot].store(false, Ordering::Release);
                        pool.release_atomic(rq);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn prp_single_page_span() {
        // A 1-byte buffer at offset 2048 of a 4 KiB page needs prp1 only.
        let (prp1, prp2) = build_prps(0x10800, 1, 12, None).unwrap();
        assert_eq!(prp1, 0x10800);
        assert_eq!(prp2, 0);
    }

    #[test]
    fn prp_two_page_span() {
        // 8192 bytes at offset 2048: prp2 is the page boundary after prp1.
        let (prp1, prp2) = build_prps(0x10800, 8192, 12, None).unwrap();
        assert_eq!(prp1, 0x10800);
        assert_eq!(prp2, 0x11000);
    }

    #[test]
    fn prp_list_span() {
        // 16 KiB at offset 0: a list covering the second, third and
        // fourth pages.
        let mut list = [0u64; 512];
        let (prp1, prp2) = build_prps(0x10000, 16384, 12, Some((&mut list, 0x99000))).unwrap();
        assert_eq!(prp1, 0x10000);
        assert_eq!(prp2, 0x99000);
        assert_eq!(&list[..3], &[0x11000, 0x12000, 0x13000]);
        assert_eq!(list[3], 0);
    }

    #[test]
    fn prp_rejects_bad_arguments() {
        assert!(matches!(build_prps(0x10000, 0, 12, None), Err(Error::InvalidArgs)));
        // Offset within the page not 4-byte aligned.
        assert!(matches!(build_prps(0x10002, 16, 12, None), Err(Error::InvalidArgs)));
        // A span needing a list without one.
        assert!(matches!(
            build_prps(0x10000, 3 * 4096, 12, None),
            Err(Error::InvalidArgs)
        ));
    }

    #[test]
    fn map_prp_fills_the_dptr() {
        let pool = pool(2);
        let mut rq = pool.acquire_atomic().unwrap();
        let mut sqe = NvmeCommand::default();

        rq.map_prp(&mut sqe, 0x10000, 5 * 4096, 12).unwrap();
        assert_eq!(sqe.dptr[0], 0x10000);
        assert_eq!(sqe.dptr[1], rq.prp_list_iova);

        // The record's own list page carries the tail pages.
        let entries =
            unsafe { std::slice::from_raw_parts(rq.prp_list, 4) };
        assert_eq!(entries, &[0x11000, 0x12000, 0x13000, 0x14000]);

        pool.release_atomic(rq);
    }
}
