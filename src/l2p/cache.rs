//! # Paged L2P Backend
//!
//! Backs the L2P with a bounded set of resident 4 KiB pages loaded from
//! the L2P region on demand. A page slab sized by the DRAM limit holds
//! page state and an index-linked LRU of unpinned pages; the free pool is
//! kept above an eviction floor so pins rarely stall.
//!
//! Page lifecycle:
//!
//! ```text
//! INIT       -> READY        load from the backing region completed
//! READY      -> IN_FLUSH     eviction of a dirty page
//! READY      -> IN_PERSIST   checkpoint write-back
//! IN_FLUSH   -> (freed)      flush completed with no waiters
//! IN_FLUSH   -> READY        flush completed with new pinners attached
//! IN_PERSIST -> READY
//! *          -> CORRUPTED    page I/O error
//! ```
//!
//! A pin covering non-resident pages either starts loads (slots
//! available) or comes back deferred; the device retries it after
//! eviction frees a slot.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::core::addr::{Addr, AddrCodec};
use crate::core::buf::SharedBuf;
use crate::core::FTL_BLOCK_SIZE;
use crate::device::{IoCompletion, SubmitError};
use crate::l2p::{L2p, L2pCb, L2pError, PinCtx, PinOutcome};
use crate::layout::LayoutRegion;
use crate::md::{Md, MdEnv, MdRef};

/// Most pages one pin request may cover.
pub const L2P_MAX_PAGES_TO_PIN: u64 = 4;

const NIL: usize = usize::MAX;

/// Resident-page lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageState {
    Init,
    Ready,
    InFlush,
    InPersist,
    InClear,
    Corrupted,
}

/// Backend lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheState {
    Running,
    InShutdown,
    ShutdownDone,
}

struct Pinner {
    pages: Vec<u64>,
    pages_ready: usize,
    fault: Option<L2pError>,
    cb: Option<crate::l2p::PinCb>,
}

type PinnerRef = Rc<RefCell<Pinner>>;

struct PageSlot {
    used: bool,
    page_no: u64,
    state: PageState,
    pin_ref_cnt: u64,
    updates: u64,
    on_lru: bool,
    lru_prev: usize,
    lru_next: usize,
    waiters: Vec<PinnerRef>,
}

impl PageSlot {
    fn empty() -> Self {
        PageSlot {
            used: false,
            page_no: 0,
            state: PageState::Init,
            pin_ref_cnt: 0,
            updates: 0,
            on_lru: false,
            lru_prev: NIL,
            lru_next: NIL,
            waiters: Vec::new(),
        }
    }
}

/// Paged backend.
pub struct L2pCache {
    env: MdEnv,
    region: LayoutRegion,
    region_md: MdRef,
    codec: AddrCodec,
    num_lbas: u64,
    lbas_in_page: u64,
    num_pages: u64,

    l2: Vec<Option<usize>>,
    pages: Vec<PageSlot>,
    l1_buf: SharedBuf,
    free_slots: Vec<usize>,
    lru_head: usize,
    lru_tail: usize,

    resident_max: usize,
    evicting: usize,
    evict_keep: usize,
    ios_in_flight: usize,
    state: CacheState,
    self_weak: Weak<RefCell<L2pCache>>,
}

/// Shared handle to the paged backend.
pub type L2pCacheRef = Rc<RefCell<L2pCache>>;

impl L2pCache {
    /// Build the backend.
    ///
    /// `l1_md` supplies the resident-page buffer (`resident_max` blocks);
    /// `region_md` is the handle used for region-wide clear operations
    /// and may be created without memory.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        env: MdEnv,
        region: LayoutRegion,
        region_md: MdRef,
        l1_md: &MdRef,
        codec: AddrCodec,
        num_lbas: u64,
        dram_limit_bytes: u64,
        evict_keep_max: u32,
    ) -> L2pCacheRef {
        let lbas_in_page = (FTL_BLOCK_SIZE / codec.entry_size()) as u64;
        let num_pages = num_lbas.div_ceil(lbas_in_page);

        let page_all_size = FTL_BLOCK_SIZE as u64 + std::mem::size_of::<PageSlot>() as u64;
        let mut resident_max = (dram_limit_bytes / page_all_size) as usize;
        if resident_max as u64 > num_pages {
            log::info!("L2P memory limit above the entire table size");
            resident_max = num_pages as usize;
        }
        resident_max = resident_max.max(1);
        assert!(
            Md::data_len(l1_md) >= resident_max * FTL_BLOCK_SIZE,
            "resident-page buffer smaller than the resident set"
        );

        let evict_keep = num_pages
            .div_ceil(20)
            .min(u64::from(evict_keep_max)) as usize;
        log::info!(
            "L2P cache: {} pages total, {} resident max, eviction floor {}",
            num_pages,
            resident_max,
            evict_keep
        );

        let cache = Rc::new(RefCell::new(L2pCache {
            env,
            region,
            region_md,
            codec,
            num_lbas,
            lbas_in_page,
            num_pages,
            l2: vec![None; num_pages as usize],
            pages: (0..resident_max).map(|_| PageSlot::empty()).collect(),
            l1_buf: Md::buffer(l1_md).expect("resident-page object without buffer"),
            free_slots: (0..resident_max).collect(),
            lru_head: NIL,
            lru_tail: NIL,
            resident_max,
            evicting: 0,
            evict_keep,
            ios_in_flight: 0,
            state: CacheState::Running,
            self_weak: Weak::new(),
        }));
        cache.borrow_mut().self_weak = Rc::downgrade(&cache);
        cache
    }

    /// Currently free page slots.
    pub fn pages_available(&self) -> usize {
        self.free_slots.len()
    }

    /// Eviction keep-floor in pages.
    pub fn evict_keep(&self) -> usize {
        self.evict_keep
    }

    /// Maximum resident pages.
    pub fn resident_max(&self) -> usize {
        self.resident_max
    }

    fn page_of(&self, lba: u64) -> u64 {
        lba / self.lbas_in_page
    }

    fn page_range(&self, lba: u64, count: u64) -> (u64, u64) {
        debug_assert!(count > 0);
        (self.page_of(lba), self.page_of(lba + count - 1))
    }

    // -- LRU maintenance ---------------------------------------------------

    fn lru_remove(&mut self, slot: usize) {
        debug_assert!(self.pages[slot].on_lru);
        let (prev, next) = (self.pages[slot].lru_prev, self.pages[slot].lru_next);
        if prev != NIL {
            self.pages[prev].lru_next = next;
        } else {
            self.lru_head = next;
        }
        if next != NIL {
            self.pages[next].lru_prev = prev;
        } else {
            self.lru_tail = prev;
        }
        let page = &mut self.pages[slot];
        page.on_lru = false;
        page.lru_prev = NIL;
        page.lru_next = NIL;
    }

    fn lru_push_head(&mut self, slot: usize) {
        debug_assert!(!self.pages[slot].on_lru);
        let old_head = self.lru_head;
        self.pages[slot].lru_prev = NIL;
        self.pages[slot].lru_next = old_head;
        self.pages[slot].on_lru = true;
        if old_head != NIL {
            self.pages[old_head].lru_prev = slot;
        } else {
            self.lru_tail = slot;
        }
        self.lru_head = slot;
    }

    fn lru_tail_slot(&self) -> Option<usize> {
        (self.lru_tail != NIL).then_some(self.lru_tail)
    }

    fn page_slice_bounds(&self, slot: usize) -> (usize, usize) {
        let at = slot * FTL_BLOCK_SIZE;
        (at, at + FTL_BLOCK_SIZE)
    }
}

// ---------------------------------------------------------------------------
// Pinning
// ---------------------------------------------------------------------------

fn pinner_complete(env: &MdEnv, pinner: &PinnerRef) {
    let cb = pinner.borrow_mut().cb.take();
    let fault = pinner.borrow().fault.clone();
    if let Some(cb) = cb {
        env.reactor
            .send_msg(Box::new(move || cb(fault.map_or(Ok(()), Err))));
    }
}

fn page_load_submit(cache: &L2pCacheRef, slot: usize, page_no: u64) {
    let (env, region, l1_buf, buf_offset) = {
        let this = cache.borrow();
        let (at, _) = this.page_slice_bounds(slot);
        (this.env.clone(), this.region.clone(), this.l1_buf.clone(), at)
    };

    let weak = cache.borrow().self_weak.clone();
    let cb: IoCompletion = Box::new(move |status| {
        if let Some(cache) = weak.upgrade() {
            page_load_done(&cache, slot, status.is_ok());
        }
    });

    let (bdev, ch) = match region.device {
        crate::layout::DeviceSel::Cache => (&env.cache_bdev, &env.cache_ch),
        crate::layout::DeviceSel::Base => (&env.base_bdev, &env.base_ch),
    };
    let result = bdev.read_blocks(
        ch,
        &l1_buf,
        buf_offset,
        region.offset_blocks + page_no,
        1,
        cb,
    );
    match result {
        Ok(()) => {}
        Err(SubmitError::NoMem) => {
            let weak = cache.borrow().self_weak.clone();
            bdev.queue_io_wait(
                ch,
                Box::new(move || {
                    if let Some(cache) = weak.upgrade() {
                        page_load_submit(&cache, slot, page_no);
                    }
                }),
            );
        }
        Err(SubmitError::Failed) => page_load_done(cache, slot, false),
    }
}

fn page_load_done(cache: &L2pCacheRef, slot: usize, success: bool) {
    let (env, waiters) = {
        let mut this = cache.borrow_mut();
        this.ios_in_flight -= 1;
        let page = &mut this.pages[slot];
        page.state = if success {
            PageState::Ready
        } else {
            PageState::Corrupted
        };
        (this.env.clone(), std::mem::take(&mut this.pages[slot].waiters))
    };

    for pinner in waiters {
        {
            let mut guard = pinner.borrow_mut();
            if success {
                guard.pages_ready += 1;
            } else {
                guard.fault = Some(L2pError::Io);
            }
            if guard.pages_ready < guard.pages.len() && guard.fault.is_none() {
                continue;
            }
        }
        pinner_complete(&env, &pinner);
    }
    maybe_shutdown_done(cache);
}

enum PagePin {
    /// Page resident and usable right away.
    Ready,
    /// Page resident with I/O in flight; the pinner waits on it.
    Waiting,
    /// Page missing and a fresh slot was taken; the caller submits the
    /// load.
    Load(usize),
    /// No slot available.
    NoSlot,
    /// Page resident but poisoned by an earlier I/O failure.
    Corrupted,
}

impl L2pCache {
    fn pin_one_page(&mut self, page_no: u64, pinner: &PinnerRef) -> PagePin {
        if let Some(slot) = self.l2[page_no as usize] {
            let state = self.pages[slot].state;
            if state == PageState::Corrupted {
                return PagePin::Corrupted;
            }
            self.pages[slot].pin_ref_cnt += 1;
            if self.pages[slot].on_lru {
                self.lru_remove(slot);
            }
            match state {
                PageState::Ready | PageState::InPersist | PageState::InClear => PagePin::Ready,
                PageState::Init | PageState::InFlush => {
                    self.pages[slot].waiters.push(Rc::clone(pinner));
                    PagePin::Waiting
                }
                PageState::Corrupted => unreachable!(),
            }
        } else {
            let Some(slot) = self.free_slots.pop() else {
                return PagePin::NoSlot;
            };
            let page = &mut self.pages[slot];
            page.used = true;
            page.page_no = page_no;
            page.state = PageState::Init;
            page.pin_ref_cnt = 1;
            page.updates = 0;
            page.waiters.push(Rc::clone(pinner));
            self.l2[page_no as usize] = Some(slot);
            PagePin::Load(slot)
        }
    }

    /// Roll back a partially processed pin: drop the references it took
    /// and free any slots it allocated whose loads never started.
    fn pin_unwind(&mut self, pinned: &[u64], loads: &[(usize, u64)], pinner: &PinnerRef) {
        for &page_no in pinned {
            let slot = self.l2[page_no as usize].expect("unwound page vanished");
            self.pages[slot].pin_ref_cnt -= 1;
            self.pages[slot].waiters.retain(|w| !Rc::ptr_eq(w, pinner));
            if self.pages[slot].pin_ref_cnt == 0 && self.pages[slot].state == PageState::Ready {
                self.lru_push_head(slot);
            }
        }
        for &(slot, _page_no) in loads {
            if self.pages[slot].pin_ref_cnt == 0 && self.pages[slot].waiters.is_empty() {
                debug_assert_eq!(self.pages[slot].state, PageState::Init);
                self.free_slot(slot);
            }
        }
    }
}

impl L2p for L2pCache {
    fn get(&self, lba: u64) -> Addr {
        debug_assert!(lba < self.num_lbas);
        let page_no = self.page_of(lba);
        let Some(slot) = self.l2[page_no as usize] else {
            debug_assert!(false, "translation of a non-resident page");
            return Addr::Invalid;
        };
        let page = &self.pages[slot];
        debug_assert!(page.pin_ref_cnt > 0, "translation of an unpinned page");
        if page.state == PageState::Corrupted {
            return Addr::Invalid;
        }
        let (at, end) = self.page_slice_bounds(slot);
        let guard = self.l1_buf.borrow();
        self.codec
            .load(&guard.as_slice()[at..end], lba % self.lbas_in_page)
    }

    fn set(&mut self, lba: u64, addr: Addr) {
        debug_assert!(lba < self.num_lbas);
        let page_no = self.page_of(lba);
        let Some(slot) = self.l2[page_no as usize] else {
            debug_assert!(false, "update of a non-resident page");
            return;
        };
        debug_assert!(self.pages[slot].pin_ref_cnt > 0, "update of an unpinned page");
        if self.pages[slot].state == PageState::Corrupted {
            return;
        }
        let (at, end) = self.page_slice_bounds(slot);
        {
            let mut guard = self.l1_buf.borrow_mut();
            self.codec
                .store(&mut guard.as_mut_slice()[at..end], lba % self.lbas_in_page, addr);
        }
        self.pages[slot].updates += 1;
    }

    fn pin(&mut self, mut pin_ctx: PinCtx) -> PinOutcome {
        let cache_ref = self
            .self_weak
            .upgrade()
            .expect("backend pinned after teardown");

        if self.state != CacheState::Running {
            let cb = pin_ctx.cb.take();
            self.env.reactor.send_msg(Box::new(move || {
                if let Some(cb) = cb {
                    cb(Err(L2pError::Aborted));
                }
            }));
            return PinOutcome::Accepted;
        }
        if pin_ctx.lba + pin_ctx.count > self.num_lbas {
            let lba = pin_ctx.lba;
            let cb = pin_ctx.cb.take();
            self.env.reactor.send_msg(Box::new(move || {
                if let Some(cb) = cb {
                    cb(Err(L2pError::OutOfRange(lba)));
                }
            }));
            return PinOutcome::Accepted;
        }

        let (first, last) = self.page_range(pin_ctx.lba, pin_ctx.count);
        debug_assert!(last - first + 1 <= L2P_MAX_PAGES_TO_PIN);

        let pinner: PinnerRef = Rc::new(RefCell::new(Pinner {
            pages: (first..=last).collect(),
            pages_ready: 0,
            fault: None,
            cb: pin_ctx.cb.take(),
        }));

        let mut loads = Vec::new();
        let mut pinned = Vec::new();
        for page_no in first..=last {
            match self.pin_one_page(page_no, &pinner) {
                PagePin::Ready => {
                    pinned.push(page_no);
                    pinner.borrow_mut().pages_ready += 1;
                }
                PagePin::Waiting => pinned.push(page_no),
                PagePin::Load(slot) => {
                    pinned.push(page_no);
                    loads.push((slot, page_no));
                }
                PagePin::NoSlot => {
                    // Unwind and defer the whole request; eviction will
                    // free a slot for the retry.
                    self.pin_unwind(&pinned, &loads, &pinner);
                    pin_ctx.cb = pinner.borrow_mut().cb.take();
                    self.evict_for_floor(&cache_ref, 1);
                    return PinOutcome::Deferred(pin_ctx);
                }
                PagePin::Corrupted => {
                    self.pin_unwind(&pinned, &loads, &pinner);
                    let cb = pinner.borrow_mut().cb.take();
                    self.env.reactor.send_msg(Box::new(move || {
                        if let Some(cb) = cb {
                            cb(Err(L2pError::Corrupted));
                        }
                    }));
                    return PinOutcome::Accepted;
                }
            }
        }

        let ready = {
            let guard = pinner.borrow();
            guard.pages_ready == guard.pages.len()
        };
        if ready {
            pinner_complete(&self.env, &pinner);
        }
        for (slot, page_no) in loads {
            self.ios_in_flight += 1;
            let cache_ref = Rc::clone(&cache_ref);
            self.env.reactor.send_msg(Box::new(move || {
                page_load_submit(&cache_ref, slot, page_no);
            }));
        }
        PinOutcome::Accepted
    }

    fn unpin(&mut self, lba: u64, count: u64) {
        let (first, last) = self.page_range(lba, count);
        for page_no in first..=last {
            let slot = self.l2[page_no as usize].expect("unpin of a non-resident page");
            let page = &mut self.pages[slot];
            debug_assert!(page.pin_ref_cnt > 0);
            page.pin_ref_cnt -= 1;
            if page.pin_ref_cnt == 0 && page.state == PageState::Ready {
                self.lru_push_head(slot);
            }
        }
    }

    fn clear(&mut self, cb: L2pCb) {
        // Resident pages reset in place while the region clear runs.
        let mut cleared = Vec::new();
        for slot in 0..self.pages.len() {
            if self.pages[slot].used && self.pages[slot].state == PageState::Ready {
                self.pages[slot].state = PageState::InClear;
                self.pages[slot].updates = 0;
                let (at, end) = self.page_slice_bounds(slot);
                self.l1_buf.borrow_mut().as_mut_slice()[at..end].fill(0xFF);
                cleared.push(slot);
            }
        }

        let weak = self.self_weak.clone();
        let pattern = [0xFFu8; 8];
        Md::clear(
            &self.region_md,
            &self.env,
            &pattern[..self.codec.entry_size()],
            None,
            Box::new(move |st| {
                if let Some(cache) = weak.upgrade() {
                    let mut this = cache.borrow_mut();
                    for slot in cleared {
                        if this.pages[slot].state == PageState::InClear {
                            this.pages[slot].state = PageState::Ready;
                        }
                    }
                }
                cb(st.map_err(|_| L2pError::Io))
            }),
        );
    }

    fn persist(&mut self, cb: L2pCb) {
        let cache_ref = self
            .self_weak
            .upgrade()
            .expect("backend persisted after teardown");
        // The walk re-enters through the shared handle, so it starts
        // from the reactor rather than under the caller's borrow.
        self.env
            .reactor
            .send_msg(Box::new(move || persist_next_page(&cache_ref, 0, cb)));
    }

    fn process(&mut self) {
        match self.state {
            CacheState::Running => {
                let cache_ref = self
                    .self_weak
                    .upgrade()
                    .expect("backend processed after teardown");
                let floor = self.evict_keep.min(self.resident_max);
                if self.free_slots.len() < floor {
                    let deficit = floor - self.free_slots.len();
                    self.evict_for_floor(&cache_ref, deficit);
                }
            }
            CacheState::InShutdown | CacheState::ShutdownDone => {}
        }
    }

    fn halt(&mut self) {
        if self.state == CacheState::Running {
            self.state = CacheState::InShutdown;
        }
        if self.state == CacheState::InShutdown
            && self.ios_in_flight == 0
            && self.evicting == 0
        {
            self.state = CacheState::ShutdownDone;
        }
    }

    fn is_halted(&self) -> bool {
        self.state == CacheState::ShutdownDone
    }
}

impl L2pCache {
    /// Evict up to `want` pages from the LRU tail.
    fn evict_for_floor(&mut self, cache_ref: &L2pCacheRef, want: usize) {
        for _ in 0..want {
            let Some(slot) = self.lru_tail_slot() else { return };
            self.lru_remove(slot);
            let page = &self.pages[slot];
            debug_assert_eq!(page.pin_ref_cnt, 0);
            debug_assert_eq!(page.state, PageState::Ready);

            if page.updates == 0 {
                self.free_slot(slot);
                continue;
            }

            let page_no = self.pages[slot].page_no;
            self.pages[slot].state = PageState::InFlush;
            self.evicting += 1;
            self.ios_in_flight += 1;
            let cache_ref = Rc::clone(cache_ref);
            self.env.reactor.send_msg(Box::new(move || {
                page_flush_submit(&cache_ref, slot, page_no, FlushKind::Evict);
            }));
        }
    }

    fn free_slot(&mut self, slot: usize) {
        let page_no = self.pages[slot].page_no;
        debug_assert_eq!(self.l2[page_no as usize], Some(slot));
        self.l2[page_no as usize] = None;
        self.pages[slot] = PageSlot::empty();
        self.free_slots.push(slot);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushKind {
    Evict,
    Persist,
}

fn page_flush_submit(cache: &L2pCacheRef, slot: usize, page_no: u64, kind: FlushKind) {
    let (env, region, l1_buf, buf_offset) = {
        let this = cache.borrow();
        let (at, _) = this.page_slice_bounds(slot);
        (this.env.clone(), this.region.clone(), this.l1_buf.clone(), at)
    };

    let weak = cache.borrow().self_weak.clone();
    let cb: IoCompletion = Box::new(move |status| {
        if let Some(cache) = weak.upgrade() {
            page_flush_done(&cache, slot, kind, status.is_ok());
        }
    });

    let (bdev, ch) = match region.device {
        crate::layout::DeviceSel::Cache => (&env.cache_bdev, &env.cache_ch),
        crate::layout::DeviceSel::Base => (&env.base_bdev, &env.base_ch),
    };
    let result = bdev.write_blocks(
        ch,
        &l1_buf,
        buf_offset,
        region.offset_blocks + page_no,
        1,
        cb,
    );
    match result {
        Ok(()) => {}
        Err(SubmitError::NoMem) => {
            let weak = cache.borrow().self_weak.clone();
            bdev.queue_io_wait(
                ch,
                Box::new(move || {
                    if let Some(cache) = weak.upgrade() {
                        page_flush_submit(&cache, slot, page_no, kind);
                    }
                }),
            );
        }
        Err(SubmitError::Failed) => page_flush_done(cache, slot, kind, false),
    }
}

fn page_flush_done(cache: &L2pCacheRef, slot: usize, kind: FlushKind, success: bool) {
    let (env, waiters) = {
        let mut this = cache.borrow_mut();
        this.ios_in_flight -= 1;
        if kind == FlushKind::Evict {
            this.evicting -= 1;
        }

        if !success {
            this.pages[slot].state = PageState::Corrupted;
            log::error!(
                "L2P page {} write-back failed, marking corrupted",
                this.pages[slot].page_no
            );
            (this.env.clone(), std::mem::take(&mut this.pages[slot].waiters))
        } else {
            match kind {
                FlushKind::Persist => {
                    this.pages[slot].state = PageState::Ready;
                    (this.env.clone(), Vec::new())
                }
                FlushKind::Evict => {
                    let has_claims = this.pages[slot].pin_ref_cnt > 0
                        || !this.pages[slot].waiters.is_empty();
                    if has_claims {
                        // New pinners arrived mid-flush; the resident copy
                        // is still the newest, so the page goes straight
                        // back to ready.
                        this.pages[slot].state = PageState::Ready;
                        this.pages[slot].updates = 0;
                        (this.env.clone(), std::mem::take(&mut this.pages[slot].waiters))
                    } else {
                        this.free_slot(slot);
                        (this.env.clone(), Vec::new())
                    }
                }
            }
        }
    };

    for pinner in waiters {
        {
            let mut guard = pinner.borrow_mut();
            if success {
                guard.pages_ready += 1;
            } else {
                guard.fault = Some(L2pError::Corrupted);
            }
            if guard.pages_ready < guard.pages.len() && guard.fault.is_none() {
                continue;
            }
        }
        pinner_complete(&env, &pinner);
    }
    maybe_shutdown_done(cache);
}

fn maybe_shutdown_done(cache: &L2pCacheRef) {
    let mut this = cache.borrow_mut();
    if this.state == CacheState::InShutdown && this.ios_in_flight == 0 && this.evicting == 0 {
        this.state = CacheState::ShutdownDone;
    }
}

fn persist_next_page(cache: &L2pCacheRef, from: usize, cb: L2pCb) {
    let next = {
        let mut this = cache.borrow_mut();
        let next = (from..this.pages.len()).find(|&slot| {
            this.pages[slot].used
                && this.pages[slot].state == PageState::Ready
                && this.pages[slot].updates > 0
        });
        if let Some(slot) = next {
            this.pages[slot].state = PageState::InPersist;
            this.pages[slot].updates = 0;
            this.ios_in_flight += 1;
            Some((slot, this.pages[slot].page_no))
        } else {
            None
        }
    };

    let Some((slot, page_no)) = next else {
        cb(Ok(()));
        return;
    };

    // Chain one page at a time; the flush completion re-enters here.
    let cache2 = Rc::clone(cache);
    let chain: IoCompletion = Box::new(move |status| {
        page_flush_done(&cache2, slot, FlushKind::Persist, status.is_ok());
        if status.is_ok() {
            persist_next_page(&cache2, slot + 1, cb);
        } else {
            cb(Err(L2pError::Io));
        }
    });

    let (env, region, l1_buf, buf_offset) = {
        let this = cache.borrow();
        let (at, _) = this.page_slice_bounds(slot);
        (this.env.clone(), this.region.clone(), this.l1_buf.clone(), at)
    };
    let (bdev, ch) = match region.device {
        crate::layout::DeviceSel::Cache => (&env.cache_bdev, &env.cache_ch),
        crate::layout::DeviceSel::Base => (&env.base_bdev, &env.base_ch),
    };
    crate::device::submit_retrying(
        bdev,
        ch,
        crate::device::IoDir::Write,
        &l1_buf,
        buf_offset,
        None,
        0,
        region.offset_blocks + page_no,
        1,
        chain,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mem::MemBdev;
    use crate::device::Bdev;
    use crate::l2p::PinCb;
    use crate::layout::{DeviceSel, RegionType};
    use crate::md::MdCreateFlags;
    use crate::reactor::{Reactor, ReactorRef};
    use std::cell::Cell;
    use uuid::Uuid;

    struct Fixture {
        reactor: ReactorRef,
        cache_bdev: Rc<MemBdev>,
        l2p: L2pCacheRef,
        lbas_in_page: u64,
    }

    /// `resident` bounds the number of resident pages.
    fn fixture(num_lbas: u64, resident: usize) -> Fixture {
        let reactor = Reactor::new();
        let cache_bdev = MemBdev::new(Rc::clone(&reactor), 4096, 64, 0, 0);
        let base = MemBdev::new(Rc::clone(&reactor), 4096, 0, 256, 2);
        let env = MdEnv {
            reactor: Rc::clone(&reactor),
            cache_ch: cache_bdev.open_channel(),
            base_ch: base.open_channel(),
            cache_bdev: Rc::clone(&cache_bdev) as Rc<dyn Bdev>,
            base_bdev: base,
            xfer_blocks: 8,
            sb_clean: Rc::new(Cell::new(true)),
        };

        let codec = AddrCodec::from_entry_size(4);
        let lbas_in_page = (FTL_BLOCK_SIZE / 4) as u64;
        let region_blocks = num_lbas.div_ceil(lbas_in_page).max(1) * 2;
        let region = LayoutRegion {
            rtype: RegionType::L2p,
            device: DeviceSel::Cache,
            offset_blocks: 128,
            length_blocks: region_blocks,
            version: 1,
            entry_size: 0,
            num_entries: 0,
            vss_blksz: 0,
            mirror_type: None,
        };
        // The region starts out filled with the invalid pattern.
        cache_bdev.write_raw(
            region.offset_blocks,
            &vec![0xFFu8; region_blocks as usize * FTL_BLOCK_SIZE],
        );

        let uuid = Uuid::new_v4();
        let region_md =
            Md::create(&uuid, 0, 0, "l2p", MdCreateFlags::no_mem(), None).unwrap();
        Md::set_region(&region_md, &region, None).unwrap();
        let l1_md = Md::create(
            &uuid,
            resident as u64,
            0,
            "l2p_l1",
            MdCreateFlags::heap(),
            None,
        )
        .unwrap();

        let page_all = FTL_BLOCK_SIZE as u64 + std::mem::size_of::<PageSlot>() as u64;
        let l2p = L2pCache::new(
            env,
            region,
            region_md,
            &l1_md,
            codec,
            num_lbas,
            resident as u64 * page_all,
            16 * 1024,
        );
        Fixture {
            reactor,
            cache_bdev,
            l2p,
            lbas_in_page,
        }
    }

    fn pin_cb(results: &Rc<RefCell<Vec<Result<(), L2pError>>>>) -> PinCb {
        let r = Rc::clone(results);
        Box::new(move |st| r.borrow_mut().push(st))
    }

    fn pin_now(fx: &Fixture, lba: u64, count: u64) {
        let results = Rc::new(RefCell::new(Vec::new()));
        let outcome = fx
            .l2p
            .borrow_mut()
            .pin(PinCtx::new(lba, count, pin_cb(&results)));
        assert!(matches!(outcome, PinOutcome::Accepted));
        assert!(fx.reactor.run_until(|| !results.borrow().is_empty()));
        results.borrow()[0].clone().unwrap();
    }

    #[test]
    fn test_pin_set_get_unpin() {
        let fx = fixture(8192, 4);
        pin_now(&fx, 0, 4);

        fx.l2p.borrow_mut().set(2, Addr::Cached(777));
        assert_eq!(fx.l2p.borrow().get(2), Addr::Cached(777));
        assert_eq!(fx.l2p.borrow().get(3), Addr::Invalid);

        fx.l2p.borrow_mut().unpin(0, 4);
        assert_eq!(fx.l2p.borrow().pages_available(), 3);
    }

    #[test]
    fn test_pin_missing_slot_defers() {
        let fx = fixture(8192, 1);
        pin_now(&fx, 0, 1);

        // Second page cannot load while the only slot is pinned.
        let results = Rc::new(RefCell::new(Vec::new()));
        let outcome = fx
            .l2p
            .borrow_mut()
            .pin(PinCtx::new(fx.lbas_in_page, 1, pin_cb(&results)));
        assert!(matches!(outcome, PinOutcome::Deferred(_)));
    }

    #[test]
    fn test_deferred_pin_succeeds_after_eviction() {
        let fx = fixture(8192, 1);
        pin_now(&fx, 0, 1);
        fx.l2p.borrow_mut().set(0, Addr::Cached(1));

        let results = Rc::new(RefCell::new(Vec::new()));
        let deferred = match fx
            .l2p
            .borrow_mut()
            .pin(PinCtx::new(fx.lbas_in_page, 1, pin_cb(&results)))
        {
            PinOutcome::Deferred(ctx) => ctx,
            PinOutcome::Accepted => panic!("expected a deferred pin"),
        };

        // Release the first page; eviction then frees the slot and the
        // retried pin lands.
        fx.l2p.borrow_mut().unpin(0, 1);
        fx.l2p.borrow_mut().process();
        for _ in 0..32 {
            fx.reactor.tick();
        }
        let outcome = fx.l2p.borrow_mut().pin(deferred);
        assert!(matches!(outcome, PinOutcome::Accepted));
        assert!(fx.reactor.run_until(|| !results.borrow().is_empty()));
        results.borrow()[0].clone().unwrap();

        // The dirty first page went out to the region before leaving.
        let raw = fx.cache_bdev.read_raw(128, 1);
        let codec = AddrCodec::from_entry_size(4);
        assert_eq!(codec.load(&raw, 0), Addr::Cached(1));
    }

    #[test]
    fn test_eviction_write_back_failure_corrupts_page() {
        let fx = fixture(8192, 1);
        pin_now(&fx, 0, 1);
        fx.l2p.borrow_mut().set(0, Addr::Cached(5));
        fx.l2p.borrow_mut().unpin(0, 1);

        fx.cache_bdev.fail_next(1);
        fx.l2p.borrow_mut().process();
        for _ in 0..32 {
            fx.reactor.tick();
        }
        // The slot was not freed; the page sits corrupted.
        assert_eq!(fx.l2p.borrow().pages_available(), 0);
    }

    #[test]
    fn test_halt_waits_for_evictions() {
        let fx = fixture(8192, 2);
        pin_now(&fx, 0, 1);
        fx.l2p.borrow_mut().set(0, Addr::Cached(9));
        fx.l2p.borrow_mut().unpin(0, 1);

        // Dirty page eviction in flight while halting.
        fx.l2p.borrow_mut().process();
        fx.l2p.borrow_mut().halt();
        assert!(!fx.l2p.borrow().is_halted());

        for _ in 0..32 {
            fx.reactor.tick();
        }
        fx.l2p.borrow_mut().halt();
        assert!(fx.l2p.borrow().is_halted());
    }

    #[test]
    fn test_pin_after_halt_aborts() {
        let fx = fixture(8192, 2);
        fx.l2p.borrow_mut().halt();

        let results = Rc::new(RefCell::new(Vec::new()));
        let outcome = fx.l2p.borrow_mut().pin(PinCtx::new(0, 1, pin_cb(&results)));
        assert!(matches!(outcome, PinOutcome::Accepted));
        assert!(fx.reactor.run_until(|| !results.borrow().is_empty()));
        assert_eq!(results.borrow()[0], Err(L2pError::Aborted));
    }

    #[test]
    fn test_keep_floor_maintained_by_process() {
        let fx = fixture(8192, 2);
        // Occupy both slots, then release them; housekeeping must bring
        // the free pool back above the floor.
        pin_now(&fx, 0, 1);
        pin_now(&fx, fx.lbas_in_page, 1);
        assert_eq!(fx.l2p.borrow().pages_available(), 0);

        fx.l2p.borrow_mut().unpin(0, 1);
        fx.l2p.borrow_mut().unpin(fx.lbas_in_page, 1);
        fx.l2p.borrow_mut().process();
        for _ in 0..32 {
            fx.reactor.tick();
        }

        let this = fx.l2p.borrow();
        let floor = this.evict_keep().min(this.resident_max());
        assert!(this.pages_available() >= floor);
    }

    #[test]
    fn test_keep_floor_formula() {
        let fx = fixture(8192 * 100, 8);
        // 100 pages at a 4-entry... the floor is 5% of total pages,
        // bounded by the configured cap.
        let this = fx.l2p.borrow();
        let num_pages = (8192u64 * 100).div_ceil(fx.lbas_in_page);
        assert_eq!(this.evict_keep() as u64, num_pages.div_ceil(20));
    }
}
