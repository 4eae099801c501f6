//! # Recovery
//!
//! Rebuilds the logical-to-physical state after a dirty shutdown without
//! exceeding the configured memory budget. The L2P region is processed in
//! windows: each iteration loads one slice, replays every non-free band's
//! tail map and every closed chunk's map into it (newest sequence id
//! wins, losers get their reverse-map entries invalidated), rebuilds the
//! valid map for the window, and persists the slice back.
//!
//! Ahead of the iterations the band states are restored (pass one), the
//! rotating P2L checkpoints are matched to interrupted open bands, open
//! chunks are rebuilt from their per-block VSS and force-closed, and the
//! device sequence counter is re-seeded from the observed maxima. After
//! the replay, a band caught between its last data write and its tail
//! write gets its close finished from the restored checkpoint map.
//!
//! A warm restart with shared-memory metadata skips the replay: the L2P
//! buffer is already current, so only the valid map and its counters are
//! reloaded.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use thiserror::Error;

use crate::band::{p2l, BandError, BandSet, BandSetRef, BandState, ValidMapRef};
use crate::core::addr::Addr;
use crate::core::buf::SharedBuf;
use crate::core::{FTL_BLOCK_SIZE, FTL_LBA_INVALID};
use crate::layout::{Layout, LayoutRegion, RegionType, P2L_CKPT_COUNT};
use crate::md::{Md, MdCreateFlags, MdEnv, MdError, MdRef};
use crate::nv_cache::{ChunkState, NvCache, NvCacheError, NvcRef};
use crate::reactor::ReactorRef;

/// Recovery errors; all of them abort the mount.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecoveryError {
    /// On-disk metadata is inconsistent.
    #[error("corrupted metadata: {0}")]
    Corrupted(String),

    /// Band subsystem failure.
    #[error(transparent)]
    Band(#[from] BandError),

    /// Cache subsystem failure.
    #[error(transparent)]
    NvCache(#[from] NvCacheError),

    /// Metadata object failure.
    #[error("metadata I/O failed: {0}")]
    Md(#[from] MdError),
}

/// Completion of a recovery run.
pub type RecoveryCb = Box<dyn FnOnce(Result<(), RecoveryError>)>;

/// Number of replay iterations needed for a given geometry and memory
/// budget.
pub fn iteration_count(num_lbas: u64, addr_size: u64, mem_limit_bytes: u64) -> u64 {
    let mem_limit = mem_limit_bytes.min(
        (num_lbas * addr_size).div_ceil(1 << 20) << 20,
    );
    let lba_limit = mem_limit / (8 + addr_size);
    num_lbas.div_ceil(lba_limit)
}

/// One replay run.
pub struct Recovery {
    env: MdEnv,
    reactor: ReactorRef,
    layout: Layout,
    bands: BandSetRef,
    nvc: NvcRef,
    valid: ValidMapRef,
    seq: Rc<Cell<u64>>,
    fast: bool,
    l2p_buf: Option<SharedBuf>,

    snippet_md: Option<MdRef>,
    snippet_template: LayoutRegion,
    block_limit: u64,
    lbas_in_block: u64,
    done_blocks: u64,
    lba_first: u64,
    lba_last: u64,
    iter: u32,
    seq_buf: Vec<u64>,

    p2l_ckpt_seq: [Option<u64>; P2L_CKPT_COUNT as usize],
}

/// Shared handle to a recovery run.
pub type RecoveryRef = Rc<RefCell<Recovery>>;

/// Everything recovery borrows from the device.
pub struct RecoveryArgs {
    /// Metadata environment.
    pub env: MdEnv,
    /// Core reactor.
    pub reactor: ReactorRef,
    /// Device layout.
    pub layout: Layout,
    /// Band set.
    pub bands: BandSetRef,
    /// Non-volatile cache.
    pub nvc: NvcRef,
    /// Valid map.
    pub valid: ValidMapRef,
    /// Device sequence counter.
    pub seq: Rc<Cell<u64>>,
    /// DRAM budget in MiB (bounds the working set).
    pub dram_limit_mib: u64,
    /// Device identity (names the working-set object).
    pub uuid: uuid::Uuid,
    /// Shared-memory flags for the working set.
    pub shm_flags: MdCreateFlags,
    /// Override of the shared-memory directory.
    pub shm_dir: Option<std::path::PathBuf>,
    /// Take the warm path: the L2P buffer survived in shared memory.
    pub fast: bool,
    /// The resident L2P buffer, required on the warm path.
    pub l2p_buf: Option<SharedBuf>,
}

impl Recovery {
    /// Size the working set and allocate it.
    pub fn new(args: RecoveryArgs) -> Result<RecoveryRef, RecoveryError> {
        let l2p_shape = args.layout.l2p;
        let addr_size = l2p_shape.addr_size as u64;
        let num_lbas = args.layout.num_lbas;
        let lbas_in_block = (FTL_BLOCK_SIZE as u64) / addr_size;

        let mem_limit = (args.dram_limit_mib << 20)
            .min((num_lbas * addr_size).div_ceil(1 << 20) << 20);
        let lba_limit = mem_limit / (8 + addr_size);
        let l2p_limit = lba_limit * addr_size;
        let block_limit = l2p_limit.div_ceil(FTL_BLOCK_SIZE as u64).max(1);
        let snippet_count = block_limit * lbas_in_block;

        log::info!(
            "recovery memory limit {} MiB, {} iterations of {} blocks",
            mem_limit >> 20,
            num_lbas.div_ceil(lba_limit.max(1)),
            block_limit
        );

        let snippet_md = if args.fast {
            None
        } else {
            // The working set carries a VSS area so persisted slices
            // keep the region version stamped.
            Some(
                Md::create(
                    &args.uuid,
                    block_limit,
                    crate::core::FTL_MD_VSS_SZ as u32,
                    "l2p_recovery",
                    args.shm_flags,
                    args.shm_dir.as_deref(),
                )
                .map_err(RecoveryError::Md)?,
            )
        };

        let snippet_template = args.layout.region(RegionType::L2p).clone();

        Ok(Rc::new(RefCell::new(Recovery {
            env: args.env,
            reactor: args.reactor,
            layout: args.layout,
            bands: args.bands,
            nvc: args.nvc,
            valid: args.valid,
            seq: args.seq,
            fast: args.fast,
            l2p_buf: args.l2p_buf,
            snippet_md,
            snippet_template,
            block_limit,
            lbas_in_block,
            done_blocks: 0,
            lba_first: 0,
            lba_last: 0,
            iter: 0,
            seq_buf: vec![0u64; snippet_count as usize],
            p2l_ckpt_seq: [None; P2L_CKPT_COUNT as usize],
        })))
    }

    /// Run the whole recovery; `cb` fires once the L2P region and the
    /// valid map reflect every persisted write.
    pub fn run(rec: &RecoveryRef, cb: RecoveryCb) {
        {
            let this = rec.borrow();
            this.valid.borrow_mut().reset();
        }
        restore_band_state(rec, cb);
    }

    fn window_advance(&mut self) {
        let region = &self.snippet_template;
        let total = region.length_blocks;
        let blocks = self.block_limit.min(total - self.done_blocks.min(total));
        self.lba_first = self.done_blocks * self.lbas_in_block;
        self.lba_last = ((self.done_blocks + blocks) * self.lbas_in_block)
            .min(self.layout.num_lbas);
        self.done_blocks += blocks;
        self.iter += 1;
    }

    fn window_region(&self) -> LayoutRegion {
        let mut region = self.snippet_template.clone();
        let first_block = self.lba_first / self.lbas_in_block;
        region.offset_blocks += first_block;
        region.length_blocks = (self.lba_last - self.lba_first).div_ceil(self.lbas_in_block);
        region
    }

    fn finished(&self) -> bool {
        self.lba_first >= self.layout.num_lbas || self.lba_first == self.lba_last
    }
}

fn fail(cb: RecoveryCb, err: RecoveryError) {
    log::error!("recovery failed: {}", err);
    cb(Err(err));
}

// Step 1: band state pass.
fn restore_band_state(rec: &RecoveryRef, cb: RecoveryCb) {
    let bands = rec.borrow().bands.clone();
    let rec2 = Rc::clone(rec);
    BandSet::restore_state(
        &bands,
        Box::new(move |status| match status {
            Ok(()) => preprocess_p2l(&rec2, 0, cb),
            Err(e) => fail(cb, e.into()),
        }),
    );
}

// Step 2: record the max sequence id each checkpoint slot holds.
fn preprocess_p2l(rec: &RecoveryRef, slot: u8, cb: RecoveryCb) {
    if slot >= P2L_CKPT_COUNT {
        restore_open_bands(rec, cb);
        return;
    }
    let bands = rec.borrow().bands.clone();
    let rec2 = Rc::clone(rec);
    p2l::ckpt_header(
        &bands,
        slot,
        Box::new(move |result| match result {
            Ok(hdr) => {
                let seq = hdr.map(|h| h.seq_id);
                rec2.borrow_mut().p2l_ckpt_seq[slot as usize] = seq;
                if let Some(seq) = seq {
                    log::info!("P2L checkpoint slot {} holds seq {}", slot, seq);
                }
                preprocess_p2l(&rec2, slot + 1, cb);
            }
            Err(e) => fail(cb, e.into()),
        }),
    );
}

// Step 3: replay checkpoints into interrupted open bands.
fn restore_open_bands(rec: &RecoveryRef, cb: RecoveryCb) {
    let open = BandSet::open_bands(&rec.borrow().bands);
    restore_open_band_at(rec, open, 0, cb);
}

fn restore_open_band_at(rec: &RecoveryRef, open: Vec<usize>, at: usize, cb: RecoveryCb) {
    if at >= open.len() {
        restore_chunk_state(rec, cb);
        return;
    }
    let idx = open[at];
    let (bands, band_seq, ckpt_seq) = {
        let this = rec.borrow();
        let md = BandSet::band_md(&this.bands, idx);
        (this.bands.clone(), md.seq, this.p2l_ckpt_seq)
    };

    let matching = (0..P2L_CKPT_COUNT).find(|&slot| ckpt_seq[slot as usize] == Some(band_seq));
    match matching {
        Some(slot) => {
            log::info!("restoring band {} P2L from checkpoint slot {}", idx, slot);
            let rec2 = Rc::clone(rec);
            p2l::ckpt_restore(
                &bands,
                idx,
                slot,
                Box::new(move |status| match status {
                    Ok(()) => restore_open_band_at(&rec2, open, at + 1, cb),
                    Err(e) => fail(cb, e.into()),
                }),
            );
        }
        None => {
            // Band opened but nothing of it survived; restart it empty.
            log::info!(
                "band {} (seq {}) matches no P2L checkpoint, write pointer reset",
                idx,
                band_seq
            );
            BandSet::alloc_empty_map(&bands, idx);
            restore_open_band_at(rec, open, at + 1, cb);
        }
    }
}

// Step 4: chunk state, checksum verification, open-chunk rebuild. The
// sequence counter is re-seeded before any chunk is force-closed so the
// closes do not reuse pre-crash sequence ids.
fn restore_chunk_state(rec: &RecoveryRef, cb: RecoveryCb) {
    let nvc = rec.borrow().nvc.clone();
    let rec2 = Rc::clone(rec);
    NvCache::restore_state(
        &nvc,
        Box::new(move |status| match status {
            Ok(()) => {
                recover_max_seq(&rec2);
                let open = NvCache::open_chunks(&rec2.borrow().nvc);
                recover_open_chunk_at(&rec2, open, 0, cb);
            }
            Err(e) => fail(cb, e.into()),
        }),
    );
}

fn recover_open_chunk_at(rec: &RecoveryRef, open: Vec<usize>, at: usize, cb: RecoveryCb) {
    if at >= open.len() {
        wait_chunks_closed(rec, cb);
        return;
    }
    let idx = open[at];
    let nvc = rec.borrow().nvc.clone();
    let rec2 = Rc::clone(rec);
    NvCache::recover_open_chunk(
        &nvc,
        idx,
        Box::new(move |status| match status {
            Ok(()) => recover_open_chunk_at(&rec2, open, at + 1, cb),
            Err(e) => fail(cb, e.into()),
        }),
    );
}

// Open-chunk closure finishes asynchronously (tail write plus metadata
// persist); hold the pipeline until every chunk left the open state.
fn wait_chunks_closed(rec: &RecoveryRef, cb: RecoveryCb) {
    let done = {
        let this = rec.borrow();
        NvCache::open_count(&this.nvc) == 0
    };
    if !done {
        let rec2 = Rc::clone(rec);
        let reactor = rec.borrow().reactor.clone();
        reactor.send_msg(Box::new(move || wait_chunks_closed(&rec2, cb)));
        return;
    }

    if rec.borrow().fast {
        fast_reload(rec, cb);
    } else {
        iteration_start(rec, cb);
    }
}

// Step 5: re-seed the global sequence counter from the observed maxima.
fn recover_max_seq(rec: &RecoveryRef) {
    let this = rec.borrow();
    let (band_open, band_close) = BandSet::max_seq_ids(&this.bands);
    let (chunk_open, chunk_close) = NvCache::max_seq_ids(&this.nvc);
    let max = band_open
        .max(band_close)
        .max(chunk_open)
        .max(chunk_close)
        .max(this.seq.get());
    this.seq.set(max);
    log::info!("sequence counter recovered to {}", max);
}

// Step 6: the bounded-memory iterations.
fn iteration_start(rec: &RecoveryRef, cb: RecoveryCb) {
    {
        let mut this = rec.borrow_mut();
        this.window_advance();
        if this.finished() {
            drop(this);
            finalize_open_bands(rec, cb);
            return;
        }
        log::info!(
            "L2P recovery iteration {}: LBAs [{}, {})",
            this.iter,
            this.lba_first,
            this.lba_last
        );
    }

    let (md, env, region) = {
        let this = rec.borrow();
        let md = Rc::clone(this.snippet_md.as_ref().expect("iterations without a snippet"));
        (md, this.env.clone(), this.window_region())
    };
    if let Err(e) = Md::set_region(&md, &region, None) {
        fail(cb, e.into());
        return;
    }

    let rec2 = Rc::clone(rec);
    Md::restore(
        &md,
        &env,
        Box::new(move |status| match status {
            Ok(()) => {
                rec2.borrow_mut().seq_buf.fill(0);
                let non_free = non_free_bands(&rec2);
                replay_band_at(&rec2, non_free, 0, cb);
            }
            Err(e) => fail(cb, e.into()),
        }),
    );
}

fn non_free_bands(rec: &RecoveryRef) -> Vec<usize> {
    let this = rec.borrow();
    let bands = this.bands.clone();
    let num = this.layout.geometry.num_bands as usize;
    (0..num)
        .filter(|&i| BandSet::band_md(&bands, i).state != BandState::Free)
        .collect()
}

fn replay_band_at(rec: &RecoveryRef, bands_list: Vec<usize>, at: usize, cb: RecoveryCb) {
    if at >= bands_list.len() {
        let closed_chunks: Vec<usize> = {
            let this = rec.borrow();
            let nvc = this.nvc.clone();
            (0..this.layout.chunk_count as usize)
                .filter(|&i| NvCache::chunk_md(&nvc, i).state == ChunkState::Closed)
                .collect()
        };
        replay_chunk_at(rec, closed_chunks, 0, cb);
        return;
    }

    let idx = bands_list[at];
    let bands = rec.borrow().bands.clone();

    // An interrupted band's authority is its checkpointed resident map,
    // whatever its in-memory state says; the tail region only exists for
    // closed bands.
    if let Some(map) = BandSet::resident_map(&bands, idx) {
        let result = replay_band_map(rec, idx, &map, true);
        match result {
            Ok(()) => replay_band_at(rec, bands_list, at + 1, cb),
            Err(e) => fail(cb, e),
        }
        return;
    }

    let rec2 = Rc::clone(rec);
    BandSet::read_tail_checked(
        &bands,
        idx,
        Box::new(move |result| match result {
            Ok(map) => match replay_band_map(&rec2, idx, &map, false) {
                Ok(()) => replay_band_at(&rec2, bands_list, at + 1, cb),
                Err(e) => fail(cb, e),
            },
            Err(e) => fail(cb, e.into()),
        }),
    );
}

/// Replay one band map into the current window.
fn replay_band_map(
    rec: &RecoveryRef,
    band_idx: usize,
    map: &SharedBuf,
    map_is_resident: bool,
) -> Result<(), RecoveryError> {
    let mut this = rec.borrow_mut();
    let num_lbas = this.layout.num_lbas;
    let codec = this.layout.l2p.codec();
    let blocks_in_band = this.layout.geometry.blocks_in_band();
    let band_start = band_idx as u64 * blocks_in_band;
    let usable = blocks_in_band - this.layout.band_tail_md_blocks;
    let (lba_first, lba_last) = (this.lba_first, this.lba_last);

    let snippet_buf = Md::buffer(this.snippet_md.as_ref().unwrap()).unwrap();
    let mut snippet = snippet_buf.borrow_mut();
    let mut map_guard = map.borrow_mut();

    for i in 0..usable {
        let entry = crate::band::map_entry(map_guard.as_slice(), i);
        if entry.lba == FTL_LBA_INVALID {
            continue;
        }
        if entry.lba >= num_lbas {
            return Err(RecoveryError::Corrupted(format!(
                "band {} maps out-of-range LBA {}",
                band_idx, entry.lba
            )));
        }
        if entry.lba < lba_first || entry.lba >= lba_last {
            continue;
        }
        let off = entry.lba - lba_first;

        if entry.seq_id < this.seq_buf[off as usize] {
            // Newer data recovered already; scrub the stale entry on an
            // interrupted band so later passes agree.
            if map_is_resident {
                crate::band::map_entry_set(
                    map_guard.as_mut_slice(),
                    i,
                    crate::band::P2lEntry {
                        lba: FTL_LBA_INVALID,
                        seq_id: 0,
                    },
                );
            }
            continue;
        }

        let addr = Addr::Flash(band_start + i);
        let curr = codec.load(snippet.as_slice(), off);
        if !curr.is_invalid() && !curr.is_cached() && curr != addr {
            let curr_band = this.layout.geometry.band_of(curr.flash_offset()) as usize;
            if curr_band == band_idx {
                // The displaced copy sits earlier in this same map.
                if map_is_resident {
                    let prev_offset = curr.flash_offset() - band_start;
                    let prev = crate::band::map_entry(map_guard.as_slice(), prev_offset);
                    if prev.lba == entry.lba && entry.seq_id >= prev.seq_id {
                        crate::band::map_entry_set(
                            map_guard.as_mut_slice(),
                            prev_offset,
                            crate::band::P2lEntry {
                                lba: FTL_LBA_INVALID,
                                seq_id: 0,
                            },
                        );
                    }
                }
            } else {
                scrub_displaced_mapping(&this, entry.lba, entry.seq_id, curr);
            }
        }

        codec.store(snippet.as_mut_slice(), off, addr);
        this.seq_buf[off as usize] = entry.seq_id;
    }
    Ok(())
}

/// An older flash mapping for the same LBA lost; when its band's map is
/// still resident from the checkpoint replay, drop the stale
/// reverse-map entry.
fn scrub_displaced_mapping(this: &Recovery, lba: u64, new_seq: u64, curr: Addr) {
    let curr_band = this.layout.geometry.band_of(curr.flash_offset()) as usize;
    let Some(curr_map) = BandSet::resident_map(&this.bands, curr_band) else {
        return;
    };
    let band_start = curr_band as u64 * this.layout.geometry.blocks_in_band();
    let prev_offset = curr.flash_offset() - band_start;
    let mut guard = curr_map.borrow_mut();
    let prev = crate::band::map_entry(guard.as_slice(), prev_offset);
    if prev.lba == lba && new_seq >= prev.seq_id {
        crate::band::map_entry_set(
            guard.as_mut_slice(),
            prev_offset,
            crate::band::P2lEntry {
                lba: FTL_LBA_INVALID,
                seq_id: 0,
            },
        );
    }
}

fn replay_chunk_at(rec: &RecoveryRef, chunks: Vec<usize>, at: usize, cb: RecoveryCb) {
    if at >= chunks.len() {
        match rebuild_valid_window(rec) {
            Ok(()) => save_window(rec, cb),
            Err(e) => fail(cb, e),
        }
        return;
    }
    let idx = chunks[at];
    let nvc = rec.borrow().nvc.clone();
    let rec2 = Rc::clone(rec);
    NvCache::read_tail_map(
        &nvc,
        idx,
        Box::new(move |result| match result {
            Ok(map) => match replay_chunk_map(&rec2, idx, &map) {
                Ok(()) => replay_chunk_at(&rec2, chunks, at + 1, cb),
                Err(e) => fail(cb, e),
            },
            Err(e) => fail(cb, e.into()),
        }),
    );
}

fn replay_chunk_map(
    rec: &RecoveryRef,
    chunk_idx: usize,
    map: &SharedBuf,
) -> Result<(), RecoveryError> {
    let mut this = rec.borrow_mut();
    let num_lbas = this.layout.num_lbas;
    let codec = this.layout.l2p.codec();
    let chunk_md = NvCache::chunk_md(&this.nvc, chunk_idx);
    let chunk_offset = this.layout.nvc_data_offset()
        + chunk_idx as u64 * this.layout.chunk_blocks;
    let data_blocks = this.layout.chunk_blocks - this.layout.chunk_tail_md_blocks;
    let (lba_first, lba_last) = (this.lba_first, this.lba_last);
    let seq = chunk_md.seq_id;

    let snippet_buf = Md::buffer(this.snippet_md.as_ref().unwrap()).unwrap();
    let mut snippet = snippet_buf.borrow_mut();
    let map_guard = map.borrow();

    for i in 0..data_blocks {
        let lba = codec.lba_load(map_guard.as_slice(), i);
        if lba == FTL_LBA_INVALID {
            continue;
        }
        if lba >= num_lbas {
            return Err(RecoveryError::Corrupted(format!(
                "chunk {} maps out-of-range LBA {}",
                chunk_idx, lba
            )));
        }
        if lba < lba_first || lba >= lba_last {
            continue;
        }
        let off = lba - lba_first;

        if seq < this.seq_buf[off as usize] {
            continue;
        }
        if seq == this.seq_buf[off as usize] {
            let curr = codec.load(snippet.as_slice(), off);
            if let Addr::Cached(curr_off) = curr {
                let same_chunk = curr_off >= chunk_offset
                    && curr_off < chunk_offset + this.layout.chunk_blocks;
                if same_chunk {
                    // Write-after-write inside one chunk: the lower
                    // offset survives, and entries replay in ascending
                    // order.
                    continue;
                }
            }
        }

        codec.store(snippet.as_mut_slice(), off, Addr::Cached(chunk_offset + i));
        this.seq_buf[off as usize] = seq;
    }
    Ok(())
}

/// Rebuild the valid map (and band counters) for the current window.
fn rebuild_valid_window(rec: &RecoveryRef) -> Result<(), RecoveryError> {
    let mut this = rec.borrow_mut();
    let codec = this.layout.l2p.codec();
    let (lba_first, lba_last) = (this.lba_first, this.lba_last);
    let blocks_in_band = this.layout.geometry.blocks_in_band();

    let snippet_buf = Md::buffer(this.snippet_md.as_ref().unwrap()).unwrap();
    let snippet = snippet_buf.borrow();

    for lba in lba_first..lba_last {
        let addr = codec.load(snippet.as_slice(), lba - lba_first);
        let Addr::Flash(offset) = addr else { continue };

        let prev = this.valid.borrow_mut().set(offset);
        if prev {
            return Err(RecoveryError::Corrupted(format!(
                "base block {} recovered twice",
                offset
            )));
        }
        let band = (offset / blocks_in_band) as usize;
        this.bands.borrow_mut().bump_valid(band);
    }
    Ok(())
}

fn save_window(rec: &RecoveryRef, cb: RecoveryCb) {
    let (md, env) = {
        let this = rec.borrow();
        (
            Rc::clone(this.snippet_md.as_ref().unwrap()),
            this.env.clone(),
        )
    };
    let rec2 = Rc::clone(rec);
    Md::persist(
        &md,
        &env,
        Box::new(move |status| match status {
            Ok(()) => iteration_start(&rec2, cb),
            Err(e) => fail(cb, e.into()),
        }),
    );
}

// Warm restart: the L2P survived in shared memory; rebuild the valid map
// and its counters from the resident table instead of replaying.
fn fast_reload(rec: &RecoveryRef, cb: RecoveryCb) {
    {
        let this = rec.borrow();
        let codec = this.layout.l2p.codec();
        let l2p_buf = this
            .l2p_buf
            .as_ref()
            .expect("warm recovery without the resident L2P");
        let guard = l2p_buf.borrow();

        this.valid.borrow_mut().reset();
        for lba in 0..this.layout.num_lbas {
            if let Addr::Flash(offset) = codec.load(guard.as_slice(), lba) {
                this.valid.borrow_mut().set(offset);
            }
        }
        BandSet::reload_valid_counters(&this.bands);
    }
    log::info!("fast recovery: shared-memory L2P reused");
    finalize_open_bands(rec, cb);
}

// Last step: a band whose checkpoint covered the whole data area was
// caught between its final data write and its tail write. The replay
// above already consumed its resident map; writing the tail now
// completes the interrupted close.
fn finalize_open_bands(rec: &RecoveryRef, cb: RecoveryCb) {
    let full: Vec<usize> = {
        let this = rec.borrow();
        let usable = BandSet::usable_blocks(&this.bands);
        BandSet::open_bands(&this.bands)
            .into_iter()
            .filter(|&idx| {
                BandSet::resident_map(&this.bands, idx).is_some()
                    && BandSet::band_md(&this.bands, idx).write_pointer == usable
            })
            .collect()
    };
    finalize_band_at(rec, full, 0, cb);
}

fn finalize_band_at(rec: &RecoveryRef, full: Vec<usize>, at: usize, cb: RecoveryCb) {
    if at >= full.len() {
        finish(rec, cb);
        return;
    }
    let idx = full[at];
    log::info!("finishing interrupted close of band {}", idx);
    let bands = rec.borrow().bands.clone();
    let rec2 = Rc::clone(rec);
    BandSet::close(
        &bands,
        idx,
        Box::new(move |status| match status {
            Ok(()) => finalize_band_at(&rec2, full, at + 1, cb),
            Err(e) => fail(cb, e.into()),
        }),
    );
}

fn finish(rec: &RecoveryRef, cb: RecoveryCb) {
    {
        let mut this = rec.borrow_mut();
        if let Some(md) = this.snippet_md.take() {
            Md::destroy(&md);
        }
    }
    log::info!("recovery complete");
    cb(Ok(()));
}
