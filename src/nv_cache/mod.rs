//! # Non-Volatile Cache
//!
//! The cache data region is an array of fixed-size chunks written
//! sequentially. The last blocks of every chunk hold its LBA map (tail
//! metadata); per-chunk metadata for all chunks lives in a separate
//! region, one block per chunk, persisted entry-granular on every state
//! change.
//!
//! Chunk lifecycle: FREE chunks are opened on demand (two at a time) by
//! `process`; user writes advance the write pointer at submission and the
//! written count at completion; once the data area is exhausted the tail
//! map goes out, the metadata entry flips to CLOSED with the map's CRC32C,
//! and the chunk joins the full list until compaction drains and frees it.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::core::addr::{Addr, AddrCodec};
use crate::core::buf::{shared_buf, SharedBuf};
use crate::core::{FTL_BLOCK_SIZE, FTL_LBA_INVALID, FTL_MD_VSS_SZ};
use crate::device::{IoCompletion, IoStatus, SubmitError};
use crate::layout::{Layout, RegionType};
use crate::md::vss;
use crate::md::{Md, MdEntryCtxRef, MdEnv, MdError, MdRef};

/// Maximum number of concurrently open chunks.
pub const FTL_MAX_OPEN_CHUNKS: usize = 2;

/// Cache subsystem errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NvCacheError {
    /// Chunk metadata I/O failed.
    #[error("chunk metadata I/O failed: {0}")]
    Md(#[from] MdError),

    /// A closed chunk's LBA map does not match its recorded checksum.
    #[error("chunk {chunk} LBA map checksum mismatch")]
    BadChecksum {
        /// Index of the offending chunk.
        chunk: usize,
    },

    /// A data or tail-map transfer failed.
    #[error("cache I/O failed")]
    Io,
}

/// Chunk lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkState {
    /// Unused; all metadata fields zero.
    #[default]
    Free,
    /// Accepting writes.
    Open,
    /// Tail map written and checksummed.
    Closed,
}

impl ChunkState {
    fn to_wire(self) -> u32 {
        match self {
            ChunkState::Free => 0,
            ChunkState::Open => 1,
            ChunkState::Closed => 2,
        }
    }

    fn from_wire(raw: u32) -> Self {
        match raw {
            1 => ChunkState::Open,
            2 => ChunkState::Closed,
            _ => ChunkState::Free,
        }
    }
}

/// Per-chunk metadata, one block on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkMd {
    /// Sequence id assigned when the chunk opened.
    pub seq_id: u64,
    /// Sequence id assigned when the chunk closed.
    pub close_seq_id: u64,
    /// Next block to write, advanced at submission.
    pub write_pointer: u64,
    /// Blocks whose writes completed.
    pub blocks_written: u64,
    /// Blocks skipped because a request did not fit the remainder.
    pub blocks_skipped: u64,
    /// Next block to compact.
    pub read_pointer: u64,
    /// Blocks already relocated by compaction.
    pub blocks_compacted: u64,
    /// Lifecycle state.
    pub state: ChunkState,
    /// CRC32C of the tail map; non-zero only on closed chunks.
    pub lba_map_checksum: u32,
}

const MD_OFF_SEQ_ID: usize = 0;
const MD_OFF_CLOSE_SEQ_ID: usize = 8;
const MD_OFF_WRITE_POINTER: usize = 16;
const MD_OFF_BLOCKS_WRITTEN: usize = 24;
const MD_OFF_BLOCKS_SKIPPED: usize = 32;
const MD_OFF_READ_POINTER: usize = 40;
const MD_OFF_BLOCKS_COMPACTED: usize = 48;
const MD_OFF_STATE: usize = 56;
const MD_OFF_LBA_MAP_CHECKSUM: usize = 60;

impl ChunkMd {
    /// Encode into the head of a metadata entry block.
    pub fn encode(&self, block: &mut [u8]) {
        block[..FTL_BLOCK_SIZE].fill(0);
        LittleEndian::write_u64(&mut block[MD_OFF_SEQ_ID..], self.seq_id);
        LittleEndian::write_u64(&mut block[MD_OFF_CLOSE_SEQ_ID..], self.close_seq_id);
        LittleEndian::write_u64(&mut block[MD_OFF_WRITE_POINTER..], self.write_pointer);
        LittleEndian::write_u64(&mut block[MD_OFF_BLOCKS_WRITTEN..], self.blocks_written);
        LittleEndian::write_u64(&mut block[MD_OFF_BLOCKS_SKIPPED..], self.blocks_skipped);
        LittleEndian::write_u64(&mut block[MD_OFF_READ_POINTER..], self.read_pointer);
        LittleEndian::write_u64(&mut block[MD_OFF_BLOCKS_COMPACTED..], self.blocks_compacted);
        LittleEndian::write_u32(&mut block[MD_OFF_STATE..], self.state.to_wire());
        LittleEndian::write_u32(&mut block[MD_OFF_LBA_MAP_CHECKSUM..], self.lba_map_checksum);
    }

    /// Decode from a metadata entry block.
    pub fn decode(block: &[u8]) -> Self {
        ChunkMd {
            seq_id: LittleEndian::read_u64(&block[MD_OFF_SEQ_ID..]),
            close_seq_id: LittleEndian::read_u64(&block[MD_OFF_CLOSE_SEQ_ID..]),
            write_pointer: LittleEndian::read_u64(&block[MD_OFF_WRITE_POINTER..]),
            blocks_written: LittleEndian::read_u64(&block[MD_OFF_BLOCKS_WRITTEN..]),
            blocks_skipped: LittleEndian::read_u64(&block[MD_OFF_BLOCKS_SKIPPED..]),
            read_pointer: LittleEndian::read_u64(&block[MD_OFF_READ_POINTER..]),
            blocks_compacted: LittleEndian::read_u64(&block[MD_OFF_BLOCKS_COMPACTED..]),
            state: ChunkState::from_wire(LittleEndian::read_u32(&block[MD_OFF_STATE..])),
            lba_map_checksum: LittleEndian::read_u32(&block[MD_OFF_LBA_MAP_CHECKSUM..]),
        }
    }
}

/// Fixed-size buffer pool: an owned free list of equally sized buffers.
/// Callers size pools to their concurrency bound and treat exhaustion on
/// control paths as fatal.
pub struct BufPool {
    free: Vec<SharedBuf>,
    elem_len: usize,
}

impl BufPool {
    /// Create a pool of `count` buffers of `elem_len` bytes.
    pub fn new(count: usize, elem_len: usize) -> Self {
        BufPool {
            free: (0..count).map(|_| shared_buf(elem_len)).collect(),
            elem_len,
        }
    }

    /// Take a buffer.
    pub fn get(&mut self) -> Option<SharedBuf> {
        self.free.pop()
    }

    /// Return a buffer.
    pub fn put(&mut self, buf: SharedBuf) {
        debug_assert_eq!(buf.borrow().len(), self.elem_len);
        self.free.push(buf);
    }

    /// Buffers currently available.
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

/// One cache chunk.
pub struct Chunk {
    /// In-memory metadata.
    pub md: ChunkMd,
    /// Absolute cache-device block of the chunk start.
    pub offset: u64,
    lba_map: Option<SharedBuf>,
    dma_md: Option<SharedBuf>,
    persist_ctx: Option<MdEntryCtxRef>,
}

/// A cache slot handed to a user write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSlot {
    /// Chunk receiving the write.
    pub chunk: usize,
    /// Absolute cache-device block of the first payload block.
    pub addr: u64,
    /// Number of blocks.
    pub num_blocks: u64,
}

/// Shared handle to the cache.
pub type NvcRef = Rc<RefCell<NvCache>>;

/// The non-volatile cache.
pub struct NvCache {
    halt: bool,
    chunk_blocks: u64,
    chunk_count: u64,
    tail_md_blocks: u64,
    data_offset: u64,
    data_version: u64,
    codec: AddrCodec,
    chunks: Vec<Chunk>,
    free_list: VecDeque<usize>,
    open_list: Vec<usize>,
    full_list: VecDeque<usize>,
    current: Option<usize>,
    chunk_open_count: usize,
    md: MdRef,
    env: MdEnv,
    seq: Rc<Cell<u64>>,
    lba_pool: BufPool,
    chunk_md_pool: BufPool,
    io_vss_pool: BufPool,
    self_weak: Weak<RefCell<NvCache>>,
}

impl NvCache {
    /// Build the chunk array over the cache data region and seed the free
    /// list.
    pub fn new(
        layout: &Layout,
        md: MdRef,
        env: MdEnv,
        seq: Rc<Cell<u64>>,
        user_io_pool_size: usize,
        io_blocks_max: u64,
    ) -> NvcRef {
        let data_offset = layout.nvc_data_offset();
        let chunk_count = layout.chunk_count;
        let chunk_blocks = layout.chunk_blocks;
        let tail_md_blocks = layout.chunk_tail_md_blocks;
        let tail_bytes = tail_md_blocks as usize * FTL_BLOCK_SIZE;

        let chunks = (0..chunk_count)
            .map(|i| Chunk {
                md: ChunkMd::default(),
                offset: data_offset + i * chunk_blocks,
                lba_map: None,
                dma_md: None,
                persist_ctx: None,
            })
            .collect();

        let nvc = Rc::new(RefCell::new(NvCache {
            halt: true,
            chunk_blocks,
            chunk_count,
            tail_md_blocks,
            data_offset,
            data_version: layout.region(RegionType::DataNvc).version,
            codec: layout.l2p.codec(),
            chunks,
            free_list: (0..chunk_count as usize).collect(),
            open_list: Vec::new(),
            full_list: VecDeque::new(),
            current: None,
            chunk_open_count: 0,
            md,
            env,
            seq,
            lba_pool: BufPool::new(FTL_MAX_OPEN_CHUNKS, tail_bytes),
            chunk_md_pool: BufPool::new(FTL_MAX_OPEN_CHUNKS, FTL_BLOCK_SIZE),
            io_vss_pool: BufPool::new(
                user_io_pool_size,
                io_blocks_max as usize * FTL_MD_VSS_SZ,
            ),
            self_weak: Weak::new(),
        }));
        nvc.borrow_mut().self_weak = Rc::downgrade(&nvc);
        nvc
    }

    /// Resume accepting writes.
    pub fn resume(nvc: &NvcRef) {
        nvc.borrow_mut().halt = false;
    }

    /// Chunk holding an absolute cache-device offset.
    pub fn chunk_index_of(nvc: &NvcRef, cache_offset: u64) -> usize {
        let this = nvc.borrow();
        debug_assert!(cache_offset >= this.data_offset);
        let idx = (cache_offset - this.data_offset) / this.chunk_blocks;
        debug_assert!(idx < this.chunk_count);
        idx as usize
    }

    /// In-memory metadata snapshot of a chunk.
    pub fn chunk_md(nvc: &NvcRef, idx: usize) -> ChunkMd {
        nvc.borrow().chunks[idx].md
    }

    /// Number of open chunks.
    pub fn open_count(nvc: &NvcRef) -> usize {
        nvc.borrow().chunk_open_count
    }

    /// Indices of full (closed, not yet compacted) chunks, oldest first.
    pub fn full_chunks(nvc: &NvcRef) -> Vec<usize> {
        nvc.borrow().full_list.iter().copied().collect()
    }

    /// Highest open and close sequence ids across all chunks.
    pub fn max_seq_ids(nvc: &NvcRef) -> (u64, u64) {
        let this = nvc.borrow();
        let open = this.chunks.iter().map(|c| c.md.seq_id).max().unwrap_or(0);
        let close = this
            .chunks
            .iter()
            .map(|c| c.md.close_seq_id)
            .max()
            .unwrap_or(0);
        (open, close)
    }

    fn next_seq(&self) -> u64 {
        let next = self.seq.get() + 1;
        self.seq.set(next);
        next
    }

    fn free_space(&self, idx: usize) -> u64 {
        let md = &self.chunks[idx].md;
        debug_assert!(md.write_pointer + self.tail_md_blocks <= self.chunk_blocks);
        self.chunk_blocks - self.tail_md_blocks - md.write_pointer
    }

    /// Open-chunk replenishment: keep up to two chunks open while the
    /// cache is running and free chunks remain.
    pub fn process(nvc: &NvcRef) {
        loop {
            let idx = {
                let mut this = nvc.borrow_mut();
                if this.halt || this.chunk_open_count >= FTL_MAX_OPEN_CHUNKS {
                    return;
                }
                match this.free_list.pop_front() {
                    Some(idx) => {
                        this.open_list.push(idx);
                        idx
                    }
                    None => return,
                }
            };
            chunk_open(nvc, idx);
        }
    }

    /// Reserve `num_blocks` of cache space. Returns `None` when no open
    /// chunk can take the request yet.
    pub fn allocate(nvc: &NvcRef, num_blocks: u64) -> Option<WriteSlot> {
        loop {
            let skipped_chunk = {
                let mut this = nvc.borrow_mut();
                debug_assert!(num_blocks <= this.chunk_blocks - this.tail_md_blocks);
                let idx = match this.current {
                    Some(idx) => idx,
                    None => {
                        // A chunk qualifies once its open persisted and
                        // it still has room ahead of the tail map.
                        let next = this.open_list.iter().copied().find(|&i| {
                            let md = &this.chunks[i].md;
                            md.state == ChunkState::Open
                                && md.write_pointer + this.tail_md_blocks < this.chunk_blocks
                        });
                        match next {
                            Some(idx) => {
                                this.current = Some(idx);
                                idx
                            }
                            None => return None,
                        }
                    }
                };

                let free = this.free_space(idx);
                if num_blocks <= free {
                    let chunk = &mut this.chunks[idx];
                    let addr = chunk.offset + chunk.md.write_pointer;
                    chunk.md.write_pointer += num_blocks;
                    if num_blocks == free {
                        this.current = None;
                    }
                    return Some(WriteSlot {
                        chunk: idx,
                        addr,
                        num_blocks,
                    });
                }

                // Request does not fit the remainder: account the gap as
                // skipped and move on to the next open chunk.
                let chunk = &mut this.chunks[idx];
                chunk.md.blocks_skipped += free;
                chunk.md.write_pointer += free;
                this.current = None;
                idx
            };
            maybe_close(nvc, skipped_chunk);
        }
    }

    /// Record completion of `num_blocks` payload blocks on a chunk,
    /// closing it once the data area is exhausted.
    pub fn advance_blocks(nvc: &NvcRef, idx: usize, num_blocks: u64) {
        {
            let mut this = nvc.borrow_mut();
            let md = &mut this.chunks[idx].md;
            md.blocks_written += num_blocks;
            debug_assert!(md.blocks_written + md.blocks_skipped <= md.write_pointer);
        }
        maybe_close(nvc, idx);
    }

    /// Record the LBA of a cached block in its chunk's map.
    pub fn set_addr(nvc: &NvcRef, lba: u64, addr: Addr) {
        let idx = NvCache::chunk_index_of(nvc, addr.cache_offset());
        let this = nvc.borrow();
        let chunk = &this.chunks[idx];
        let map_idx = addr.cache_offset() - chunk.offset;
        if let Some(map) = &chunk.lba_map {
            this.codec
                .lba_store(map.borrow_mut().as_mut_slice(), map_idx, lba);
        } else {
            debug_assert!(false, "LBA recorded on a chunk without a map");
        }
    }

    /// Mark a cached block logically invalid in its chunk's map. A no-op
    /// once the chunk's map left memory; recovery ordering handles those.
    pub fn invalidate(nvc: &NvcRef, addr: Addr) {
        let idx = NvCache::chunk_index_of(nvc, addr.cache_offset());
        let this = nvc.borrow();
        let chunk = &this.chunks[idx];
        if let Some(map) = &chunk.lba_map {
            let map_idx = addr.cache_offset() - chunk.offset;
            this.codec
                .lba_store(map.borrow_mut().as_mut_slice(), map_idx, FTL_LBA_INVALID);
        }
    }

    /// LBA recorded for a cached block, when its chunk map is resident.
    pub fn map_get_lba(nvc: &NvcRef, addr: Addr) -> Option<u64> {
        let idx = NvCache::chunk_index_of(nvc, addr.cache_offset());
        let this = nvc.borrow();
        let chunk = &this.chunks[idx];
        chunk.lba_map.as_ref().map(|map| {
            let map_idx = addr.cache_offset() - chunk.offset;
            this.codec.lba_load(map.borrow().as_slice(), map_idx)
        })
    }

    /// Stamp per-block VSS for a user write: the block's LBA plus the
    /// data-region version.
    pub fn fill_md(nvc: &NvcRef, vss_buf: &SharedBuf, first_lba: u64, num_blocks: u64) {
        let version = nvc.borrow().data_version;
        let mut guard = vss_buf.borrow_mut();
        let buf = guard.as_mut_slice();
        for i in 0..num_blocks {
            let rec = vss::record_mut(buf, i as usize);
            rec.fill(0);
            vss::set_version(rec, version);
            vss::set_nv_lba(rec, first_lba + i);
        }
    }

    /// Take a per-I/O VSS buffer from the pool.
    pub fn io_vss_get(nvc: &NvcRef) -> Option<SharedBuf> {
        nvc.borrow_mut().io_vss_pool.get()
    }

    /// Return a per-I/O VSS buffer to the pool.
    pub fn io_vss_put(nvc: &NvcRef, buf: SharedBuf) {
        nvc.borrow_mut().io_vss_pool.put(buf);
    }

    /// Handle to the chunk-metadata object.
    pub fn md_handle(nvc: &NvcRef) -> MdRef {
        Rc::clone(&nvc.borrow().md)
    }

    /// Read cached payload blocks. The completion always fires.
    pub fn read(
        nvc: &NvcRef,
        addr: Addr,
        num_blocks: u64,
        buf: &SharedBuf,
        buf_offset: usize,
        cb: IoCompletion,
    ) {
        let (env, offset) = {
            let this = nvc.borrow();
            (this.env.clone(), addr.cache_offset())
        };
        crate::device::submit_retrying(
            &env.cache_bdev,
            &env.cache_ch,
            crate::device::IoDir::Read,
            buf,
            buf_offset,
            None,
            0,
            offset,
            num_blocks,
            cb,
        );
    }

    /// Refuse new writes and drive open chunks to closure. Idempotent;
    /// the halt sequence calls it until `is_halted` holds.
    pub fn halt(nvc: &NvcRef) {
        let mut reset = Vec::new();
        let close_current = {
            let mut this = nvc.borrow_mut();
            this.halt = true;

            // Open chunks that never took user data reset straight to
            // free.
            let untouched: Vec<usize> = this
                .open_list
                .iter()
                .copied()
                .filter(|&i| {
                    this.chunks[i].md.state == ChunkState::Open
                        && this.chunks[i].md.write_pointer == 0
                        && this.current != Some(i)
                })
                .collect();
            for idx in untouched {
                this.open_list.retain(|&i| i != idx);
                let lba_map = this.chunks[idx].lba_map.take();
                let dma = this.chunks[idx].dma_md.take();
                if let Some(map) = lba_map {
                    this.lba_pool.put(map);
                }
                if let Some(dma) = dma {
                    this.chunk_md_pool.put(dma);
                }
                this.chunks[idx].md = ChunkMd::default();
                this.chunks[idx].persist_ctx = None;
                debug_assert!(this.chunk_open_count > 0);
                this.chunk_open_count -= 1;
                this.free_list.push_back(idx);
                reset.push(idx);
            }

            this.current.take()
        };

        if !reset.is_empty() {
            log::debug!("halt reset {} untouched open chunks", reset.len());
            for &idx in &reset {
                persist_zeroed_chunk_entry(nvc, idx);
            }
        }

        if let Some(idx) = close_current {
            let skipped = {
                let mut this = nvc.borrow_mut();
                if this.chunks[idx].md.write_pointer == this.chunk_blocks {
                    return;
                }
                let free = this.free_space(idx);
                let md = &mut this.chunks[idx].md;
                md.blocks_skipped += free;
                md.write_pointer += free;
                free
            };
            log::debug!("halt skipped {} unwritten blocks on chunk {}", skipped, idx);
            maybe_close(nvc, idx);
        }
    }

    /// Drained: no chunk remains open.
    pub fn is_halted(nvc: &NvcRef) -> bool {
        nvc.borrow().chunk_open_count == 0
    }

    /// Whether the cache can take no further writes.
    pub fn is_full(nvc: &NvcRef) -> bool {
        let this = nvc.borrow();
        this.chunk_open_count == 0 && this.current.is_none() && this.free_list.is_empty()
    }
}

fn persist_chunk_md(nvc: &NvcRef, idx: usize, on_done: Rc<dyn Fn(Result<(), MdError>)>) {
    let (md, env, dma, entry_vss) = {
        let this = nvc.borrow();
        let dma = this.chunks[idx]
            .dma_md
            .clone()
            .expect("chunk metadata persist without staging block");
        let region = Md::region(&this.md).expect("chunk metadata object without region");
        let entry_vss = Md::vss_buf_alloc(&region, 1);
        (Rc::clone(&this.md), this.env.clone(), dma, entry_vss)
    };
    let ctx = Md::persist_entry(&md, &env, idx as u64, dma, Some(entry_vss), on_done);
    nvc.borrow_mut().chunks[idx].persist_ctx = Some(ctx);
}

fn chunk_open(nvc: &NvcRef, idx: usize) {
    {
        let mut this = nvc.borrow_mut();
        let lba_map = this
            .lba_pool
            .get()
            .expect("chunk LBA map pool exhausted with a bounded open count");
        lba_map.borrow_mut().fill(0xFF);
        let dma = this
            .chunk_md_pool
            .get()
            .expect("chunk metadata pool exhausted with a bounded open count");

        this.chunk_open_count += 1;
        let seq = this.next_seq();
        let chunk = &mut this.chunks[idx];
        debug_assert_eq!(chunk.md.write_pointer, 0);
        debug_assert_eq!(chunk.md.blocks_written, 0);
        chunk.md.seq_id = seq;

        let mut staged = chunk.md;
        staged.state = ChunkState::Open;
        staged.lba_map_checksum = 0;
        staged.encode(dma.borrow_mut().as_mut_slice());

        chunk.lba_map = Some(lba_map);
        chunk.dma_md = Some(dma);
    }

    let weak = nvc.borrow().self_weak.clone();
    let on_done: Rc<dyn Fn(Result<(), MdError>)> = Rc::new(move |status| {
        let Some(nvc) = weak.upgrade() else { return };
        match status {
            Ok(()) => {
                nvc.borrow_mut().chunks[idx].md.state = ChunkState::Open;
            }
            Err(_) => {
                log::warn!("chunk {} open persist failed, retrying", idx);
                let (md, env, ctx) = {
                    let this = nvc.borrow();
                    (
                        Rc::clone(&this.md),
                        this.env.clone(),
                        this.chunks[idx].persist_ctx.clone(),
                    )
                };
                if let Some(ctx) = ctx {
                    Md::persist_entry_retry(&md, &env, &ctx);
                }
            }
        }
    });
    persist_chunk_md(nvc, idx, on_done);
}

fn maybe_close(nvc: &NvcRef, idx: usize) {
    let ready = {
        let this = nvc.borrow();
        let md = &this.chunks[idx].md;
        md.state == ChunkState::Open
            && md.write_pointer + this.tail_md_blocks == this.chunk_blocks
            && md.blocks_written + md.blocks_skipped == md.write_pointer
    };
    if ready {
        chunk_close(nvc, idx);
    }
}

fn chunk_close(nvc: &NvcRef, idx: usize) {
    {
        let mut this = nvc.borrow_mut();
        let tail = this.tail_md_blocks;
        let chunk_blocks = this.chunk_blocks;
        let chunk = &mut this.chunks[idx];
        debug_assert_eq!(
            chunk.md.write_pointer + tail,
            chunk_blocks,
            "tail write starts at the tail offset"
        );
        chunk.md.write_pointer += tail;
        if this.current == Some(idx) {
            this.current = None;
        }
    }
    tail_write_submit(nvc, idx);
}

fn tail_write_submit(nvc: &NvcRef, idx: usize) {
    let (env, map, addr, tail) = {
        let this = nvc.borrow();
        let chunk = &this.chunks[idx];
        let map = chunk
            .lba_map
            .clone()
            .expect("closing chunk without an LBA map");
        let addr = chunk.offset + this.chunk_blocks - this.tail_md_blocks;
        (this.env.clone(), map, addr, this.tail_md_blocks)
    };

    let weak = nvc.borrow().self_weak.clone();
    let cb: IoCompletion = Box::new(move |status| {
        if let Some(nvc) = weak.upgrade() {
            tail_write_done(&nvc, idx, status);
        }
    });

    let result = env
        .cache_bdev
        .write_blocks(&env.cache_ch, &map, 0, addr, tail, cb);
    match result {
        Ok(()) => {}
        Err(SubmitError::NoMem) => {
            let weak = nvc.borrow().self_weak.clone();
            env.cache_bdev.queue_io_wait(
                &env.cache_ch,
                Box::new(move || {
                    if let Some(nvc) = weak.upgrade() {
                        tail_write_submit(&nvc, idx);
                    }
                }),
            );
        }
        Err(SubmitError::Failed) => tail_write_done(nvc, idx, IoStatus::Failed),
    }
}

fn tail_write_done(nvc: &NvcRef, idx: usize, status: IoStatus) {
    if !status.is_ok() {
        // Rewind past the tail blocks and push the write again from the
        // next scheduling round.
        let (reactor, weak) = {
            let mut this = nvc.borrow_mut();
            let tail = this.tail_md_blocks;
            this.chunks[idx].md.write_pointer -= tail;
            (Rc::clone(&this.env.reactor), this.self_weak.clone())
        };
        log::warn!("chunk {} tail map write failed, retrying", idx);
        reactor.send_msg(Box::new(move || {
            if let Some(nvc) = weak.upgrade() {
                chunk_close(&nvc, idx);
            }
        }));
        return;
    }

    let crc = {
        let mut this = nvc.borrow_mut();
        let close_seq = this.next_seq();
        let chunk = &mut this.chunks[idx];
        let map = chunk.lba_map.as_ref().unwrap();
        let crc = crc32c::crc32c(map.borrow().as_slice());
        chunk.md.close_seq_id = close_seq;

        let mut staged = chunk.md;
        staged.state = ChunkState::Closed;
        staged.lba_map_checksum = crc;
        let dma = chunk.dma_md.as_ref().expect("closing chunk without staging");
        staged.encode(dma.borrow_mut().as_mut_slice());
        crc
    };

    let weak = nvc.borrow().self_weak.clone();
    let on_done: Rc<dyn Fn(Result<(), MdError>)> = Rc::new(move |status| {
        let Some(nvc) = weak.upgrade() else { return };
        match status {
            Ok(()) => {
                let mut this = nvc.borrow_mut();
                debug_assert_eq!(this.chunks[idx].md.write_pointer, this.chunk_blocks);
                let lba_map = this.chunks[idx].lba_map.take();
                let dma = this.chunks[idx].dma_md.take();
                if let Some(map) = lba_map {
                    this.lba_pool.put(map);
                }
                if let Some(dma) = dma {
                    this.chunk_md_pool.put(dma);
                }
                this.chunks[idx].persist_ctx = None;
                this.chunks[idx].md.state = ChunkState::Closed;
                this.chunks[idx].md.lba_map_checksum = crc;
                debug_assert!(this.chunk_open_count > 0);
                this.chunk_open_count -= 1;
                this.open_list.retain(|&i| i != idx);
                this.full_list.push_back(idx);
            }
            Err(_) => {
                log::warn!("chunk {} close persist failed, retrying", idx);
                let (md, env, ctx) = {
                    let this = nvc.borrow();
                    (
                        Rc::clone(&this.md),
                        this.env.clone(),
                        this.chunks[idx].persist_ctx.clone(),
                    )
                };
                if let Some(ctx) = ctx {
                    Md::persist_entry_retry(&md, &env, &ctx);
                }
            }
        }
    });
    persist_chunk_md(nvc, idx, on_done);
}

// ---------------------------------------------------------------------------
// Compaction mechanics
// ---------------------------------------------------------------------------

impl NvCache {
    /// Pop the oldest full chunk for compaction.
    pub fn compaction_take(nvc: &NvcRef) -> Option<usize> {
        nvc.borrow_mut().full_list.pop_front()
    }

    /// Read a closed chunk's tail map back from the device.
    pub fn read_tail_map(
        nvc: &NvcRef,
        idx: usize,
        cb: Box<dyn FnOnce(Result<SharedBuf, NvCacheError>)>,
    ) {
        let (env, addr, tail) = {
            let this = nvc.borrow();
            let chunk = &this.chunks[idx];
            (
                this.env.clone(),
                chunk.offset + this.chunk_blocks - this.tail_md_blocks,
                this.tail_md_blocks,
            )
        };
        let buf = shared_buf(tail as usize * FTL_BLOCK_SIZE);
        let buf2 = buf.clone();
        let io_cb: IoCompletion = Box::new(move |status| {
            if status.is_ok() {
                cb(Ok(buf2));
            } else {
                log::error!("tail map read failed on chunk {}", idx);
                cb(Err(NvCacheError::Io));
            }
        });
        crate::device::submit_retrying(
            &env.cache_bdev,
            &env.cache_ch,
            crate::device::IoDir::Read,
            &buf,
            0,
            None,
            0,
            addr,
            tail,
            io_cb,
        );
    }

    /// Account relocated blocks; a fully drained chunk resets to free and
    /// its zeroed metadata entry is persisted.
    pub fn mark_compacted(nvc: &NvcRef, idx: usize, num_blocks: u64) {
        let drained = {
            let mut this = nvc.borrow_mut();
            let md = &mut this.chunks[idx].md;
            md.read_pointer += num_blocks;
            md.blocks_compacted += num_blocks;
            md.blocks_compacted >= md.blocks_written
        };
        if !drained {
            return;
        }

        {
            let mut this = nvc.borrow_mut();
            this.chunks[idx].md = ChunkMd::default();
            this.free_list.push_back(idx);
        }
        persist_zeroed_chunk_entry(nvc, idx);
    }
}

// ---------------------------------------------------------------------------
// State restore
// ---------------------------------------------------------------------------

impl NvCache {
    /// Restore chunk state from the chunk-metadata region: decode every
    /// entry, rebuild the lists, and verify the tail-map checksum of every
    /// closed chunk. Open chunks are left for
    /// [`NvCache::recover_open_chunk`].
    pub fn restore_state(nvc: &NvcRef, cb: Box<dyn FnOnce(Result<(), NvCacheError>)>) {
        let (md, env) = {
            let this = nvc.borrow();
            (Rc::clone(&this.md), this.env.clone())
        };
        let weak = nvc.borrow().self_weak.clone();
        Md::restore(
            &md,
            &env,
            Box::new(move |status| {
                let Some(nvc) = weak.upgrade() else { return };
                match status {
                    Ok(()) => {
                        decode_chunk_states(&nvc);
                        verify_closed_chunks(&nvc, 0, cb);
                    }
                    Err(e) => cb(Err(NvCacheError::Md(e))),
                }
            }),
        );
    }

    /// Chunks restored in the open state, ascending by sequence id.
    pub fn open_chunks(nvc: &NvcRef) -> Vec<usize> {
        let this = nvc.borrow();
        let mut open: Vec<usize> = (0..this.chunks.len())
            .filter(|&i| this.chunks[i].md.state == ChunkState::Open)
            .collect();
        open.sort_by_key(|&i| this.chunks[i].md.seq_id);
        open
    }

    /// Rebuild an open chunk after a dirty shutdown: scan the data area's
    /// VSS for stamped LBAs, rebuild the LBA map, then force-close the
    /// chunk. The write pointer persisted at open time is zero, so the
    /// whole data area is scanned and unstamped blocks become skips.
    pub fn recover_open_chunk(nvc: &NvcRef, idx: usize, cb: Box<dyn FnOnce(Result<(), NvCacheError>)>) {
        let (env, offset, data_blocks) = {
            let this = nvc.borrow();
            let chunk = &this.chunks[idx];
            debug_assert_eq!(chunk.md.state, ChunkState::Open);
            (
                this.env.clone(),
                chunk.offset,
                this.chunk_blocks - this.tail_md_blocks,
            )
        };

        let data = shared_buf(data_blocks as usize * FTL_BLOCK_SIZE);
        let vss = shared_buf(data_blocks as usize * FTL_MD_VSS_SZ);
        let weak = nvc.borrow().self_weak.clone();
        let vss2 = vss.clone();
        let io_cb: IoCompletion = Box::new(move |status| {
            let Some(nvc) = weak.upgrade() else { return };
            if !status.is_ok() {
                log::error!("open-chunk VSS scan failed on chunk {}", idx);
                cb(Err(NvCacheError::Io));
                return;
            }
            let written = rebuild_open_chunk_map(&nvc, idx, &vss2, data_blocks);
            if written == 0 {
                // Nothing landed before the crash; the chunk goes back
                // to the free pool instead of closing empty.
                reset_recovered_chunk(&nvc, idx);
            } else {
                // Closing writes the rebuilt tail map and persists
                // CLOSED metadata; completion is observed through the
                // chunk state.
                maybe_close(&nvc, idx);
            }
            cb(Ok(()))
        });

        crate::device::submit_retrying(
            &env.cache_bdev,
            &env.cache_ch,
            crate::device::IoDir::Read,
            &data,
            0,
            Some(&vss),
            0,
            offset,
            data_blocks,
            io_cb,
        );
    }
}

fn decode_chunk_states(nvc: &NvcRef) {
    let mut this = nvc.borrow_mut();
    let buf = Md::buffer(&this.md).expect("chunk metadata object without buffer");
    let guard = buf.borrow();
    let raw = guard.as_slice();

    this.free_list.clear();
    this.open_list.clear();
    this.full_list.clear();
    this.current = None;
    this.chunk_open_count = 0;

    let mut closed: Vec<usize> = Vec::new();
    for idx in 0..this.chunks.len() {
        let entry = &raw[idx * FTL_BLOCK_SIZE..(idx + 1) * FTL_BLOCK_SIZE];
        let md = ChunkMd::decode(entry);
        this.chunks[idx].md = md;
        match md.state {
            ChunkState::Free => this.free_list.push_back(idx),
            ChunkState::Open => {}
            ChunkState::Closed => closed.push(idx),
        }
    }
    // Full list drains oldest data first.
    closed.sort_by_key(|&i| this.chunks[i].md.close_seq_id);
    this.full_list = closed.into_iter().collect();
}

fn verify_closed_chunks(
    nvc: &NvcRef,
    from: usize,
    cb: Box<dyn FnOnce(Result<(), NvCacheError>)>,
) {
    let next = {
        let this = nvc.borrow();
        (from..this.chunks.len()).find(|&i| this.chunks[i].md.state == ChunkState::Closed)
    };
    let Some(idx) = next else {
        cb(Ok(()));
        return;
    };

    let weak = nvc.borrow().self_weak.clone();
    NvCache::read_tail_map(
        nvc,
        idx,
        Box::new(move |result| {
            let Some(nvc) = weak.upgrade() else { return };
            match result {
                Ok(map) => {
                    let expected = nvc.borrow().chunks[idx].md.lba_map_checksum;
                    let actual = crc32c::crc32c(map.borrow().as_slice());
                    if expected != actual {
                        log::error!(
                            "chunk {} tail map CRC mismatch: {:#x} != {:#x}",
                            idx,
                            actual,
                            expected
                        );
                        cb(Err(NvCacheError::BadChecksum { chunk: idx }));
                        return;
                    }
                    verify_closed_chunks(&nvc, idx + 1, cb);
                }
                Err(e) => cb(Err(e)),
            }
        }),
    );
}

fn reset_recovered_chunk(nvc: &NvcRef, idx: usize) {
    {
        let mut this = nvc.borrow_mut();
        let lba_map = this.chunks[idx].lba_map.take();
        let dma_md = this.chunks[idx].dma_md.take();
        if let Some(map) = lba_map {
            this.lba_pool.put(map);
        }
        if let Some(dma) = dma_md {
            this.chunk_md_pool.put(dma);
        }
        this.chunks[idx].md = ChunkMd::default();
        this.open_list.retain(|&i| i != idx);
        debug_assert!(this.chunk_open_count > 0);
        this.chunk_open_count -= 1;
        this.free_list.push_back(idx);
    }
    persist_zeroed_chunk_entry(nvc, idx);
}

/// Write a zeroed (free) metadata entry for a chunk.
fn persist_zeroed_chunk_entry(nvc: &NvcRef, idx: usize) {
    let (md_obj, env, dma, entry_vss) = {
        let this = nvc.borrow();
        let dma = shared_buf(FTL_BLOCK_SIZE);
        ChunkMd::default().encode(dma.borrow_mut().as_mut_slice());
        let region = Md::region(&this.md).expect("chunk metadata object without region");
        let entry_vss = Md::vss_buf_alloc(&region, 1);
        (Rc::clone(&this.md), this.env.clone(), dma, entry_vss)
    };
    let _ctx = Md::persist_entry(
        &md_obj,
        &env,
        idx as u64,
        dma,
        Some(entry_vss),
        Rc::new(move |status| {
            if let Err(e) = status {
                log::error!("free-chunk metadata persist failed on {}: {}", idx, e);
            }
        }),
    );
}

fn rebuild_open_chunk_map(nvc: &NvcRef, idx: usize, vss: &SharedBuf, data_blocks: u64) -> u64 {
    let mut this = nvc.borrow_mut();
    let version = this.data_version;
    let codec = this.codec;
    let tail_bytes = this.tail_md_blocks as usize * FTL_BLOCK_SIZE;

    let map = match this.lba_pool.get() {
        Some(map) => map,
        None => shared_buf(tail_bytes),
    };
    map.borrow_mut().fill(0xFF);

    let mut written = 0u64;
    {
        let guard = vss.borrow();
        let raw = guard.as_slice();
        let mut map_guard = map.borrow_mut();
        for blk in 0..data_blocks {
            let rec = vss::record(raw, blk as usize);
            let lba = vss::nv_lba(rec);
            if vss::version(rec) == version && lba != FTL_LBA_INVALID {
                codec.lba_store(map_guard.as_mut_slice(), blk, lba);
                written += 1;
            }
        }
    }

    let dma = match this.chunk_md_pool.get() {
        Some(dma) => dma,
        None => shared_buf(FTL_BLOCK_SIZE),
    };

    let chunk = &mut this.chunks[idx];
    chunk.lba_map = Some(map);
    chunk.dma_md = Some(dma);
    chunk.md.write_pointer = data_blocks;
    chunk.md.blocks_written = written;
    chunk.md.blocks_skipped = data_blocks - written;
    this.chunk_open_count += 1;
    this.open_list.push(idx);
    log::info!(
        "recovered open chunk {}: {} written, {} skipped",
        idx,
        written,
        data_blocks - written
    );
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FtlConfig;
    use crate::device::mem::MemBdev;
    use crate::device::Bdev;
    use crate::layout::Layout;
    use crate::md::MdCreateFlags;
    use crate::reactor::{Reactor, ReactorRef};
    use uuid::Uuid;

    struct Fixture {
        reactor: ReactorRef,
        cache: Rc<MemBdev>,
        layout: Layout,
        nvc: NvcRef,
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn fixture_with(tweak: impl FnOnce(&mut FtlConfig)) -> Fixture {
        let reactor = Reactor::new();
        let base = MemBdev::new(Rc::clone(&reactor), 8192, 0, 256, 2);
        let cache = MemBdev::new(Rc::clone(&reactor), 4096, 64, 0, 0);
        let mut config = FtlConfig {
            chunk_blocks: 256,
            ..FtlConfig::default()
        };
        tweak(&mut config);
        let layout = Layout::setup(&config, &*base, &*cache, None).unwrap();

        let env = MdEnv {
            reactor: Rc::clone(&reactor),
            cache_ch: cache.open_channel(),
            base_ch: base.open_channel(),
            cache_bdev: Rc::clone(&cache) as Rc<dyn Bdev>,
            base_bdev: base,
            xfer_blocks: 4 * config.xfer_size,
            sb_clean: Rc::new(Cell::new(true)),
        };

        let nvc_region = layout.region(RegionType::NvcMd).clone();
        let mirror = layout.region(RegionType::NvcMdMirror).clone();
        let md = Md::create(
            &Uuid::new_v4(),
            nvc_region.length_blocks,
            64,
            "nvc_md",
            MdCreateFlags::heap(),
            None,
        )
        .unwrap();
        Md::set_region(&md, &nvc_region, Some(&mirror)).unwrap();

        let nvc = NvCache::new(
            &layout,
            md,
            env,
            Rc::new(Cell::new(0)),
            config.user_io_pool_size,
            config.xfer_size,
        );
        NvCache::resume(&nvc);
        Fixture {
            reactor,
            cache,
            layout,
            nvc,
        }
    }

    fn settle(fx: &Fixture) {
        for _ in 0..64 {
            fx.reactor.tick();
        }
    }

    #[test]
    fn test_process_opens_two_chunks() {
        let fx = fixture();
        NvCache::process(&fx.nvc);
        settle(&fx);
        assert_eq!(NvCache::open_count(&fx.nvc), 2);
        assert_eq!(NvCache::chunk_md(&fx.nvc, 0).state, ChunkState::Open);
        assert!(NvCache::chunk_md(&fx.nvc, 0).seq_id > 0);
        assert_eq!(NvCache::chunk_md(&fx.nvc, 0).lba_map_checksum, 0);
    }

    #[test]
    fn test_allocate_advances_write_pointer() {
        let fx = fixture();
        NvCache::process(&fx.nvc);
        settle(&fx);

        let slot = NvCache::allocate(&fx.nvc, 4).unwrap();
        assert_eq!(slot.num_blocks, 4);
        assert_eq!(slot.addr, fx.layout.nvc_data_offset());
        assert_eq!(NvCache::chunk_md(&fx.nvc, slot.chunk).write_pointer, 4);

        NvCache::advance_blocks(&fx.nvc, slot.chunk, 4);
        assert_eq!(NvCache::chunk_md(&fx.nvc, slot.chunk).blocks_written, 4);
    }

    #[test]
    fn test_chunk_closes_when_data_area_fills() {
        let fx = fixture();
        NvCache::process(&fx.nvc);
        settle(&fx);

        let tail = fx.layout.chunk_tail_md_blocks;
        let data_blocks = fx.layout.chunk_blocks - tail;
        let slot = NvCache::allocate(&fx.nvc, data_blocks).unwrap();
        NvCache::advance_blocks(&fx.nvc, slot.chunk, data_blocks);
        settle(&fx);

        let md = NvCache::chunk_md(&fx.nvc, slot.chunk);
        assert_eq!(md.state, ChunkState::Closed);
        assert_ne!(md.lba_map_checksum, 0);
        assert_eq!(md.write_pointer, fx.layout.chunk_blocks);
        assert!(md.close_seq_id > md.seq_id);
        assert!(NvCache::full_chunks(&fx.nvc).contains(&slot.chunk));

        // The persisted metadata entry matches the in-memory state.
        let region = fx.layout.region(RegionType::NvcMd);
        let raw = fx.cache.read_raw(region.offset_blocks + slot.chunk as u64, 1);
        let on_disk = ChunkMd::decode(&raw);
        assert_eq!(on_disk.state, ChunkState::Closed);
        assert_eq!(on_disk.lba_map_checksum, md.lba_map_checksum);
    }

    #[test]
    fn test_halt_skips_unwritten_tail() {
        let fx = fixture();
        NvCache::process(&fx.nvc);
        settle(&fx);

        let slot = NvCache::allocate(&fx.nvc, 100).unwrap();
        NvCache::advance_blocks(&fx.nvc, slot.chunk, 100);

        NvCache::halt(&fx.nvc);
        settle(&fx);
        // Repeated halt calls drain chunks whose open persist landed
        // after the first call.
        NvCache::halt(&fx.nvc);
        settle(&fx);

        let tail = fx.layout.chunk_tail_md_blocks;
        let md = NvCache::chunk_md(&fx.nvc, slot.chunk);
        assert_eq!(md.state, ChunkState::Closed);
        assert_eq!(md.blocks_skipped, fx.layout.chunk_blocks - tail - 100);
        assert_eq!(md.write_pointer, fx.layout.chunk_blocks);
        assert_ne!(md.lba_map_checksum, 0);
        assert!(NvCache::is_halted(&fx.nvc));
    }

    #[test]
    fn test_lba_map_records_and_invalidates() {
        let fx = fixture();
        NvCache::process(&fx.nvc);
        settle(&fx);

        let slot = NvCache::allocate(&fx.nvc, 1).unwrap();
        let addr = Addr::Cached(slot.addr);
        NvCache::set_addr(&fx.nvc, 41, addr);
        assert_eq!(NvCache::map_get_lba(&fx.nvc, addr), Some(41));

        NvCache::invalidate(&fx.nvc, addr);
        assert_eq!(NvCache::map_get_lba(&fx.nvc, addr), Some(FTL_LBA_INVALID));
    }

    #[test]
    fn test_tail_write_failure_rewinds_and_retries() {
        let fx = fixture();
        NvCache::process(&fx.nvc);
        settle(&fx);

        let tail = fx.layout.chunk_tail_md_blocks;
        let data_blocks = fx.layout.chunk_blocks - tail;
        let slot = NvCache::allocate(&fx.nvc, data_blocks).unwrap();

        fx.cache.fail_next(1);
        NvCache::advance_blocks(&fx.nvc, slot.chunk, data_blocks);
        settle(&fx);

        let md = NvCache::chunk_md(&fx.nvc, slot.chunk);
        assert_eq!(md.state, ChunkState::Closed);
        assert_ne!(md.lba_map_checksum, 0);
    }

    #[test]
    fn test_restore_state_rebuilds_lists() {
        let fx = fixture();
        NvCache::process(&fx.nvc);
        settle(&fx);

        let tail = fx.layout.chunk_tail_md_blocks;
        let data_blocks = fx.layout.chunk_blocks - tail;
        let slot = NvCache::allocate(&fx.nvc, data_blocks).unwrap();
        NvCache::advance_blocks(&fx.nvc, slot.chunk, data_blocks);
        settle(&fx);
        let closed_md = NvCache::chunk_md(&fx.nvc, slot.chunk);

        // Forget in-memory state, then restore from the device.
        for chunk in fx.nvc.borrow_mut().chunks.iter_mut() {
            chunk.md = ChunkMd::default();
        }
        let done = Rc::new(RefCell::new(None));
        let d2 = Rc::clone(&done);
        NvCache::restore_state(
            &fx.nvc,
            Box::new(move |st| *d2.borrow_mut() = Some(st)),
        );
        assert!(fx.reactor.run_until(|| done.borrow().is_some()));
        done.borrow_mut().take().unwrap().unwrap();

        let md = NvCache::chunk_md(&fx.nvc, slot.chunk);
        assert_eq!(md.state, ChunkState::Closed);
        assert_eq!(md.lba_map_checksum, closed_md.lba_map_checksum);
        assert!(NvCache::full_chunks(&fx.nvc).contains(&slot.chunk));
    }

    #[test]
    fn test_restore_detects_corrupted_tail_map() {
        let fx = fixture();
        NvCache::process(&fx.nvc);
        settle(&fx);

        let tail = fx.layout.chunk_tail_md_blocks;
        let data_blocks = fx.layout.chunk_blocks - tail;
        let slot = NvCache::allocate(&fx.nvc, data_blocks).unwrap();
        NvCache::advance_blocks(&fx.nvc, slot.chunk, data_blocks);
        settle(&fx);

        // Flip a byte inside the on-disk tail map.
        let chunk_offset = fx.nvc.borrow().chunks[slot.chunk].offset;
        let tail_addr = chunk_offset + fx.layout.chunk_blocks - tail;
        let mut raw = fx.cache.read_raw(tail_addr, 1);
        raw[0] ^= 0xFF;
        fx.cache.write_raw(tail_addr, &raw);

        let done = Rc::new(RefCell::new(None));
        let d2 = Rc::clone(&done);
        NvCache::restore_state(
            &fx.nvc,
            Box::new(move |st| *d2.borrow_mut() = Some(st)),
        );
        assert!(fx.reactor.run_until(|| done.borrow().is_some()));
        assert_eq!(
            done.borrow_mut().take().unwrap(),
            Err(NvCacheError::BadChecksum { chunk: slot.chunk })
        );
    }

    #[test]
    fn test_mark_compacted_frees_chunk() {
        let fx = fixture();
        NvCache::process(&fx.nvc);
        settle(&fx);

        let tail = fx.layout.chunk_tail_md_blocks;
        let data_blocks = fx.layout.chunk_blocks - tail;
        let slot = NvCache::allocate(&fx.nvc, data_blocks).unwrap();
        NvCache::advance_blocks(&fx.nvc, slot.chunk, data_blocks);
        settle(&fx);

        let taken = NvCache::compaction_take(&fx.nvc).unwrap();
        assert_eq!(taken, slot.chunk);
        NvCache::mark_compacted(&fx.nvc, taken, data_blocks);
        settle(&fx);

        let md = NvCache::chunk_md(&fx.nvc, taken);
        assert_eq!(md.state, ChunkState::Free);
        assert_eq!(md.seq_id, 0);
        assert!(fx.nvc.borrow().free_list.contains(&taken));
    }
}
