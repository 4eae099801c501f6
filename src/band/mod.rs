//! # Bands
//!
//! A band is a contiguous group of zones on the base device written
//! strictly sequentially, one zone per parallel unit. The last blocks of
//! a band hold its tail metadata: the physical-to-logical map
//! (`{lba, seq_id}` per block) protected by CRC32C. While a band fills,
//! the same map is checkpointed into one of the rotating P2L regions on
//! the cache device so an interrupted band can be replayed.
//!
//! Band state walks `FREE -> OPEN -> FULL -> CLOSED -> FREE`; the valid
//! map and per-band valid counters track which base-device blocks still
//! carry live data.

pub mod p2l;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use bitvec::vec::BitVec;
use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::core::addr::Addr;
use crate::core::buf::{shared_buf, SharedBuf};
use crate::core::{Geometry, FTL_BLOCK_SIZE};
use crate::device::{submit_retrying, IoCompletion, IoDir};
use crate::layout::{Layout, LayoutRegion, RegionType, BAND_MAP_ENTRY_SIZE, P2L_CKPT_COUNT};
use crate::md::{Md, MdEnv, MdError, MdRef};
use crate::nv_cache::BufPool;

/// Band subsystem errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BandError {
    /// Band metadata I/O failed.
    #[error("band metadata I/O failed: {0}")]
    Md(#[from] MdError),

    /// A band's tail map does not match its recorded checksum.
    #[error("band {band} tail map checksum mismatch")]
    BadChecksum {
        /// Offending band.
        band: usize,
    },

    /// A persisted band state is not one restore understands.
    #[error("band {band} restored with invalid state")]
    BadState {
        /// Offending band.
        band: usize,
    },

    /// The band never wrote its tail map; there is nothing authoritative
    /// to read back.
    #[error("band {band} has no tail map on disk")]
    MissingTail {
        /// Offending band.
        band: usize,
    },

    /// A data or tail transfer failed.
    #[error("band I/O failed")]
    Io,
}

/// Band lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BandState {
    /// Unused.
    #[default]
    Free,
    /// Accepting sequential writes.
    Open,
    /// Data area exhausted, tail not yet written.
    Full,
    /// Tail metadata written and checksummed.
    Closed,
}

impl BandState {
    fn to_wire(self) -> u32 {
        match self {
            BandState::Free => 0,
            BandState::Open => 1,
            BandState::Full => 2,
            BandState::Closed => 3,
        }
    }

    fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(BandState::Free),
            1 => Some(BandState::Open),
            2 => Some(BandState::Full),
            3 => Some(BandState::Closed),
            _ => None,
        }
    }
}

/// Per-band metadata, one block on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandMd {
    /// Band index.
    pub id: u64,
    /// Lifecycle state.
    pub state: BandState,
    /// Sequence id assigned when the band opened.
    pub seq: u64,
    /// Sequence id assigned when the band closed.
    pub close_seq_id: u64,
    /// Next block to write, relative to the band start.
    pub write_pointer: u64,
    /// P2L checkpoint slot assigned while the band is open.
    pub p2l_ckpt: Option<u8>,
    /// CRC32C of the tail map; non-zero only on closed bands.
    pub lba_map_checksum: u32,
}

const MD_OFF_ID: usize = 0;
const MD_OFF_STATE: usize = 8;
const MD_OFF_SEQ: usize = 16;
const MD_OFF_CLOSE_SEQ: usize = 24;
const MD_OFF_WRITE_POINTER: usize = 32;
const MD_OFF_P2L_CKPT: usize = 40;
const MD_OFF_CHECKSUM: usize = 44;

const P2L_CKPT_NONE: u32 = u32::MAX;

impl BandMd {
    /// Encode into the head of a metadata entry block.
    pub fn encode(&self, block: &mut [u8]) {
        block[..FTL_BLOCK_SIZE].fill(0);
        LittleEndian::write_u64(&mut block[MD_OFF_ID..], self.id);
        LittleEndian::write_u32(&mut block[MD_OFF_STATE..], self.state.to_wire());
        LittleEndian::write_u64(&mut block[MD_OFF_SEQ..], self.seq);
        LittleEndian::write_u64(&mut block[MD_OFF_CLOSE_SEQ..], self.close_seq_id);
        LittleEndian::write_u64(&mut block[MD_OFF_WRITE_POINTER..], self.write_pointer);
        LittleEndian::write_u32(
            &mut block[MD_OFF_P2L_CKPT..],
            self.p2l_ckpt.map_or(P2L_CKPT_NONE, u32::from),
        );
        LittleEndian::write_u32(&mut block[MD_OFF_CHECKSUM..], self.lba_map_checksum);
    }

    /// Decode from a metadata entry block.
    pub fn decode(block: &[u8]) -> Result<Self, ()> {
        let state = BandState::from_wire(LittleEndian::read_u32(&block[MD_OFF_STATE..]))
            .ok_or(())?;
        let ckpt = LittleEndian::read_u32(&block[MD_OFF_P2L_CKPT..]);
        Ok(BandMd {
            id: LittleEndian::read_u64(&block[MD_OFF_ID..]),
            state,
            seq: LittleEndian::read_u64(&block[MD_OFF_SEQ..]),
            close_seq_id: LittleEndian::read_u64(&block[MD_OFF_CLOSE_SEQ..]),
            write_pointer: LittleEndian::read_u64(&block[MD_OFF_WRITE_POINTER..]),
            p2l_ckpt: (ckpt != P2L_CKPT_NONE).then(|| ckpt as u8),
            lba_map_checksum: LittleEndian::read_u32(&block[MD_OFF_CHECKSUM..]),
        })
    }
}

/// Result of a band payload write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReport {
    /// Absolute base-device block of the first written payload block.
    pub first_offset: u64,
    /// Sequence id assigned to the batch.
    pub seq_id: u64,
}

/// One entry of a band map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct P2lEntry {
    /// Logical block stored at this band offset.
    pub lba: u64,
    /// Sequence id of the write that stored it.
    pub seq_id: u64,
}

/// Read entry `idx` of a band-map buffer.
pub fn map_entry(buf: &[u8], idx: u64) -> P2lEntry {
    let at = idx as usize * BAND_MAP_ENTRY_SIZE as usize;
    P2lEntry {
        lba: LittleEndian::read_u64(&buf[at..]),
        seq_id: LittleEndian::read_u64(&buf[at + 8..]),
    }
}

/// Write entry `idx` of a band-map buffer.
pub fn map_entry_set(buf: &mut [u8], idx: u64, entry: P2lEntry) {
    let at = idx as usize * BAND_MAP_ENTRY_SIZE as usize;
    LittleEndian::write_u64(&mut buf[at..], entry.lba);
    LittleEndian::write_u64(&mut buf[at + 8..], entry.seq_id);
}

/// Valid-map bits over the base device, one per block.
pub struct ValidMap {
    bits: BitVec,
}

impl ValidMap {
    /// All-clear map over `num_blocks` blocks.
    pub fn new(num_blocks: u64) -> Self {
        ValidMap {
            bits: BitVec::repeat(false, num_blocks as usize),
        }
    }

    /// Set a bit; returns the previous value.
    pub fn set(&mut self, offset: u64) -> bool {
        let prev = self.bits[offset as usize];
        self.bits.set(offset as usize, true);
        prev
    }

    /// Clear a bit; returns the previous value.
    pub fn clear(&mut self, offset: u64) -> bool {
        let prev = self.bits[offset as usize];
        self.bits.set(offset as usize, false);
        prev
    }

    /// Read a bit.
    pub fn get(&self, offset: u64) -> bool {
        self.bits[offset as usize]
    }

    /// Number of set bits in `[start, start + len)`.
    pub fn count_range(&self, start: u64, len: u64) -> u64 {
        self.bits[start as usize..(start + len) as usize].count_ones() as u64
    }

    /// Clear every bit.
    pub fn reset(&mut self) {
        self.bits.fill(false);
    }

    /// Serialize into a byte buffer, one bit per block, LSB first.
    pub fn store_bytes(&self, out: &mut [u8]) {
        debug_assert!(out.len() * 8 >= self.bits.len());
        out.fill(0);
        for idx in self.bits.iter_ones() {
            out[idx / 8] |= 1 << (idx % 8);
        }
    }

    /// Load from the byte form written by [`ValidMap::store_bytes`].
    pub fn load_bytes(&mut self, raw: &[u8]) {
        self.bits.fill(false);
        for idx in 0..self.bits.len() {
            if raw[idx / 8] & (1 << (idx % 8)) != 0 {
                self.bits.set(idx, true);
            }
        }
    }
}

/// Shared handle to the valid map.
pub type ValidMapRef = Rc<RefCell<ValidMap>>;

/// One band.
pub struct Band {
    /// In-memory metadata.
    pub md: BandMd,
    map: Option<SharedBuf>,
    /// Blocks of this band still referenced by the L2P.
    pub num_vld: u64,
}

/// Shared handle to the band set.
pub type BandSetRef = Rc<RefCell<BandSet>>;

/// All bands of the base device.
pub struct BandSet {
    geometry: Geometry,
    tail_blocks: u64,
    usable_blocks: u64,
    bands: Vec<Band>,
    free_list: VecDeque<usize>,
    shut_list: Vec<usize>,
    open_bands: Vec<usize>,
    md: MdRef,
    env: MdEnv,
    seq: Rc<Cell<u64>>,
    valid: ValidMapRef,
    p2l_regions: Vec<LayoutRegion>,
    p2l_in_use: [Option<usize>; P2L_CKPT_COUNT as usize],
    map_pool: BufPool,
    self_weak: Weak<RefCell<BandSet>>,
}

impl BandSet {
    /// Build the band array from the layout.
    pub fn new(
        layout: &Layout,
        md: MdRef,
        env: MdEnv,
        seq: Rc<Cell<u64>>,
        valid: ValidMapRef,
    ) -> BandSetRef {
        let geometry = layout.geometry;
        let tail_blocks = layout.band_tail_md_blocks;
        let bands = (0..geometry.num_bands)
            .map(|id| Band {
                md: BandMd {
                    id,
                    ..BandMd::default()
                },
                map: None,
                num_vld: 0,
            })
            .collect();
        let p2l_regions = (0..P2L_CKPT_COUNT)
            .map(|i| layout.region(RegionType::P2lCkpt(i)).clone())
            .collect();

        let set = Rc::new(RefCell::new(BandSet {
            geometry,
            tail_blocks,
            usable_blocks: geometry.blocks_in_band() - tail_blocks,
            bands,
            free_list: (0..geometry.num_bands as usize).collect(),
            shut_list: Vec::new(),
            open_bands: Vec::new(),
            md,
            env,
            seq,
            valid,
            p2l_regions,
            p2l_in_use: [None; P2L_CKPT_COUNT as usize],
            map_pool: BufPool::new(
                P2L_CKPT_COUNT as usize,
                tail_blocks as usize * FTL_BLOCK_SIZE,
            ),
            self_weak: Weak::new(),
        }));
        set.borrow_mut().self_weak = Rc::downgrade(&set);
        set
    }

    fn next_seq(&self) -> u64 {
        let next = self.seq.get() + 1;
        self.seq.set(next);
        next
    }

    /// First base-device block of a band.
    pub fn band_start(bands: &BandSetRef, idx: usize) -> u64 {
        let this = bands.borrow();
        idx as u64 * this.geometry.blocks_in_band()
    }

    /// Band containing a base-device block.
    pub fn band_of(bands: &BandSetRef, offset: u64) -> usize {
        bands.borrow().geometry.band_of(offset) as usize
    }

    /// Blocks of a band usable for payload (tail metadata excluded).
    pub fn usable_blocks(bands: &BandSetRef) -> u64 {
        bands.borrow().usable_blocks
    }

    /// In-memory metadata snapshot of a band.
    pub fn band_md(bands: &BandSetRef, idx: usize) -> BandMd {
        bands.borrow().bands[idx].md
    }

    /// Per-band valid counter.
    pub fn valid_count(bands: &BandSetRef, idx: usize) -> u64 {
        bands.borrow().bands[idx].num_vld
    }

    /// Bands parked by restore in the open state.
    pub fn open_bands(bands: &BandSetRef) -> Vec<usize> {
        bands.borrow().open_bands.clone()
    }

    /// Number of free bands.
    pub fn free_count(bands: &BandSetRef) -> usize {
        bands.borrow().free_list.len()
    }

    /// Highest open and close sequence ids across all bands.
    pub fn max_seq_ids(bands: &BandSetRef) -> (u64, u64) {
        let this = bands.borrow();
        let open = this.bands.iter().map(|b| b.md.seq).max().unwrap_or(0);
        let close = this
            .bands
            .iter()
            .map(|b| b.md.close_seq_id)
            .max()
            .unwrap_or(0);
        (open, close)
    }

    /// Open the next free band: assign a sequence id and a P2L
    /// checkpoint slot, allocate its map, persist its metadata entry.
    pub fn open_next(bands: &BandSetRef) -> Option<usize> {
        let idx = {
            let mut this = bands.borrow_mut();
            let idx = this.free_list.pop_front()?;
            let slot = this
                .p2l_in_use
                .iter()
                .position(|s| s.is_none())
                .expect("more open bands than P2L checkpoint slots");
            this.p2l_in_use[slot] = Some(idx);
            this.open_bands.push(idx);

            let map = this
                .map_pool
                .get()
                .expect("band map pool sized to the checkpoint slots");
            map.borrow_mut().fill(0xFF);

            let seq = this.next_seq();
            let band = &mut this.bands[idx];
            band.md.state = BandState::Open;
            band.md.seq = seq;
            band.md.close_seq_id = 0;
            band.md.write_pointer = 0;
            band.md.lba_map_checksum = 0;
            band.md.p2l_ckpt = Some(slot as u8);
            band.map = Some(map);
            band.num_vld = 0;
            idx
        };
        persist_band_md(bands, idx);
        Some(idx)
    }

    /// Append payload blocks to an open band. The completion reports the
    /// first written offset and the batch sequence id; the caller
    /// records the mappings through the update path, which keeps the
    /// reverse map, the valid bits, and the L2P in the required order.
    pub fn write_blocks(
        bands: &BandSetRef,
        idx: usize,
        buf: &SharedBuf,
        buf_offset: usize,
        num_blocks: u64,
        cb: Box<dyn FnOnce(Result<WriteReport, BandError>)>,
    ) {
        let (env, dev_offset, seq_id) = {
            let this = bands.borrow();
            let start = idx as u64 * this.geometry.blocks_in_band();
            let band = &this.bands[idx];
            debug_assert_eq!(band.md.state, BandState::Open);
            debug_assert!(band.md.write_pointer + num_blocks <= this.usable_blocks);
            let dev_offset = start + band.md.write_pointer;
            let seq_id = this.next_seq();
            (this.env.clone(), dev_offset, seq_id)
        };

        let weak = bands.borrow().self_weak.clone();
        let io_cb: IoCompletion = Box::new(move |status| {
            let Some(bands) = weak.upgrade() else { return };
            if !status.is_ok() {
                cb(Err(BandError::Io));
                return;
            }
            {
                let mut this = bands.borrow_mut();
                let usable = this.usable_blocks;
                let band = &mut this.bands[idx];
                band.md.write_pointer += num_blocks;
                if band.md.write_pointer == usable {
                    band.md.state = BandState::Full;
                }
            }
            cb(Ok(WriteReport {
                first_offset: dev_offset,
                seq_id,
            }));
        });

        submit_retrying(
            &env.base_bdev,
            &env.base_ch,
            IoDir::Write,
            buf,
            buf_offset,
            None,
            0,
            dev_offset,
            num_blocks,
            io_cb,
        );
    }

    fn set_addr_locked(&mut self, idx: usize, lba: u64, abs_offset: u64, seq_id: u64) {
        let start = idx as u64 * self.geometry.blocks_in_band();
        let band = &mut self.bands[idx];
        let map = band.map.as_ref().expect("band map resident while open");
        map_entry_set(
            map.borrow_mut().as_mut_slice(),
            abs_offset - start,
            P2lEntry { lba, seq_id },
        );
        band.num_vld += 1;
        let prev = self.valid.borrow_mut().set(abs_offset);
        debug_assert!(!prev, "block marked valid twice");
    }

    /// Record a single mapping on an open band (compaction's per-block
    /// path).
    pub fn set_addr(bands: &BandSetRef, lba: u64, addr: Addr, seq_id: u64) {
        let abs = addr.flash_offset();
        let idx = BandSet::band_of(bands, abs);
        bands.borrow_mut().set_addr_locked(idx, lba, abs, seq_id);
    }

    /// Drop the valid bit of a base-device block and its band's counter.
    pub fn invalidate(bands: &BandSetRef, addr: Addr) {
        let abs = addr.flash_offset();
        let idx = BandSet::band_of(bands, abs);
        let mut this = bands.borrow_mut();
        let was_valid = this.valid.borrow_mut().clear(abs);
        if was_valid {
            let band = &mut this.bands[idx];
            debug_assert!(band.num_vld > 0);
            band.num_vld -= 1;
        }
    }

    /// Close a full band: write its tail map, record the CRC, persist
    /// the metadata entry, release its checkpoint slot.
    pub fn close(bands: &BandSetRef, idx: usize, cb: Box<dyn FnOnce(Result<(), BandError>)>) {
        let (env, map, tail_addr, tail_blocks) = {
            let mut this = bands.borrow_mut();
            let start = idx as u64 * this.geometry.blocks_in_band();
            let tail_addr = start + this.usable_blocks;
            let band = &mut this.bands[idx];
            debug_assert!(matches!(band.md.state, BandState::Open | BandState::Full));
            let map = band.map.clone().expect("closing band without a map");
            (this.env.clone(), map, tail_addr, this.tail_blocks)
        };

        let weak = bands.borrow().self_weak.clone();
        let map2 = map.clone();
        let io_cb: IoCompletion = Box::new(move |status| {
            let Some(bands) = weak.upgrade() else { return };
            if !status.is_ok() {
                cb(Err(BandError::Io));
                return;
            }
            let crc = crc32c::crc32c(map2.borrow().as_slice());
            {
                let mut this = bands.borrow_mut();
                let close_seq = this.next_seq();
                let band = &mut this.bands[idx];
                band.md.state = BandState::Closed;
                band.md.close_seq_id = close_seq;
                band.md.lba_map_checksum = crc;
                if let Some(slot) = band.md.p2l_ckpt.take() {
                    this.p2l_in_use[slot as usize] = None;
                }
                let map = this.bands[idx].map.take();
                if let Some(map) = map {
                    this.map_pool.put(map);
                }
                this.open_bands.retain(|&i| i != idx);
                this.shut_list.push(idx);
            }
            persist_band_md_with(&bands, idx, cb);
        });

        submit_retrying(
            &env.base_bdev,
            &env.base_ch,
            IoDir::Write,
            &map,
            0,
            None,
            0,
            tail_addr,
            tail_blocks,
            io_cb,
        );
    }

    /// Read a band's tail map back from the base device.
    pub fn read_tail(
        bands: &BandSetRef,
        idx: usize,
        cb: Box<dyn FnOnce(Result<SharedBuf, BandError>)>,
    ) {
        let (env, tail_addr, tail_blocks) = {
            let this = bands.borrow();
            let start = idx as u64 * this.geometry.blocks_in_band();
            (this.env.clone(), start + this.usable_blocks, this.tail_blocks)
        };
        let buf = shared_buf(tail_blocks as usize * FTL_BLOCK_SIZE);
        let buf2 = buf.clone();
        let io_cb: IoCompletion = Box::new(move |status| {
            if status.is_ok() {
                cb(Ok(buf2));
            } else {
                cb(Err(BandError::Io));
            }
        });
        submit_retrying(
            &env.base_bdev,
            &env.base_ch,
            IoDir::Read,
            &buf,
            0,
            None,
            0,
            tail_addr,
            tail_blocks,
            io_cb,
        );
    }

    /// Verified tail map of a closed band; a checksum mismatch is fatal
    /// to the mount. Only closed bands have written their tail, so any
    /// other state is refused rather than read back as garbage.
    pub fn read_tail_checked(
        bands: &BandSetRef,
        idx: usize,
        cb: Box<dyn FnOnce(Result<SharedBuf, BandError>)>,
    ) {
        let expected = bands.borrow().bands[idx].md.lba_map_checksum;
        let state = bands.borrow().bands[idx].md.state;
        if state != BandState::Closed {
            cb(Err(BandError::MissingTail { band: idx }));
            return;
        }
        BandSet::read_tail(
            bands,
            idx,
            Box::new(move |result| match result {
                Ok(map) => {
                    let actual = crc32c::crc32c(map.borrow().as_slice());
                    if expected != 0 && actual != expected {
                        cb(Err(BandError::BadChecksum { band: idx }));
                    } else {
                        cb(Ok(map))
                    }
                }
                Err(e) => cb(Err(e)),
            }),
        );
    }

    /// Resident map of an open band, when present.
    pub fn resident_map(bands: &BandSetRef, idx: usize) -> Option<SharedBuf> {
        bands.borrow().bands[idx].map.clone()
    }

    /// Restore band state from the metadata region and run the
    /// first restore pass: FREE bands are recycled through CLOSED back to
    /// FREE, OPEN bands are parked for P2L replay, CLOSED bands keep
    /// their place.
    pub fn restore_state(bands: &BandSetRef, cb: Box<dyn FnOnce(Result<(), BandError>)>) {
        let (md, env) = {
            let this = bands.borrow();
            (Rc::clone(&this.md), this.env.clone())
        };
        let weak = bands.borrow().self_weak.clone();
        Md::restore(
            &md,
            &env,
            Box::new(move |status| {
                let Some(bands) = weak.upgrade() else { return };
                match status {
                    Ok(()) => cb(decode_band_states(&bands)),
                    Err(e) => cb(Err(BandError::Md(e))),
                }
            }),
        );
    }

    /// Persist the whole band metadata region (clean shutdown path).
    pub fn persist_all(bands: &BandSetRef, cb: Box<dyn FnOnce(Result<(), BandError>)>) {
        let (md, env) = {
            let this = bands.borrow();
            encode_all_bands(&this);
            (Rc::clone(&this.md), this.env.clone())
        };
        Md::persist(
            &md,
            &env,
            Box::new(move |st| cb(st.map_err(BandError::Md))),
        );
    }

    /// Recovery-path increment of a band's valid counter; the valid-map
    /// bit is set by the caller.
    pub(crate) fn bump_valid(&mut self, idx: usize) {
        self.bands[idx].num_vld += 1;
    }

    /// Recount per-band valid counters from the valid map (fast
    /// recovery).
    pub fn reload_valid_counters(bands: &BandSetRef) {
        let mut this = bands.borrow_mut();
        let blocks_in_band = this.geometry.blocks_in_band();
        let valid = Rc::clone(&this.valid);
        let valid = valid.borrow();
        for idx in 0..this.bands.len() {
            let start = idx as u64 * blocks_in_band;
            this.bands[idx].num_vld = valid.count_range(start, blocks_in_band);
        }
    }
}

fn encode_all_bands(this: &BandSet) {
    let buf = Md::buffer(&this.md).expect("band metadata object without buffer");
    let mut guard = buf.borrow_mut();
    let raw = guard.as_mut_slice();
    for (idx, band) in this.bands.iter().enumerate() {
        let mut md = band.md;
        if md.state == BandState::Full {
            // FULL is a transient in-memory state between the last data
            // write and the tail write; on disk the band is still open.
            md.state = BandState::Open;
        }
        md.encode(&mut raw[idx * FTL_BLOCK_SIZE..(idx + 1) * FTL_BLOCK_SIZE]);
    }
}

fn decode_band_states(bands: &BandSetRef) -> Result<(), BandError> {
    let mut this = bands.borrow_mut();
    let buf = Md::buffer(&this.md).expect("band metadata object without buffer");
    let guard = buf.borrow();
    let raw = guard.as_slice();

    this.free_list.clear();
    this.shut_list.clear();
    this.open_bands.clear();
    this.p2l_in_use = [None; P2L_CKPT_COUNT as usize];

    for idx in 0..this.bands.len() {
        let entry = &raw[idx * FTL_BLOCK_SIZE..(idx + 1) * FTL_BLOCK_SIZE];
        let md = BandMd::decode(entry).map_err(|_| BandError::BadState { band: idx })?;
        let md = BandMd {
            id: idx as u64,
            ..md
        };
        match md.state {
            BandState::Free => {
                // Recycle through the closed state so a half-formatted
                // band still ends up on the free list with clean
                // metadata.
                this.bands[idx].md = BandMd {
                    id: idx as u64,
                    state: BandState::Free,
                    ..BandMd::default()
                };
                this.free_list.push_back(idx);
            }
            BandState::Open => {
                this.bands[idx].md = md;
                if let Some(slot) = md.p2l_ckpt {
                    this.p2l_in_use[slot as usize] = Some(idx);
                }
                this.open_bands.push(idx);
            }
            BandState::Closed => {
                this.bands[idx].md = md;
                this.shut_list.push(idx);
            }
            BandState::Full => {
                return Err(BandError::BadState { band: idx });
            }
        }
    }
    Ok(())
}

fn persist_band_md(bands: &BandSetRef, idx: usize) {
    persist_band_md_with(
        bands,
        idx,
        Box::new(move |status| {
            if let Err(e) = status {
                log::error!("band {} metadata persist failed: {}", idx, e);
            }
        }),
    );
}

fn persist_band_md_with(
    bands: &BandSetRef,
    idx: usize,
    cb: Box<dyn FnOnce(Result<(), BandError>)>,
) {
    let (md, env, dma, entry_vss) = {
        let this = bands.borrow();
        let dma = shared_buf(FTL_BLOCK_SIZE);
        this.bands[idx].md.encode(dma.borrow_mut().as_mut_slice());
        let region = Md::region(&this.md).expect("band metadata object without region");
        let entry_vss = Md::vss_buf_alloc(&region, 1);
        (Rc::clone(&this.md), this.env.clone(), dma, entry_vss)
    };
    let cb = RefCell::new(Some(cb));
    let _ctx = Md::persist_entry(
        &md,
        &env,
        idx as u64,
        dma,
        Some(entry_vss),
        Rc::new(move |status| {
            if let Some(cb) = cb.borrow_mut().take() {
                cb(status.map_err(BandError::Md));
            }
        }),
    );
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::config::FtlConfig;
    use crate::device::mem::MemBdev;
    use crate::device::Bdev;
    use crate::md::MdCreateFlags;
    use crate::reactor::{Reactor, ReactorRef};
    use uuid::Uuid;

    /// Band-set harness shared by the band and checkpoint tests.
    pub(crate) struct BandFixture {
        pub reactor: ReactorRef,
        pub base: Rc<MemBdev>,
        pub layout: Layout,
        pub bands: BandSetRef,
        pub valid: ValidMapRef,
    }

    pub(crate) fn band_fixture() -> BandFixture {
        let reactor = Reactor::new();
        let base = MemBdev::new(Rc::clone(&reactor), 8192, 0, 256, 2);
        let cache = MemBdev::new(Rc::clone(&reactor), 4096, 64, 0, 0);
        let config = FtlConfig::default();
        let layout = Layout::setup(&config, &*base, &*cache, None).unwrap();

        let env = MdEnv {
            reactor: Rc::clone(&reactor),
            cache_ch: cache.open_channel(),
            base_ch: base.open_channel(),
            cache_bdev: cache,
            base_bdev: Rc::clone(&base) as Rc<dyn Bdev>,
            xfer_blocks: 4 * config.xfer_size,
            sb_clean: Rc::new(Cell::new(true)),
        };

        let region = layout.region(RegionType::BandMd).clone();
        let mirror = layout.region(RegionType::BandMdMirror).clone();
        let md = Md::create(
            &Uuid::new_v4(),
            region.length_blocks,
            64,
            "band_md",
            MdCreateFlags::heap(),
            None,
        )
        .unwrap();
        Md::set_region(&md, &region, Some(&mirror)).unwrap();

        let valid = Rc::new(RefCell::new(ValidMap::new(layout.base_total_blocks)));
        let bands = BandSet::new(&layout, md, env, Rc::new(Cell::new(0)), Rc::clone(&valid));
        BandFixture {
            reactor,
            base,
            layout,
            bands,
            valid,
        }
    }

    impl BandFixture {
        pub(crate) fn settle(&self) {
            for _ in 0..64 {
                self.reactor.tick();
            }
        }

        pub(crate) fn write_band(&self, idx: usize, lbas: &[u64], fill: u8) {
            let buf = shared_buf(lbas.len() * FTL_BLOCK_SIZE);
            buf.borrow_mut().fill(fill);
            let result = Rc::new(RefCell::new(None));
            let r2 = Rc::clone(&result);
            BandSet::write_blocks(
                &self.bands,
                idx,
                &buf,
                0,
                lbas.len() as u64,
                Box::new(move |st| *r2.borrow_mut() = Some(st)),
            );
            assert!(self.reactor.run_until(|| result.borrow().is_some()));
            let report = result.borrow_mut().take().unwrap().unwrap();

            for (i, &lba) in lbas.iter().enumerate() {
                BandSet::set_addr(
                    &self.bands,
                    lba,
                    Addr::Flash(report.first_offset + i as u64),
                    report.seq_id,
                );
            }

            let done = Rc::new(Cell::new(false));
            let d2 = Rc::clone(&done);
            p2l::ckpt_persist(
                &self.bands,
                idx,
                Box::new(move |st| {
                    st.unwrap();
                    d2.set(true);
                }),
            );
            assert!(self.reactor.run_until(|| done.get()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::{band_fixture, BandFixture};
    use super::*;
    use crate::core::FTL_LBA_INVALID;

    type Fixture = BandFixture;

    fn fixture() -> Fixture {
        band_fixture()
    }

    fn settle(fx: &Fixture) {
        fx.settle();
    }

    fn write_band(fx: &Fixture, idx: usize, lbas: &[u64], fill: u8) {
        fx.write_band(idx, lbas, fill);
    }

    #[test]
    fn test_open_write_close_cycle() {
        let fx = fixture();
        let idx = BandSet::open_next(&fx.bands).unwrap();
        settle(&fx);

        let md = BandSet::band_md(&fx.bands, idx);
        assert_eq!(md.state, BandState::Open);
        assert!(md.seq > 0);
        assert!(md.p2l_ckpt.is_some());

        write_band(&fx, idx, &[10, 11, 12], 0x3C);
        let md = BandSet::band_md(&fx.bands, idx);
        assert_eq!(md.write_pointer, 3);
        assert_eq!(BandSet::valid_count(&fx.bands, idx), 3);
        let start = BandSet::band_start(&fx.bands, idx);
        assert!(fx.valid.borrow().get(start));

        let done = Rc::new(Cell::new(false));
        let d2 = Rc::clone(&done);
        BandSet::close(
            &fx.bands,
            idx,
            Box::new(move |st| {
                st.unwrap();
                d2.set(true);
            }),
        );
        assert!(fx.reactor.run_until(|| done.get()));

        let md = BandSet::band_md(&fx.bands, idx);
        assert_eq!(md.state, BandState::Closed);
        assert_ne!(md.lba_map_checksum, 0);
        assert!(md.close_seq_id > md.seq);
        assert_eq!(md.p2l_ckpt, None);
    }

    #[test]
    fn test_tail_round_trip_and_checksum() {
        let fx = fixture();
        let idx = BandSet::open_next(&fx.bands).unwrap();
        settle(&fx);
        write_band(&fx, idx, &[7, 8], 0x11);

        let done = Rc::new(Cell::new(false));
        let d2 = Rc::clone(&done);
        BandSet::close(&fx.bands, idx, Box::new(move |st| {
            st.unwrap();
            d2.set(true);
        }));
        assert!(fx.reactor.run_until(|| done.get()));

        let result = Rc::new(RefCell::new(None));
        let r2 = Rc::clone(&result);
        BandSet::read_tail_checked(
            &fx.bands,
            idx,
            Box::new(move |res| *r2.borrow_mut() = Some(res)),
        );
        assert!(fx.reactor.run_until(|| result.borrow().is_some()));
        let map = result.borrow_mut().take().unwrap().unwrap();
        let guard = map.borrow();
        let entry = map_entry(guard.as_slice(), 0);
        assert_eq!(entry.lba, 7);
        assert!(entry.seq_id > 0);
        let entry = map_entry(guard.as_slice(), 2);
        assert_eq!(entry.lba, FTL_LBA_INVALID);
    }

    #[test]
    fn test_corrupt_tail_detected() {
        let fx = fixture();
        let idx = BandSet::open_next(&fx.bands).unwrap();
        settle(&fx);
        write_band(&fx, idx, &[1], 0x22);

        let done = Rc::new(Cell::new(false));
        let d2 = Rc::clone(&done);
        BandSet::close(&fx.bands, idx, Box::new(move |st| {
            st.unwrap();
            d2.set(true);
        }));
        assert!(fx.reactor.run_until(|| done.get()));

        let tail_addr = BandSet::band_start(&fx.bands, idx) + BandSet::usable_blocks(&fx.bands);
        let mut raw = fx.base.read_raw(tail_addr, 1);
        raw[0] ^= 0x01;
        fx.base.write_raw(tail_addr, &raw);

        let result = Rc::new(RefCell::new(None));
        let r2 = Rc::clone(&result);
        BandSet::read_tail_checked(
            &fx.bands,
            idx,
            Box::new(move |res| *r2.borrow_mut() = Some(res)),
        );
        assert!(fx.reactor.run_until(|| result.borrow().is_some()));
        assert!(matches!(
            result.borrow_mut().take().unwrap(),
            Err(BandError::BadChecksum { .. })
        ));
    }

    #[test]
    fn test_invalidate_clears_valid_state() {
        let fx = fixture();
        let idx = BandSet::open_next(&fx.bands).unwrap();
        settle(&fx);
        write_band(&fx, idx, &[5], 0x44);

        let start = BandSet::band_start(&fx.bands, idx);
        BandSet::invalidate(&fx.bands, Addr::Flash(start));
        assert_eq!(BandSet::valid_count(&fx.bands, idx), 0);
        assert!(!fx.valid.borrow().get(start));

        // A second invalidate of the same block is a no-op.
        BandSet::invalidate(&fx.bands, Addr::Flash(start));
        assert_eq!(BandSet::valid_count(&fx.bands, idx), 0);
    }

    #[test]
    fn test_restore_recycles_and_parks_bands() {
        let fx = fixture();

        // Band 0 closed, band 1 open, the rest free.
        let b0 = BandSet::open_next(&fx.bands).unwrap();
        settle(&fx);
        write_band(&fx, b0, &[1, 2], 0x10);
        let done = Rc::new(Cell::new(false));
        let d2 = Rc::clone(&done);
        BandSet::close(&fx.bands, b0, Box::new(move |st| {
            st.unwrap();
            d2.set(true);
        }));
        assert!(fx.reactor.run_until(|| done.get()));

        let b1 = BandSet::open_next(&fx.bands).unwrap();
        settle(&fx);
        write_band(&fx, b1, &[3], 0x20);

        // Persist everything, then restore into a fresh band set.
        let done = Rc::new(Cell::new(false));
        let d2 = Rc::clone(&done);
        BandSet::persist_all(&fx.bands, Box::new(move |st| {
            st.unwrap();
            d2.set(true);
        }));
        assert!(fx.reactor.run_until(|| done.get()));

        let done = Rc::new(RefCell::new(None));
        let d2 = Rc::clone(&done);
        BandSet::restore_state(&fx.bands, Box::new(move |st| *d2.borrow_mut() = Some(st)));
        assert!(fx.reactor.run_until(|| done.borrow().is_some()));
        done.borrow_mut().take().unwrap().unwrap();

        assert_eq!(BandSet::band_md(&fx.bands, b0).state, BandState::Closed);
        assert!(BandSet::open_bands(&fx.bands).contains(&b1));
        assert_eq!(
            BandSet::free_count(&fx.bands),
            fx.layout.geometry.num_bands as usize - 2
        );
    }
}
