//! # P2L Checkpoints
//!
//! While a band fills, its map is checkpointed into the rotating slot the
//! band was assigned at open. A checkpoint is one header block (band
//! identity, band sequence id, write pointer, map CRC32C) followed by the
//! full map. Restore matches open bands to slots by sequence id and
//! replays the newest checkpoint; a band without a matching checkpoint
//! restarts from a zero write pointer.

use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};

use crate::band::{BandError, BandSet, BandSetRef, BandState};
use crate::core::buf::shared_buf;
use crate::core::FTL_BLOCK_SIZE;
use crate::device::{submit_retrying, IoCompletion, IoDir};
use crate::layout::P2L_CKPT_COUNT;

const CKPT_MAGIC: u32 = 0x5032_4C43; // "P2LC"

const HDR_OFF_MAGIC: usize = 0;
const HDR_OFF_BAND_ID: usize = 8;
const HDR_OFF_SEQ_ID: usize = 16;
const HDR_OFF_WRITE_POINTER: usize = 24;
const HDR_OFF_MAP_CRC: usize = 32;

/// Decoded checkpoint header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CkptHeader {
    /// Band the checkpoint belongs to.
    pub band_id: u64,
    /// Band sequence id at checkpoint time.
    pub seq_id: u64,
    /// Band write pointer at checkpoint time.
    pub write_pointer: u64,
    /// CRC32C of the map payload.
    pub map_crc: u32,
}

fn encode_header(block: &mut [u8], hdr: &CkptHeader) {
    block[..FTL_BLOCK_SIZE].fill(0);
    LittleEndian::write_u32(&mut block[HDR_OFF_MAGIC..], CKPT_MAGIC);
    LittleEndian::write_u64(&mut block[HDR_OFF_BAND_ID..], hdr.band_id);
    LittleEndian::write_u64(&mut block[HDR_OFF_SEQ_ID..], hdr.seq_id);
    LittleEndian::write_u64(&mut block[HDR_OFF_WRITE_POINTER..], hdr.write_pointer);
    LittleEndian::write_u32(&mut block[HDR_OFF_MAP_CRC..], hdr.map_crc);
}

fn decode_header(block: &[u8]) -> Option<CkptHeader> {
    if LittleEndian::read_u32(&block[HDR_OFF_MAGIC..]) != CKPT_MAGIC {
        return None;
    }
    Some(CkptHeader {
        band_id: LittleEndian::read_u64(&block[HDR_OFF_BAND_ID..]),
        seq_id: LittleEndian::read_u64(&block[HDR_OFF_SEQ_ID..]),
        write_pointer: LittleEndian::read_u64(&block[HDR_OFF_WRITE_POINTER..]),
        map_crc: LittleEndian::read_u32(&block[HDR_OFF_MAP_CRC..]),
    })
}

/// Write the current checkpoint of an open band into its slot.
pub fn ckpt_persist(bands: &BandSetRef, idx: usize, cb: Box<dyn FnOnce(Result<(), BandError>)>) {
    let (env, region, map, hdr) = {
        let this = bands.borrow();
        let band = &this.bands[idx];
        debug_assert!(matches!(band.md.state, BandState::Open | BandState::Full));
        let slot = band.md.p2l_ckpt.expect("open band without a checkpoint slot") as usize;
        let map = band.map.clone().expect("open band without a resident map");
        let hdr = CkptHeader {
            band_id: idx as u64,
            seq_id: band.md.seq,
            write_pointer: band.md.write_pointer,
            map_crc: crc32c::crc32c(map.borrow().as_slice()),
        };
        (this.env.clone(), this.p2l_regions[slot].clone(), map, hdr)
    };

    // Header and map travel as one buffer so a torn checkpoint fails the
    // CRC instead of pairing a new header with an old map.
    let total_blocks = 1 + map.borrow().len() / FTL_BLOCK_SIZE;
    let staging = shared_buf(total_blocks * FTL_BLOCK_SIZE);
    {
        let mut guard = staging.borrow_mut();
        encode_header(&mut guard.as_mut_slice()[..FTL_BLOCK_SIZE], &hdr);
        guard.as_mut_slice()[FTL_BLOCK_SIZE..].copy_from_slice(map.borrow().as_slice());
    }

    let io_cb: IoCompletion = Box::new(move |status| {
        if status.is_ok() {
            cb(Ok(()));
        } else {
            log::error!("P2L checkpoint write failed for band {}", idx);
            cb(Err(BandError::Io));
        }
    });
    submit_retrying(
        &env.cache_bdev,
        &env.cache_ch,
        IoDir::Write,
        &staging,
        0,
        None,
        0,
        region.offset_blocks,
        total_blocks as u64,
        io_cb,
    );
}

/// Read the header of one checkpoint slot. Slots never written decode to
/// `None`.
pub fn ckpt_header(
    bands: &BandSetRef,
    slot: u8,
    cb: Box<dyn FnOnce(Result<Option<CkptHeader>, BandError>)>,
) {
    debug_assert!(slot < P2L_CKPT_COUNT);
    let (env, region) = {
        let this = bands.borrow();
        (this.env.clone(), this.p2l_regions[slot as usize].clone())
    };
    let buf = shared_buf(FTL_BLOCK_SIZE);
    let buf2 = buf.clone();
    let io_cb: IoCompletion = Box::new(move |status| {
        if status.is_ok() {
            cb(Ok(decode_header(buf2.borrow().as_slice())));
        } else {
            cb(Err(BandError::Io));
        }
    });
    submit_retrying(
        &env.cache_bdev,
        &env.cache_ch,
        IoDir::Read,
        &buf,
        0,
        None,
        0,
        region.offset_blocks,
        1,
        io_cb,
    );
}

/// Replay a checkpoint into an open band: reload its map and write
/// pointer. The checkpoint must carry the band's sequence id; a CRC
/// mismatch is fatal to recovery.
pub fn ckpt_restore(
    bands: &BandSetRef,
    idx: usize,
    slot: u8,
    cb: Box<dyn FnOnce(Result<(), BandError>)>,
) {
    let (env, region, map_blocks) = {
        let this = bands.borrow();
        (
            this.env.clone(),
            this.p2l_regions[slot as usize].clone(),
            this.tail_blocks,
        )
    };
    let total_blocks = 1 + map_blocks;
    let buf = shared_buf(total_blocks as usize * FTL_BLOCK_SIZE);
    let buf2 = buf.clone();
    let bands2 = Rc::clone(bands);
    let io_cb: IoCompletion = Box::new(move |status| {
        if !status.is_ok() {
            cb(Err(BandError::Io));
            return;
        }
        let guard = buf2.borrow();
        let raw = guard.as_slice();
        let Some(hdr) = decode_header(&raw[..FTL_BLOCK_SIZE]) else {
            cb(Err(BandError::BadChecksum { band: idx }));
            return;
        };
        let map_bytes = &raw[FTL_BLOCK_SIZE..];
        if hdr.band_id != idx as u64 || crc32c::crc32c(map_bytes) != hdr.map_crc {
            cb(Err(BandError::BadChecksum { band: idx }));
            return;
        }
        {
            let mut this = bands2.borrow_mut();
            let map = match this.bands[idx].map.clone() {
                Some(map) => map,
                None => {
                    let map = this
                        .map_pool
                        .get()
                        .unwrap_or_else(|| shared_buf(map_bytes.len()));
                    this.bands[idx].map = Some(map.clone());
                    map
                }
            };
            map.borrow_mut().as_mut_slice().copy_from_slice(map_bytes);
            this.bands[idx].md.write_pointer = hdr.write_pointer;
            // The band stays open even when the checkpoint covers the
            // whole data area: a full checkpoint says nothing about the
            // tail write, and only a completed tail write closes a band.
            // Replay consumes the resident map; recovery finishes the
            // close afterwards.
        }
        cb(Ok(()));
    });

    submit_retrying(
        &env.cache_bdev,
        &env.cache_ch,
        IoDir::Read,
        &buf,
        0,
        None,
        0,
        region.offset_blocks,
        total_blocks,
        io_cb,
    );
}

impl BandSet {
    /// Give an open band a fresh map buffer (recovery path for bands
    /// whose checkpoint slot held nothing usable).
    pub fn alloc_empty_map(bands: &BandSetRef, idx: usize) {
        let mut this = bands.borrow_mut();
        let tail_bytes = this.tail_blocks as usize * FTL_BLOCK_SIZE;
        let map = this
            .map_pool
            .get()
            .unwrap_or_else(|| shared_buf(tail_bytes));
        map.borrow_mut().fill(0xFF);
        this.bands[idx].map = Some(map);
        this.bands[idx].md.write_pointer = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::band::tests_support::band_fixture;
    use crate::core::FTL_LBA_INVALID;
    use std::cell::RefCell;

    #[test]
    fn test_ckpt_persist_and_header() {
        let fx = band_fixture();
        let idx = BandSet::open_next(&fx.bands).unwrap();
        fx.settle();
        fx.write_band(idx, &[100, 101], 0xAA);

        let slot = BandSet::band_md(&fx.bands, idx).p2l_ckpt.unwrap();
        let result = Rc::new(RefCell::new(None));
        let r2 = Rc::clone(&result);
        ckpt_header(&fx.bands, slot, Box::new(move |res| *r2.borrow_mut() = Some(res)));
        assert!(fx.reactor.run_until(|| result.borrow().is_some()));
        let hdr = result.borrow_mut().take().unwrap().unwrap().unwrap();
        assert_eq!(hdr.band_id, idx as u64);
        assert_eq!(hdr.seq_id, BandSet::band_md(&fx.bands, idx).seq);
        assert_eq!(hdr.write_pointer, 2);
    }

    #[test]
    fn test_unwritten_slot_reads_as_none() {
        let fx = band_fixture();
        let result = Rc::new(RefCell::new(None));
        let r2 = Rc::clone(&result);
        ckpt_header(&fx.bands, 3, Box::new(move |res| *r2.borrow_mut() = Some(res)));
        assert!(fx.reactor.run_until(|| result.borrow().is_some()));
        assert_eq!(result.borrow_mut().take().unwrap().unwrap(), None);
    }

    #[test]
    fn test_ckpt_restore_replays_map() {
        let fx = band_fixture();
        let idx = BandSet::open_next(&fx.bands).unwrap();
        fx.settle();
        fx.write_band(idx, &[5, 6, 7], 0xBB);
        let slot = BandSet::band_md(&fx.bands, idx).p2l_ckpt.unwrap();

        // Wipe the in-memory map, then replay from the checkpoint.
        BandSet::alloc_empty_map(&fx.bands, idx);
        let done = Rc::new(RefCell::new(None));
        let d2 = Rc::clone(&done);
        ckpt_restore(&fx.bands, idx, slot, Box::new(move |st| *d2.borrow_mut() = Some(st)));
        assert!(fx.reactor.run_until(|| done.borrow().is_some()));
        done.borrow_mut().take().unwrap().unwrap();

        assert_eq!(BandSet::band_md(&fx.bands, idx).write_pointer, 3);
        let map = BandSet::resident_map(&fx.bands, idx).unwrap();
        let guard = map.borrow();
        assert_eq!(crate::band::map_entry(guard.as_slice(), 0).lba, 5);
        assert_eq!(crate::band::map_entry(guard.as_slice(), 2).lba, 7);
        assert_eq!(
            crate::band::map_entry(guard.as_slice(), 3).lba,
            FTL_LBA_INVALID
        );
    }
}
