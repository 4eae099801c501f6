//! # Flat L2P Backend
//!
//! The whole table lives in one contiguous buffer: the metadata object of
//! the L2P region, or a mapped pmem file when the `pmem` feature is on
//! and a path is configured. Everything is always resident, so pin and
//! unpin only validate bounds, and `clear`/`persist` go through the
//! metadata object (or reduce to mapping flushes on pmem).

use crate::core::addr::{Addr, AddrCodec};
use crate::core::buf::SharedBuf;
use crate::l2p::{L2p, L2pCb, L2pError, PinCtx, PinOutcome};
use crate::md::{Md, MdEnv, MdRef};

/// Always-resident backend.
pub struct L2pFlat {
    buf: SharedBuf,
    codec: AddrCodec,
    num_lbas: u64,
    md: MdRef,
    env: MdEnv,
    pmem: bool,
    halted: bool,
}

impl L2pFlat {
    /// Back the table with the L2P region's metadata object.
    pub fn new(md: MdRef, env: MdEnv, codec: AddrCodec, num_lbas: u64) -> Self {
        let buf = Md::buffer(&md).expect("L2P metadata object without buffer");
        debug_assert!(Md::data_len(&md) as u64 >= num_lbas * codec.entry_size() as u64);
        L2pFlat {
            buf,
            codec,
            num_lbas,
            md,
            env,
            pmem: false,
            halted: false,
        }
    }

    /// Back the table with a mapped pmem file. Every `set` flushes the
    /// touched entry.
    #[cfg(feature = "pmem")]
    pub fn new_pmem(
        path: &std::path::Path,
        md: MdRef,
        env: MdEnv,
        codec: AddrCodec,
        num_lbas: u64,
    ) -> std::io::Result<Self> {
        use crate::core::buf::DmaBuffer;

        let len = num_lbas as usize * codec.entry_size();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        if file.metadata()?.len() < len as u64 {
            file.set_len(len as u64)?;
        }
        let map = unsafe { memmap2::MmapMut::map_mut(&file)? };
        Ok(L2pFlat {
            buf: std::rc::Rc::new(std::cell::RefCell::new(DmaBuffer::from_mapping(map))),
            codec,
            num_lbas,
            md,
            env,
            pmem: true,
            halted: false,
        })
    }
}

impl L2p for L2pFlat {
    fn get(&self, lba: u64) -> Addr {
        debug_assert!(lba < self.num_lbas);
        self.codec.load(self.buf.borrow().as_slice(), lba)
    }

    fn set(&mut self, lba: u64, addr: Addr) {
        debug_assert!(lba < self.num_lbas);
        self.codec
            .store(self.buf.borrow_mut().as_mut_slice(), lba, addr);
        if self.pmem {
            let entry = self.codec.entry_size();
            if let Err(e) = self
                .buf
                .borrow()
                .flush_range(lba as usize * entry, entry)
            {
                log::error!("pmem flush of L2P entry {} failed: {}", lba, e);
            }
        }
    }

    fn pin(&mut self, pin_ctx: PinCtx) -> PinOutcome {
        if pin_ctx.lba + pin_ctx.count > self.num_lbas {
            let lba = pin_ctx.lba;
            self.env
                .reactor
                .send_msg(Box::new(move || pin_ctx.complete(Err(L2pError::OutOfRange(lba)))));
            return PinOutcome::Accepted;
        }
        // Always resident; complete from the reactor to keep pin
        // completions asynchronous on every backend.
        self.env
            .reactor
            .send_msg(Box::new(move || pin_ctx.complete(Ok(()))));
        PinOutcome::Accepted
    }

    fn unpin(&mut self, lba: u64, count: u64) {
        debug_assert!(lba + count <= self.num_lbas);
    }

    fn clear(&mut self, cb: L2pCb) {
        {
            let mut buf = self.buf.borrow_mut();
            let len = self.num_lbas as usize * self.codec.entry_size();
            buf.as_mut_slice()[..len].fill(0xFF);
        }
        if self.pmem {
            let len = self.num_lbas as usize * self.codec.entry_size();
            let result = self
                .buf
                .borrow()
                .flush_range(0, len)
                .map_err(|_| L2pError::Io);
            self.env.reactor.send_msg(Box::new(move || cb(result)));
            return;
        }
        Md::persist(
            &self.md,
            &self.env,
            Box::new(move |st| cb(st.map_err(|_| L2pError::Io))),
        );
    }

    fn persist(&mut self, cb: L2pCb) {
        if self.pmem {
            self.env.reactor.send_msg(Box::new(move || cb(Ok(()))));
            return;
        }
        Md::persist(
            &self.md,
            &self.env,
            Box::new(move |st| cb(st.map_err(|_| L2pError::Io))),
        );
    }

    fn process(&mut self) {}

    fn halt(&mut self) {
        self.halted = true;
    }

    fn is_halted(&self) -> bool {
        self.halted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mem::MemBdev;
    use crate::device::Bdev;
    use crate::layout::{DeviceSel, LayoutRegion, RegionType};
    use crate::md::MdCreateFlags;
    use crate::reactor::{Reactor, ReactorRef};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use uuid::Uuid;

    fn fixture(num_lbas: u64) -> (ReactorRef, Rc<MemBdev>, L2pFlat) {
        let reactor = Reactor::new();
        let cache = MemBdev::new(Rc::clone(&reactor), 1024, 64, 0, 0);
        let base = MemBdev::new(Rc::clone(&reactor), 1024, 0, 256, 2);
        let env = MdEnv {
            reactor: Rc::clone(&reactor),
            cache_ch: cache.open_channel(),
            base_ch: base.open_channel(),
            cache_bdev: Rc::clone(&cache) as Rc<dyn Bdev>,
            base_bdev: base,
            xfer_blocks: 8,
            sb_clean: Rc::new(Cell::new(true)),
        };

        let codec = AddrCodec::from_entry_size(4);
        let blocks = (num_lbas * 4).div_ceil(4096).max(1) * 2;
        let md = Md::create(
            &Uuid::new_v4(),
            blocks,
            0,
            "l2p",
            MdCreateFlags::heap(),
            None,
        )
        .unwrap();
        let region = LayoutRegion {
            rtype: RegionType::L2p,
            device: DeviceSel::Cache,
            offset_blocks: 64,
            length_blocks: blocks,
            version: 1,
            entry_size: 0,
            num_entries: 0,
            vss_blksz: 0,
            mirror_type: None,
        };
        Md::set_region(&md, &region, None).unwrap();
        let flat = L2pFlat::new(md, env, codec, num_lbas);
        (reactor, cache, flat)
    }

    #[test]
    fn test_set_get_idempotence() {
        let (_reactor, _cache, mut flat) = fixture(128);
        for lba in [0u64, 1, 64, 127] {
            flat.set(lba, Addr::Cached(lba + 100));
            assert_eq!(flat.get(lba), Addr::Cached(lba + 100));
            flat.set(lba, Addr::Flash(lba));
            assert_eq!(flat.get(lba), Addr::Flash(lba));
        }
        assert_eq!(flat.get(2), Addr::Invalid);
    }

    #[test]
    fn test_pin_completes_asynchronously() {
        let (reactor, _cache, mut flat) = fixture(128);
        let done = Rc::new(Cell::new(false));
        let d2 = Rc::clone(&done);
        let outcome = flat.pin(PinCtx::new(0, 8, Box::new(move |st| {
            st.unwrap();
            d2.set(true);
        })));
        assert!(matches!(outcome, PinOutcome::Accepted));
        assert!(!done.get());
        assert!(reactor.run_until(|| done.get()));
        flat.unpin(0, 8);
    }

    #[test]
    fn test_pin_out_of_range_fails() {
        let (reactor, _cache, mut flat) = fixture(128);
        let result = Rc::new(RefCell::new(None));
        let r2 = Rc::clone(&result);
        flat.pin(PinCtx::new(120, 16, Box::new(move |st| {
            *r2.borrow_mut() = Some(st);
        })));
        assert!(reactor.run_until(|| result.borrow().is_some()));
        assert_eq!(
            result.borrow_mut().take().unwrap(),
            Err(L2pError::OutOfRange(120))
        );
    }

    #[test]
    fn test_clear_fills_invalid_and_persists() {
        let (reactor, cache, mut flat) = fixture(128);
        flat.set(5, Addr::Flash(42));

        let done = Rc::new(Cell::new(false));
        let d2 = Rc::clone(&done);
        flat.clear(Box::new(move |st| {
            st.unwrap();
            d2.set(true);
        }));
        assert!(reactor.run_until(|| done.get()));

        assert_eq!(flat.get(5), Addr::Invalid);
        // Backing region holds the invalid pattern too.
        let raw = cache.read_raw(64, 1);
        assert!(raw[..128 * 4].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_halt_is_immediate() {
        let (_reactor, _cache, mut flat) = fixture(16);
        assert!(!flat.is_halted());
        flat.halt();
        assert!(flat.is_halted());
    }
}
