// Integration tests for the device data path: format, user writes and
// reads, write-after-write resolution, halt, remount, and compaction.

#[cfg(test)]
mod device_integration_tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use flashtier::band::BandSet;
    use flashtier::core::buf::shared_buf;
    use flashtier::device::mem::MemBdev;
    use flashtier::device::Bdev;
    use flashtier::dev::FtlDevRef;
    use flashtier::nv_cache::{ChunkState, NvCache};
    use flashtier::{
        Addr, FtlConfig, FtlDev, FtlError, L2pBackend, Reactor, ReactorRef, FTL_BLOCK_SIZE,
        FTL_LBA_INVALID,
    };
    use uuid::Uuid;

    struct Rig {
        reactor: ReactorRef,
        base: Rc<MemBdev>,
        cache: Rc<MemBdev>,
        uuid: Uuid,
    }

    fn rig() -> Rig {
        let _ = env_logger::builder().is_test(true).try_init();
        let reactor = Reactor::new();
        let base = MemBdev::new(Rc::clone(&reactor), 8192, 0, 256, 2);
        let cache = MemBdev::new(Rc::clone(&reactor), 4096, 64, 0, 0);
        Rig {
            reactor,
            base,
            cache,
            uuid: Uuid::new_v4(),
        }
    }

    fn config(rig: &Rig, backend: L2pBackend) -> FtlConfig {
        FtlConfig {
            chunk_blocks: 256,
            uuid: Some(rig.uuid),
            l2p_backend: backend,
            ..FtlConfig::default()
        }
    }

    fn new_dev(rig: &Rig, backend: L2pBackend) -> FtlDevRef {
        FtlDev::create(
            config(rig, backend),
            Rc::clone(&rig.base) as Rc<dyn Bdev>,
            Rc::clone(&rig.cache) as Rc<dyn Bdev>,
            Rc::clone(&rig.reactor),
        )
        .unwrap()
    }

    fn run_dev_op(
        dev: &FtlDevRef,
        op: impl FnOnce(&FtlDevRef, flashtier::dev::FtlCb),
    ) -> Result<(), FtlError> {
        let result = Rc::new(RefCell::new(None));
        let r2 = Rc::clone(&result);
        op(dev, Box::new(move |st| *r2.borrow_mut() = Some(st)));
        assert!(dev.run_until(|| result.borrow().is_some()), "operation stalled");
        let out = result.borrow_mut().take().unwrap();
        out
    }

    fn format(dev: &FtlDevRef) {
        run_dev_op(dev, FtlDev::format).unwrap();
    }

    fn write_lba(dev: &FtlDevRef, lba: u64, fill: u8) {
        let buf = shared_buf(FTL_BLOCK_SIZE);
        buf.borrow_mut().fill(fill);
        run_dev_op(dev, |dev, cb| FtlDev::write(dev, lba, 1, buf.clone(), 0, cb)).unwrap();
    }

    fn write_span(dev: &FtlDevRef, lba: u64, num_blocks: u64, fill: u8) {
        let buf = shared_buf(num_blocks as usize * FTL_BLOCK_SIZE);
        buf.borrow_mut().fill(fill);
        run_dev_op(dev, |dev, cb| {
            FtlDev::write(dev, lba, num_blocks, buf.clone(), 0, cb)
        })
        .unwrap();
    }

    fn read_lba(dev: &FtlDevRef, lba: u64) -> Vec<u8> {
        let buf = shared_buf(FTL_BLOCK_SIZE);
        run_dev_op(dev, |dev, cb| FtlDev::read(dev, lba, 1, buf.clone(), 0, cb)).unwrap();
        let out = buf.borrow().as_slice().to_vec();
        out
    }

    #[test]
    fn test_format_write_read_back() {
        let rig = rig();
        let dev = new_dev(&rig, L2pBackend::Flat);
        format(&dev);

        // One block of 0xAB at LBA 0.
        write_lba(&dev, 0, 0xAB);
        let data = read_lba(&dev, 0);
        assert!(data.iter().all(|&b| b == 0xAB));

        // The mapping points into the cache and the chunk accounted the
        // block.
        let addr = dev.l2p().get(0);
        assert!(addr.is_cached());
        let chunk = NvCache::chunk_index_of(dev.nv_cache(), addr.cache_offset());
        assert_eq!(chunk, 0);
        assert_eq!(NvCache::chunk_md(dev.nv_cache(), 0).blocks_written, 1);

        // Unwritten blocks read back as zeros.
        assert!(read_lba(&dev, 17).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_after_write_same_chunk_keeps_lower_offset() {
        let rig = rig();
        let dev = new_dev(&rig, L2pBackend::Flat);
        format(&dev);
        assert!(dev.run_until(|| NvCache::open_count(dev.nv_cache()) == 2));

        // Two writes to LBA 7 in flight together, landing in the same
        // open chunk.
        let buf_a = shared_buf(FTL_BLOCK_SIZE);
        buf_a.borrow_mut().fill(0x0A);
        let buf_b = shared_buf(FTL_BLOCK_SIZE);
        buf_b.borrow_mut().fill(0x0B);

        let done = Rc::new(RefCell::new(0u32));
        for buf in [buf_a, buf_b] {
            let d = Rc::clone(&done);
            FtlDev::write(
                &dev,
                7,
                1,
                buf,
                0,
                Box::new(move |st| {
                    st.unwrap();
                    *d.borrow_mut() += 1;
                }),
            );
        }
        assert!(dev.run_until(|| *done.borrow() == 2));

        // The first (lower) cache offset survives.
        let addr = dev.l2p().get(7);
        assert!(addr.is_cached());
        let chunk_md = NvCache::chunk_md(dev.nv_cache(), 0);
        assert_eq!(chunk_md.blocks_written, 2);
        assert_eq!(NvCache::map_get_lba(dev.nv_cache(), addr), Some(7));

        // The loser is recorded but invalidated in the reverse map.
        let loser = Addr::Cached(addr.cache_offset() + 1);
        assert_eq!(
            NvCache::map_get_lba(dev.nv_cache(), loser),
            Some(FTL_LBA_INVALID)
        );
    }

    #[test]
    fn test_halt_skips_tail_and_closes_chunk() {
        let rig = rig();
        let dev = new_dev(&rig, L2pBackend::Flat);
        format(&dev);

        // 100 blocks into the first chunk.
        for i in 0..6 {
            write_span(&dev, i * 16, 16, 0x11);
        }
        write_span(&dev, 96, 4, 0x11);
        assert_eq!(NvCache::chunk_md(dev.nv_cache(), 0).blocks_written, 100);

        run_dev_op(&dev, FtlDev::halt).unwrap();
        assert!(dev.is_halted());

        let layout = dev.layout();
        let tail = layout.chunk_tail_md_blocks;
        let md = NvCache::chunk_md(dev.nv_cache(), 0);
        assert_eq!(md.state, ChunkState::Closed);
        assert_eq!(md.blocks_skipped, layout.chunk_blocks - tail - 100);
        assert_eq!(md.write_pointer, layout.chunk_blocks);
        assert_ne!(md.lba_map_checksum, 0);
    }

    #[test]
    fn test_clean_remount_preserves_data() {
        use rand::{Rng, SeedableRng};

        let rig = rig();
        let dev = new_dev(&rig, L2pBackend::Flat);
        format(&dev);

        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED);
        let mut payloads = std::collections::HashMap::new();
        for lba in [0u64, 5, 1000, 4000] {
            let mut data = vec![0u8; FTL_BLOCK_SIZE];
            rng.fill(data.as_mut_slice());
            let buf = shared_buf(FTL_BLOCK_SIZE);
            buf.borrow_mut().as_mut_slice().copy_from_slice(&data);
            run_dev_op(&dev, |dev, cb| FtlDev::write(dev, lba, 1, buf.clone(), 0, cb)).unwrap();
            payloads.insert(lba, data);
        }
        run_dev_op(&dev, FtlDev::halt).unwrap();
        drop(dev);

        // Same devices, same identity, fresh in-memory state.
        let dev = new_dev(&rig, L2pBackend::Flat);
        run_dev_op(&dev, FtlDev::mount).unwrap();

        for (lba, data) in payloads {
            assert_eq!(read_lba(&dev, lba), data, "payload mismatch at LBA {}", lba);
        }
    }

    #[test]
    fn test_paged_backend_round_trip() {
        let rig = rig();
        let dev = new_dev(&rig, L2pBackend::Cache);
        format(&dev);

        // Touch LBAs across several pages.
        for lba in [0u64, 1024, 2048, 5000] {
            write_lba(&dev, lba, 0x33);
        }
        for lba in [0u64, 1024, 2048, 5000] {
            assert!(read_lba(&dev, lba).iter().all(|&b| b == 0x33));
        }
    }

    #[test]
    fn test_compaction_relocates_to_band() {
        let rig = rig();
        let dev = new_dev(&rig, L2pBackend::Flat);
        format(&dev);

        // Fill the first chunk's data area completely so it closes.
        let layout = dev.layout();
        let data_blocks = layout.chunk_blocks - layout.chunk_tail_md_blocks;
        let mut written = 0u64;
        while written < data_blocks {
            let n = (data_blocks - written).min(16);
            write_span(&dev, written, n, 0x5C);
            written += n;
        }
        assert!(dev.run_until(|| !NvCache::full_chunks(dev.nv_cache()).is_empty()));

        run_dev_op(&dev, FtlDev::compact_one).unwrap();

        // Mappings moved off the cache onto the base device.
        let addr = dev.l2p().get(0);
        assert!(matches!(addr, Addr::Flash(_)));
        assert!(read_lba(&dev, 0).iter().all(|&b| b == 0x5C));

        // The drained chunk returned to the free pool.
        assert!(dev.run_until(|| {
            NvCache::chunk_md(dev.nv_cache(), 0).state == ChunkState::Free
        }));

        // The receiving band accounts the relocated blocks.
        let band = BandSet::band_of(dev.band_set(), addr.flash_offset());
        assert_eq!(BandSet::valid_count(dev.band_set(), band), data_blocks);
    }

    #[test]
    fn test_overwrite_invalidates_band_copy() {
        let rig = rig();
        let dev = new_dev(&rig, L2pBackend::Flat);
        format(&dev);

        let layout = dev.layout();
        let data_blocks = layout.chunk_blocks - layout.chunk_tail_md_blocks;
        let mut written = 0u64;
        while written < data_blocks {
            let n = (data_blocks - written).min(16);
            write_span(&dev, written, n, 0x77);
            written += n;
        }
        assert!(dev.run_until(|| !NvCache::full_chunks(dev.nv_cache()).is_empty()));
        run_dev_op(&dev, FtlDev::compact_one).unwrap();

        let band_addr = dev.l2p().get(3);
        let band = BandSet::band_of(dev.band_set(), band_addr.flash_offset());
        let before = BandSet::valid_count(dev.band_set(), band);

        // Overwriting through the cache invalidates the band copy.
        write_lba(&dev, 3, 0x78);
        assert!(dev.l2p().get(3).is_cached());
        assert_eq!(BandSet::valid_count(dev.band_set(), band), before - 1);
        assert!(read_lba(&dev, 3).iter().all(|&b| b == 0x78));
    }

    #[test]
    fn test_hotremove_fails_io() {
        let rig = rig();
        let dev = new_dev(&rig, L2pBackend::Flat);
        format(&dev);
        write_lba(&dev, 1, 0x44);

        rig.cache.hotremove();
        let buf = shared_buf(FTL_BLOCK_SIZE);
        let err = run_dev_op(&dev, |dev, cb| FtlDev::write(dev, 2, 1, buf.clone(), 0, cb));
        assert!(err.is_err());
    }

    #[test]
    fn test_write_beyond_capacity_rejected() {
        let rig = rig();
        let dev = new_dev(&rig, L2pBackend::Flat);
        format(&dev);

        let buf = shared_buf(FTL_BLOCK_SIZE);
        let err = run_dev_op(&dev, |dev, cb| {
            FtlDev::write(dev, dev.num_lbas(), 1, buf.clone(), 0, cb)
        });
        assert!(matches!(err, Err(FtlError::InvalidArgument(_))));
    }
}
