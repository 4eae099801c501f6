//! # Device Assembly
//!
//! `FtlDev` wires the subsystems together on one core thread: layout,
//! metadata objects, the selected L2P backend, the non-volatile cache,
//! the band set, and the valid map. It owns the mount/format/halt
//! sequences and the user read/write data path.
//!
//! A user write lands in an open cache chunk together with per-block VSS
//! carrying the LBA; the completion records the mapping with the fixed
//! update ordering (reverse map first, then the L2P, then invalidation of
//! the previous location). Reads translate through the L2P and hit
//! whichever tier holds the block. Compaction relocates closed chunks
//! into bands with the weak-address update rule, so a racing user write
//! always wins.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use thiserror::Error;
use uuid::Uuid;

use crate::band::{BandError, BandSet, BandSetRef, ValidMap, ValidMapRef};
use crate::config::{FtlConfig, L2pBackend, ShmMode};
use crate::core::addr::Addr;
use crate::core::buf::{shared_buf, SharedBuf};
use crate::core::{FTL_BLOCK_SIZE, FTL_LBA_INVALID};
use crate::device::{submit_retrying, Bdev, IoCompletion, IoDir};
use crate::l2p::cache::L2pCache;
use crate::l2p::flat::L2pFlat;
use crate::l2p::{L2pDispatch, L2pError, L2pRef};
use crate::layout::superblock::{Superblock, SuperblockError};
use crate::layout::{Layout, LayoutError, RegionType};
use crate::md::{Md, MdCreateFlags, MdEnv, MdError, MdRef};
use crate::nv_cache::{NvCache, NvCacheError, NvcRef};
use crate::reactor::ReactorRef;
use crate::recovery::{Recovery, RecoveryArgs, RecoveryError};

/// Crate-level error surfaced to the host.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FtlError {
    /// Layout derivation or validation failed.
    #[error(transparent)]
    Layout(#[from] LayoutError),

    /// Metadata object failure.
    #[error(transparent)]
    Md(#[from] MdError),

    /// L2P failure.
    #[error(transparent)]
    L2p(#[from] L2pError),

    /// Cache failure.
    #[error(transparent)]
    NvCache(#[from] NvCacheError),

    /// Band failure.
    #[error(transparent)]
    Band(#[from] BandError),

    /// Recovery failure; the mount is aborted.
    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    /// The superblock did not decode.
    #[error("superblock: {0}")]
    Superblock(#[from] SuperblockError),

    /// A data transfer failed.
    #[error("I/O failed")]
    Io,

    /// The device is halting or halted.
    #[error("device halted")]
    Halted,

    /// Caller error.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Completion of a device-level operation.
pub type FtlCb = Box<dyn FnOnce(Result<(), FtlError>)>;

/// Device lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DevState {
    New,
    Running,
    Halting,
    Halted,
}

/// The shared handles every data-path continuation needs.
#[derive(Clone)]
pub struct FtlCore {
    /// L2P dispatch.
    pub l2p: Rc<L2pDispatch>,
    /// Non-volatile cache.
    pub nvc: NvcRef,
    /// Band set.
    pub bands: BandSetRef,
}

impl FtlCore {
    /// Drop a physical location from whichever tier holds it.
    pub fn invalidate(&self, addr: Addr) {
        match addr {
            Addr::Invalid => {}
            Addr::Cached(_) => NvCache::invalidate(&self.nvc, addr),
            Addr::Flash(_) => BandSet::invalidate(&self.bands, addr),
        }
    }

    /// Record a cache write: `new_addr` holds `lba` now, `prev_addr` is
    /// what the submitter observed before writing.
    ///
    /// On a write-after-write collision inside one chunk the lower cache
    /// offset survives and the loser's reverse-map entry is invalidated.
    /// Otherwise the order is fixed: reverse map, then L2P, then
    /// invalidation of the previous location.
    pub fn update_cached(&self, lba: u64, new_addr: Addr, prev_addr: Addr) {
        debug_assert!(new_addr.is_cached());

        let curr = self.l2p.get(lba);
        if !curr.is_invalid() {
            if curr != prev_addr && curr.is_cached() {
                let curr_chunk = NvCache::chunk_index_of(&self.nvc, curr.cache_offset());
                let new_chunk = NvCache::chunk_index_of(&self.nvc, new_addr.cache_offset());
                if curr_chunk == new_chunk {
                    debug_assert_ne!(new_addr, curr);
                    if new_addr.cache_offset() > curr.cache_offset() {
                        // The older block survives a same-chunk
                        // collision; drop the newer copy.
                        self.invalidate(new_addr);
                        return;
                    }
                }
            }

            // DO NOT CHANGE ORDER - crash consistency depends on the
            // reverse map landing before the forward map.
            NvCache::set_addr(&self.nvc, lba, new_addr);
            self.l2p.set(lba, new_addr);
            self.invalidate(curr);
            return;
        }

        NvCache::set_addr(&self.nvc, lba, new_addr);
        self.l2p.set(lba, new_addr);
    }

    /// Record a relocation: move `lba` to `new_addr` provided the L2P
    /// still points at `weak_addr`. A racing user write invalidates both
    /// the weak source and the freshly written copy.
    pub fn update(&self, lba: u64, new_addr: Addr, weak_addr: Addr, seq_id: u64) {
        debug_assert!(!new_addr.is_cached());
        debug_assert!(!new_addr.is_invalid());
        debug_assert!(!weak_addr.is_invalid());

        let curr = self.l2p.get(lba);
        if curr == weak_addr {
            // DO NOT CHANGE ORDER - same reasoning as update_cached.
            BandSet::set_addr(&self.bands, lba, new_addr, seq_id);
            self.l2p.set(lba, new_addr);
            self.invalidate(curr);
        } else {
            self.invalidate(weak_addr);
            // The relocated copy was written before the race was
            // noticed; it holds no live data either.
            self.invalidate(new_addr);
        }
    }
}

/// Shared handle to the device.
pub type FtlDevRef = Rc<FtlDev>;

/// The translation-layer device.
pub struct FtlDev {
    config: FtlConfig,
    uuid: Uuid,
    reactor: ReactorRef,
    env: MdEnv,
    layout: Layout,

    sb: Rc<RefCell<Superblock>>,
    sb_md: MdRef,
    l2p_md: MdRef,
    valid_md: MdRef,

    seq: Rc<Cell<u64>>,
    valid: ValidMapRef,
    bands: BandSetRef,
    nvc: NvcRef,
    l2p: Rc<L2pDispatch>,
    core: FtlCore,

    state: Cell<DevState>,
    pending_writes: RefCell<VecDeque<PendingWrite>>,
    self_weak: RefCell<std::rc::Weak<FtlDev>>,
}

struct PendingWrite {
    lba: u64,
    num_blocks: u64,
    buf: SharedBuf,
    buf_offset: usize,
    cb: FtlCb,
}

impl FtlDev {
    /// Assemble a device over the two backings. Nothing touches the media
    /// until [`FtlDev::format`] or [`FtlDev::mount`].
    pub fn create(
        config: FtlConfig,
        base: Rc<dyn Bdev>,
        cache: Rc<dyn Bdev>,
        reactor: ReactorRef,
    ) -> Result<FtlDevRef, FtlError> {
        if !config.is_valid() {
            return Err(FtlError::InvalidArgument("configuration rejected"));
        }
        let layout = Layout::setup(&config, &*base, &*cache, None)?;
        layout.dump();

        let uuid = config_uuid(&config);
        let env = MdEnv {
            reactor: Rc::clone(&reactor),
            cache_ch: cache.open_channel(),
            base_ch: base.open_channel(),
            cache_bdev: cache,
            base_bdev: base,
            xfer_blocks: 4 * config.xfer_size,
            sb_clean: Rc::new(Cell::new(true)),
        };

        let shm_dir = config.shm_dir.as_deref();
        let heap = MdCreateFlags::heap();
        let shm = MdCreateFlags::from_shm_mode(config.shm_mode, false);

        let sb_md = Md::create(&uuid, crate::layout::REGION_ALIGN_BLOCKS, 64, "sb", heap, None)?;
        Md::set_region(
            &sb_md,
            layout.region(RegionType::Superblock),
            Some(layout.region(RegionType::SuperblockMirror)),
        )?;

        let band_region = layout.region(RegionType::BandMd).clone();
        let band_md = Md::create(&uuid, band_region.length_blocks, 64, "band_md", heap, None)?;
        Md::set_region(&band_md, &band_region, Some(layout.region(RegionType::BandMdMirror)))?;

        let nvc_region = layout.region(RegionType::NvcMd).clone();
        let nvc_md = Md::create(&uuid, nvc_region.length_blocks, 64, "nvc_md", heap, None)?;
        Md::set_region(&nvc_md, &nvc_region, Some(layout.region(RegionType::NvcMdMirror)))?;

        let valid_region = layout.region(RegionType::ValidMap).clone();
        let valid_md = Md::create(&uuid, valid_region.length_blocks, 64, "valid_map", heap, None)?;
        Md::set_region(&valid_md, &valid_region, None)?;

        // The flat backend owns a full-size (optionally shared-memory)
        // table buffer; the paged backend keeps only a region handle and
        // loads pages on demand.
        let l2p_region = layout.region(RegionType::L2p).clone();
        let l2p_flags = match config.l2p_backend {
            L2pBackend::Flat => shm,
            L2pBackend::Cache => MdCreateFlags::no_mem(),
        };
        let l2p_md = Md::create(&uuid, l2p_region.length_blocks, 64, "l2p", l2p_flags, shm_dir)?;
        Md::set_region(&l2p_md, &l2p_region, None)?;

        let seq = Rc::new(Cell::new(0u64));
        let valid: ValidMapRef =
            Rc::new(RefCell::new(ValidMap::new(layout.base_total_blocks)));

        let bands = BandSet::new(&layout, band_md, env.clone(), Rc::clone(&seq), Rc::clone(&valid));
        let nvc = NvCache::new(
            &layout,
            nvc_md,
            env.clone(),
            Rc::clone(&seq),
            config.user_io_pool_size,
            config.xfer_size,
        );

        let backend: L2pRef = match config.l2p_backend {
            L2pBackend::Flat => build_flat_backend(&config, &layout, &l2p_md, &env)?,
            L2pBackend::Cache => {
                let l1_blocks = l1_resident_blocks(&config, &layout);
                let l1_md = Md::create(&uuid, l1_blocks, 0, "l2p_l1", shm, shm_dir)?;
                L2pCache::new(
                    env.clone(),
                    l2p_region.clone(),
                    Rc::clone(&l2p_md),
                    &l1_md,
                    layout.l2p.codec(),
                    layout.num_lbas,
                    config.l2p_dram_limit_mib << 20,
                    config.l2p_evict_keep_max,
                )
            }
        };
        let l2p = Rc::new(L2pDispatch::new(backend));

        let core = FtlCore {
            l2p: Rc::clone(&l2p),
            nvc: Rc::clone(&nvc),
            bands: Rc::clone(&bands),
        };

        let sb = Rc::new(RefCell::new(Superblock::new(uuid, layout.num_lbas)));

        let dev = Rc::new(FtlDev {
            config,
            uuid,
            reactor,
            env,
            layout,
            sb,
            sb_md,
            l2p_md,
            valid_md,
            seq,
            valid,
            bands,
            nvc,
            l2p,
            core,
            state: Cell::new(DevState::New),
            pending_writes: RefCell::new(VecDeque::new()),
            self_weak: RefCell::new(std::rc::Weak::new()),
        });
        *dev.self_weak.borrow_mut() = Rc::downgrade(&dev);
        Ok(dev)
    }

    /// Device identity.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Host-visible capacity in blocks.
    pub fn num_lbas(&self) -> u64 {
        self.layout.num_lbas
    }

    /// Derived layout, for inspection.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Shared data-path handles.
    pub fn core(&self) -> &FtlCore {
        &self.core
    }

    /// Non-volatile cache handle.
    pub fn nv_cache(&self) -> &NvcRef {
        &self.nvc
    }

    /// Band set handle.
    pub fn band_set(&self) -> &BandSetRef {
        &self.bands
    }

    /// L2P dispatch handle.
    pub fn l2p(&self) -> &Rc<L2pDispatch> {
        &self.l2p
    }

    /// One scheduling round: reactor tick plus per-subsystem
    /// housekeeping.
    pub fn poll(&self) {
        self.reactor.tick();
        self.process();
    }

    /// Per-tick housekeeping: cache replenishment, deferred pins,
    /// parked writes.
    pub fn process(&self) {
        if self.state.get() == DevState::Running {
            NvCache::process(&self.nvc);
        }
        self.l2p.process();
        self.retry_pending_writes();

        if self.state.get() == DevState::Halting {
            // Keep nudging the subsystems; the halt sequence itself
            // decides when the device is down.
            NvCache::halt(&self.nvc);
            self.l2p.halt();
        }
    }

    /// Poll until `cond` holds; returns `false` when the device idles
    /// without reaching it.
    pub fn run_until(&self, mut cond: impl FnMut() -> bool) -> bool {
        loop {
            if cond() {
                return true;
            }
            let progressed = self.reactor.tick();
            self.process();
            if cond() {
                return true;
            }
            if !progressed && self.reactor.pending() == 0 {
                // Housekeeping may be mid-flight (chunk opens, halts);
                // give it bounded extra rounds.
                let mut grace = 64;
                while grace > 0 {
                    self.reactor.tick();
                    self.process();
                    if cond() {
                        return true;
                    }
                    if self.reactor.pending() > 0 {
                        break;
                    }
                    grace -= 1;
                }
                if grace == 0 {
                    return cond();
                }
            }
        }
    }
}

fn config_uuid(config: &FtlConfig) -> Uuid {
    config.uuid.unwrap_or_else(Uuid::new_v4)
}

fn l1_resident_blocks(config: &FtlConfig, layout: &Layout) -> u64 {
    let num_pages = layout
        .num_lbas
        .div_ceil((FTL_BLOCK_SIZE / layout.l2p.addr_size) as u64);
    ((config.l2p_dram_limit_mib << 20) / FTL_BLOCK_SIZE as u64)
        .clamp(1, num_pages)
}

fn build_flat_backend(
    config: &FtlConfig,
    layout: &Layout,
    l2p_md: &MdRef,
    env: &MdEnv,
) -> Result<L2pRef, FtlError> {
    #[cfg(feature = "pmem")]
    if let Some(path) = &config.l2p_pmem_path {
        let flat = L2pFlat::new_pmem(
            path,
            Rc::clone(l2p_md),
            env.clone(),
            layout.l2p.codec(),
            layout.num_lbas,
        )
        .map_err(|e| {
            log::error!("pmem L2P mapping failed: {}", e);
            FtlError::InvalidArgument("pmem path not mappable")
        })?;
        return Ok(Rc::new(RefCell::new(flat)));
    }
    #[cfg(not(feature = "pmem"))]
    if config.l2p_pmem_path.is_some() {
        return Err(FtlError::InvalidArgument(
            "pmem support not compiled in",
        ));
    }
    let _ = config;
    Ok(Rc::new(RefCell::new(L2pFlat::new(
        Rc::clone(l2p_md),
        env.clone(),
        layout.l2p.codec(),
        layout.num_lbas,
    ))))
}

// ---------------------------------------------------------------------------
// Format / mount / halt
// ---------------------------------------------------------------------------

impl FtlDev {
    /// Initialize a fresh device: invalid L2P, zeroed band and chunk
    /// metadata, a clean superblock.
    pub fn format(dev: &FtlDevRef, cb: FtlCb) {
        log::info!("formatting device {}", dev.uuid);
        let dev2 = Rc::clone(dev);
        dev.l2p.clear(Box::new(move |status| {
            if let Err(e) = status {
                cb(Err(e.into()));
                return;
            }
            format_band_md(&dev2, cb);
        }));
    }

    /// Bring an existing device up. A clean superblock loads the
    /// persisted state directly; a dirty one replays.
    pub fn mount(dev: &FtlDevRef, cb: FtlCb) {
        log::info!("mounting device {}", dev.uuid);
        let dev2 = Rc::clone(dev);
        Md::restore(
            &dev.sb_md,
            &dev.env,
            Box::new(move |status| {
                if let Err(e) = status {
                    cb(Err(e.into()));
                    return;
                }
                mount_decode_sb(&dev2, cb);
            }),
        );
    }

    /// Quiesce and persist everything, leaving a clean superblock.
    pub fn halt(dev: &FtlDevRef, cb: FtlCb) {
        if dev.state.get() == DevState::Halted {
            cb(Ok(()));
            return;
        }
        log::info!("halting device {}", dev.uuid);
        dev.state.set(DevState::Halting);
        halt_wait_drained(dev, cb);
    }

    /// Whether the halt sequence finished.
    pub fn is_halted(&self) -> bool {
        self.state.get() == DevState::Halted
    }
}

fn format_band_md(dev: &FtlDevRef, cb: FtlCb) {
    // Fresh band metadata decodes back as free bands.
    let dev2 = Rc::clone(dev);
    BandSet::persist_all(
        &dev.bands,
        Box::new(move |status| {
            if let Err(e) = status {
                cb(Err(e.into()));
                return;
            }
            format_nvc_md(&dev2, cb);
        }),
    );
}

fn format_nvc_md(dev: &FtlDevRef, cb: FtlCb) {
    // Zeroed entries decode as free chunks.
    let zero_block = vec![0u8; FTL_BLOCK_SIZE];
    let nvc_md = NvCache::md_handle(&dev.nvc);
    let dev2 = Rc::clone(dev);
    Md::clear(
        &nvc_md,
        &dev.env,
        &zero_block,
        None,
        Box::new(move |status| {
            if let Err(e) = status {
                cb(Err(e.into()));
                return;
            }
            format_valid_map(&dev2, cb);
        }),
    );
}

fn format_valid_map(dev: &FtlDevRef, cb: FtlCb) {
    let zero_block = vec![0u8; FTL_BLOCK_SIZE];
    let dev2 = Rc::clone(dev);
    Md::clear(
        &dev.valid_md,
        &dev.env,
        &zero_block,
        None,
        Box::new(move |status| {
            if let Err(e) = status {
                cb(Err(e.into()));
                return;
            }
            format_superblock(&dev2, cb);
        }),
    );
}

fn format_superblock(dev: &FtlDevRef, cb: FtlCb) {
    {
        let mut sb = dev.sb.borrow_mut();
        *sb = Superblock::new(dev.uuid, dev.layout.num_lbas);
    }
    let dev2 = Rc::clone(dev);
    persist_superblock(
        dev,
        Box::new(move |status| {
            if let Err(e) = status {
                cb(Err(e));
                return;
            }
            log::info!("format of {} complete", dev2.uuid);
            start_device(&dev2, cb);
        }),
    );
}

fn persist_superblock(dev: &FtlDevRef, cb: FtlCb) {
    {
        let sb = dev.sb.borrow();
        let buf = Md::buffer(&dev.sb_md).expect("superblock object without buffer");
        let encoded = sb.encode();
        buf.borrow_mut().as_mut_slice()[..FTL_BLOCK_SIZE].copy_from_slice(&encoded);
    }
    Md::persist(
        &dev.sb_md,
        &dev.env,
        Box::new(move |status| cb(status.map_err(FtlError::Md))),
    );
}

fn mount_decode_sb(dev: &FtlDevRef, cb: FtlCb) {
    let decoded = {
        let buf = Md::buffer(&dev.sb_md).expect("superblock object without buffer");
        let guard = buf.borrow();
        Superblock::decode(&guard.as_slice()[..FTL_BLOCK_SIZE])
    };
    let sb = match decoded {
        Ok(sb) => sb,
        Err(e) => {
            cb(Err(e.into()));
            return;
        }
    };
    if sb.num_lbas != dev.layout.num_lbas {
        cb(Err(LayoutError::NumLbasMismatch {
            persisted: sb.num_lbas,
            derived: dev.layout.num_lbas,
        }
        .into()));
        return;
    }

    let clean = sb.clean;
    dev.env.sb_clean.set(clean);
    dev.seq.set(sb.seq_id);
    *dev.sb.borrow_mut() = sb;

    if clean {
        mount_clean_restore_bands(dev, cb);
    } else {
        log::warn!("dirty shutdown detected, starting recovery");
        mount_dirty_recover(dev, cb);
    }
}

fn mount_clean_restore_bands(dev: &FtlDevRef, cb: FtlCb) {
    let dev2 = Rc::clone(dev);
    BandSet::restore_state(
        &dev.bands,
        Box::new(move |status| {
            if let Err(e) = status {
                cb(Err(e.into()));
                return;
            }
            mount_clean_restore_chunks(&dev2, cb);
        }),
    );
}

fn mount_clean_restore_chunks(dev: &FtlDevRef, cb: FtlCb) {
    let dev2 = Rc::clone(dev);
    NvCache::restore_state(
        &dev.nvc,
        Box::new(move |status| {
            if let Err(e) = status {
                cb(Err(e.into()));
                return;
            }
            let open = BandSet::open_bands(&dev2.bands);
            mount_clean_restore_open_band(&dev2, open, 0, cb);
        }),
    );
}

// Even after a clean shutdown, open bands carry their maps only in the
// checkpoint slots.
fn mount_clean_restore_open_band(dev: &FtlDevRef, open: Vec<usize>, at: usize, cb: FtlCb) {
    if at >= open.len() {
        mount_clean_restore_l2p(dev, cb);
        return;
    }
    let idx = open[at];
    let slot = BandSet::band_md(&dev.bands, idx).p2l_ckpt;
    let Some(slot) = slot else {
        BandSet::alloc_empty_map(&dev.bands, idx);
        mount_clean_restore_open_band(dev, open, at + 1, cb);
        return;
    };
    let dev2 = Rc::clone(dev);
    crate::band::p2l::ckpt_restore(
        &dev.bands,
        idx,
        slot,
        Box::new(move |status| {
            if let Err(e) = status {
                cb(Err(e.into()));
                return;
            }
            mount_clean_restore_open_band(&dev2, open, at + 1, cb);
        }),
    );
}

fn mount_clean_restore_l2p(dev: &FtlDevRef, cb: FtlCb) {
    // A warm shared-memory buffer already holds the table; a cold flat
    // buffer restores from the region. The paged backend loads on
    // demand.
    let warm = dev.l2p_md.borrow().shm_reused;
    let needs_restore = dev.config.l2p_backend == L2pBackend::Flat && !warm;
    if !needs_restore {
        if warm {
            log::info!("shared-memory L2P reused, skipping region restore");
        }
        mount_restore_valid_map(dev, cb);
        return;
    }
    let dev2 = Rc::clone(dev);
    Md::restore(
        &dev.l2p_md,
        &dev.env,
        Box::new(move |status| {
            if let Err(e) = status {
                cb(Err(e.into()));
                return;
            }
            mount_restore_valid_map(&dev2, cb);
        }),
    );
}

fn mount_restore_valid_map(dev: &FtlDevRef, cb: FtlCb) {
    let dev2 = Rc::clone(dev);
    Md::restore(
        &dev.valid_md,
        &dev.env,
        Box::new(move |status| {
            if let Err(e) = status {
                cb(Err(e.into()));
                return;
            }
            {
                let buf = Md::buffer(&dev2.valid_md).expect("valid-map object without buffer");
                let guard = buf.borrow();
                dev2.valid.borrow_mut().load_bytes(guard.as_slice());
                BandSet::reload_valid_counters(&dev2.bands);
            }
            mount_finish(&dev2, cb);
        }),
    );
}

fn mount_dirty_recover(dev: &FtlDevRef, cb: FtlCb) {
    let args = RecoveryArgs {
        env: dev.env.clone(),
        reactor: Rc::clone(&dev.reactor),
        layout: dev.layout.clone(),
        bands: Rc::clone(&dev.bands),
        nvc: Rc::clone(&dev.nvc),
        valid: Rc::clone(&dev.valid),
        seq: Rc::clone(&dev.seq),
        dram_limit_mib: dev.config.l2p_dram_limit_mib,
        uuid: dev.uuid,
        shm_flags: MdCreateFlags::from_shm_mode(dev.config.shm_mode, true),
        shm_dir: dev.config.shm_dir.clone(),
        fast: dev.config.l2p_backend == L2pBackend::Flat
            && dev.config.shm_mode != ShmMode::Off
            && dev.l2p_md.borrow().shm_reused,
        l2p_buf: Md::buffer(&dev.l2p_md),
    };
    let rec = match Recovery::new(args) {
        Ok(rec) => rec,
        Err(e) => {
            cb(Err(e.into()));
            return;
        }
    };

    let dev2 = Rc::clone(dev);
    Recovery::run(
        &rec,
        Box::new(move |status| {
            if let Err(e) = status {
                cb(Err(e.into()));
                return;
            }
            // The replay rebuilt the on-disk L2P region, the valid map,
            // and the band counters; only the flat buffer still needs
            // the recovered region loaded (the paged backend reads on
            // demand, a warm buffer is already current).
            mount_dirty_restore_l2p(&dev2, cb);
        }),
    );
}

fn mount_dirty_restore_l2p(dev: &FtlDevRef, cb: FtlCb) {
    let warm = dev.l2p_md.borrow().shm_reused;
    let needs_restore = dev.config.l2p_backend == L2pBackend::Flat && !warm;
    if !needs_restore {
        mount_finish(dev, cb);
        return;
    }
    let dev2 = Rc::clone(dev);
    Md::restore(
        &dev.l2p_md,
        &dev.env,
        Box::new(move |status| {
            if let Err(e) = status {
                cb(Err(e.into()));
                return;
            }
            mount_finish(&dev2, cb);
        }),
    );
}

fn mount_finish(dev: &FtlDevRef, cb: FtlCb) {
    start_device(dev, cb);
}

fn start_device(dev: &FtlDevRef, cb: FtlCb) {
    dev.state.set(DevState::Running);
    dev.env.sb_clean.set(true);
    NvCache::resume(&dev.nvc);
    NvCache::process(&dev.nvc);

    // Mark the device in use; a crash from here on is a dirty shutdown.
    {
        let mut sb = dev.sb.borrow_mut();
        sb.clean = false;
    }
    let dev2 = Rc::clone(dev);
    persist_superblock(
        dev,
        Box::new(move |status| {
            if let Err(e) = status {
                cb(Err(e));
                return;
            }
            log::info!("device {} running", dev2.uuid);
            cb(Ok(()));
        }),
    );
}

fn halt_wait_drained(dev: &FtlDevRef, cb: FtlCb) {
    NvCache::halt(&dev.nvc);
    dev.l2p.halt();
    if !NvCache::is_halted(&dev.nvc) || !self_l2p_halted(dev) {
        let dev2 = Rc::clone(dev);
        dev.reactor
            .send_msg(Box::new(move || halt_wait_drained(&dev2, cb)));
        return;
    }
    halt_persist_l2p(dev, cb);
}

fn self_l2p_halted(dev: &FtlDevRef) -> bool {
    dev.l2p.is_halted()
}

fn halt_persist_l2p(dev: &FtlDevRef, cb: FtlCb) {
    let dev2 = Rc::clone(dev);
    dev.l2p.persist(Box::new(move |status| {
        if let Err(e) = status {
            cb(Err(e.into()));
            return;
        }
        halt_persist_bands(&dev2, cb);
    }));
}

fn halt_persist_bands(dev: &FtlDevRef, cb: FtlCb) {
    let dev2 = Rc::clone(dev);
    BandSet::persist_all(
        &dev.bands,
        Box::new(move |status| {
            if let Err(e) = status {
                cb(Err(e.into()));
                return;
            }
            let open = BandSet::open_bands(&dev2.bands);
            halt_ckpt_open_band(&dev2, open, 0, cb);
        }),
    );
}

// Open bands keep their maps only in memory and in their checkpoint
// slots; refresh the slots so a later mount can replay them.
fn halt_ckpt_open_band(dev: &FtlDevRef, open: Vec<usize>, at: usize, cb: FtlCb) {
    if at >= open.len() {
        halt_persist_valid_map(dev, cb);
        return;
    }
    let idx = open[at];
    if BandSet::resident_map(&dev.bands, idx).is_none() {
        halt_ckpt_open_band(dev, open, at + 1, cb);
        return;
    }
    let dev2 = Rc::clone(dev);
    crate::band::p2l::ckpt_persist(
        &dev.bands,
        idx,
        Box::new(move |status| {
            if let Err(e) = status {
                cb(Err(e.into()));
                return;
            }
            halt_ckpt_open_band(&dev2, open, at + 1, cb);
        }),
    );
}

fn halt_persist_valid_map(dev: &FtlDevRef, cb: FtlCb) {
    {
        let buf = Md::buffer(&dev.valid_md).expect("valid-map object without buffer");
        let data_len = Md::data_len(&dev.valid_md);
        let mut guard = buf.borrow_mut();
        dev.valid
            .borrow()
            .store_bytes(&mut guard.as_mut_slice()[..data_len]);
    }
    let dev2 = Rc::clone(dev);
    Md::persist(
        &dev.valid_md,
        &dev.env,
        Box::new(move |status| {
            if let Err(e) = status {
                cb(Err(e.into()));
                return;
            }
            halt_write_clean_sb(&dev2, cb);
        }),
    );
}

fn halt_write_clean_sb(dev: &FtlDevRef, cb: FtlCb) {
    {
        let mut sb = dev.sb.borrow_mut();
        sb.clean = true;
        sb.seq_id = dev.seq.get();
    }
    let dev2 = Rc::clone(dev);
    persist_superblock(
        dev,
        Box::new(move |status| {
            if let Err(e) = status {
                cb(Err(e));
                return;
            }
            dev2.state.set(DevState::Halted);
            log::info!("device {} halted cleanly", dev2.uuid);
            cb(Ok(()));
        }),
    );
}

// ---------------------------------------------------------------------------
// User data path
// ---------------------------------------------------------------------------

impl FtlDev {
    /// Write `num_blocks` starting at `lba` from `buf` at `buf_offset`.
    pub fn write(
        dev: &FtlDevRef,
        lba: u64,
        num_blocks: u64,
        buf: SharedBuf,
        buf_offset: usize,
        cb: FtlCb,
    ) {
        if dev.state.get() != DevState::Running {
            cb(Err(FtlError::Halted));
            return;
        }
        if num_blocks == 0 || num_blocks > dev.config.xfer_size {
            cb(Err(FtlError::InvalidArgument("write size out of bounds")));
            return;
        }
        if lba + num_blocks > dev.layout.num_lbas {
            cb(Err(FtlError::InvalidArgument("write beyond capacity")));
            return;
        }

        let dev2 = Rc::clone(dev);
        dev.l2p.pin(
            lba,
            num_blocks,
            Box::new(move |status| {
                if let Err(e) = status {
                    cb(Err(e.into()));
                    return;
                }
                write_submit(
                    &dev2,
                    PendingWrite {
                        lba,
                        num_blocks,
                        buf,
                        buf_offset,
                        cb,
                    },
                );
            }),
        );
    }

    /// Read `num_blocks` starting at `lba` into `buf` at `buf_offset`.
    /// Blocks never written read back as zeros.
    pub fn read(
        dev: &FtlDevRef,
        lba: u64,
        num_blocks: u64,
        buf: SharedBuf,
        buf_offset: usize,
        cb: FtlCb,
    ) {
        if dev.state.get() != DevState::Running {
            cb(Err(FtlError::Halted));
            return;
        }
        if lba + num_blocks > dev.layout.num_lbas {
            cb(Err(FtlError::InvalidArgument("read beyond capacity")));
            return;
        }

        let dev2 = Rc::clone(dev);
        dev.l2p.pin(
            lba,
            num_blocks,
            Box::new(move |status| {
                if let Err(e) = status {
                    cb(Err(e.into()));
                    return;
                }
                read_block_at(&dev2, lba, num_blocks, buf, buf_offset, 0, cb);
            }),
        );
    }

    fn retry_pending_writes(&self) {
        // Parked writes still hold their pins; only slot allocation is
        // retried. Writes that park again stay parked for the next
        // round.
        let batch = self.pending_writes.borrow().len();
        for _ in 0..batch {
            let parked = self.pending_writes.borrow_mut().pop_front();
            let Some(write) = parked else { break };
            if let Some(dev) = self.self_weak.borrow().upgrade() {
                write_submit(&dev, write);
            }
        }
    }
}

fn write_submit(dev: &FtlDevRef, write: PendingWrite) {
    if dev.state.get() != DevState::Running {
        dev.l2p.unpin(write.lba, write.num_blocks);
        (write.cb)(Err(FtlError::Halted));
        return;
    }

    let Some(slot) = NvCache::allocate(&dev.nvc, write.num_blocks) else {
        // No open chunk can take the request yet; park it for the next
        // housekeeping round.
        dev.pending_writes.borrow_mut().push_back(write);
        return;
    };

    // Previous locations are captured after the pin, at submission time;
    // the completion uses them for write-after-write resolution.
    let prev: Vec<Addr> = (0..write.num_blocks)
        .map(|i| dev.l2p.get(write.lba + i))
        .collect();

    let vss = NvCache::io_vss_get(&dev.nvc)
        .unwrap_or_else(|| shared_buf(write.num_blocks as usize * crate::core::FTL_MD_VSS_SZ));
    NvCache::fill_md(&dev.nvc, &vss, write.lba, write.num_blocks);

    let dev2 = Rc::clone(dev);
    let vss2 = vss.clone();
    let PendingWrite {
        lba,
        num_blocks,
        buf,
        buf_offset,
        cb,
    } = write;
    let io_cb: IoCompletion = Box::new(move |status| {
        NvCache::io_vss_put(&dev2.nvc, vss2.clone());
        if !status.is_ok() {
            dev2.l2p.unpin(lba, num_blocks);
            cb(Err(FtlError::Io));
            return;
        }
        NvCache::advance_blocks(&dev2.nvc, slot.chunk, num_blocks);
        for i in 0..num_blocks {
            dev2.core
                .update_cached(lba + i, Addr::Cached(slot.addr + i), prev[i as usize]);
        }
        dev2.l2p.unpin(lba, num_blocks);
        cb(Ok(()));
    });

    submit_retrying(
        &dev.env.cache_bdev,
        &dev.env.cache_ch,
        IoDir::Write,
        &buf,
        buf_offset,
        Some(&vss),
        0,
        slot.addr,
        num_blocks,
        io_cb,
    );
}

#[allow(clippy::too_many_arguments)]
fn read_block_at(
    dev: &FtlDevRef,
    lba: u64,
    num_blocks: u64,
    buf: SharedBuf,
    buf_offset: usize,
    at: u64,
    cb: FtlCb,
) {
    if at == num_blocks {
        dev.l2p.unpin(lba, num_blocks);
        cb(Ok(()));
        return;
    }

    let addr = dev.l2p.get(lba + at);
    let block_offset = buf_offset + at as usize * FTL_BLOCK_SIZE;

    match addr {
        Addr::Invalid => {
            buf.borrow_mut().as_mut_slice()[block_offset..block_offset + FTL_BLOCK_SIZE].fill(0);
            read_block_at(dev, lba, num_blocks, buf, buf_offset, at + 1, cb);
        }
        Addr::Cached(_) => {
            let dev2 = Rc::clone(dev);
            let buf2 = buf.clone();
            NvCache::read(
                &dev.nvc,
                addr,
                1,
                &buf,
                block_offset,
                Box::new(move |status| {
                    if !status.is_ok() {
                        dev2.l2p.unpin(lba, num_blocks);
                        cb(Err(FtlError::Io));
                        return;
                    }
                    read_block_at(&dev2, lba, num_blocks, buf2, buf_offset, at + 1, cb);
                }),
            );
        }
        Addr::Flash(offset) => {
            let dev2 = Rc::clone(dev);
            let buf2 = buf.clone();
            submit_retrying(
                &dev.env.base_bdev,
                &dev.env.base_ch,
                IoDir::Read,
                &buf,
                block_offset,
                None,
                0,
                offset,
                1,
                Box::new(move |status| {
                    if !status.is_ok() {
                        dev2.l2p.unpin(lba, num_blocks);
                        cb(Err(FtlError::Io));
                        return;
                    }
                    read_block_at(&dev2, lba, num_blocks, buf2, buf_offset, at + 1, cb);
                }),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Compaction
// ---------------------------------------------------------------------------

impl FtlDev {
    /// Relocate the oldest full cache chunk into bands. The weak-address
    /// update rule resolves races with concurrent user writes; a fully
    /// drained chunk returns to the free list.
    pub fn compact_one(dev: &FtlDevRef, cb: FtlCb) {
        let Some(chunk) = NvCache::compaction_take(&dev.nvc) else {
            cb(Ok(()));
            return;
        };
        log::debug!("compacting chunk {}", chunk);

        let dev2 = Rc::clone(dev);
        NvCache::read_tail_map(
            &dev.nvc,
            chunk,
            Box::new(move |result| match result {
                Ok(map) => compact_entry_at(&dev2, chunk, map, 0, cb),
                Err(e) => cb(Err(e.into())),
            }),
        );
    }
}

fn compact_entry_at(dev: &FtlDevRef, chunk: usize, map: SharedBuf, at: u64, cb: FtlCb) {
    let (data_blocks, chunk_offset, codec) = {
        let layout = &dev.layout;
        let offset = layout.nvc_data_offset() + chunk as u64 * layout.chunk_blocks;
        (
            layout.chunk_blocks - layout.chunk_tail_md_blocks,
            offset,
            layout.l2p.codec(),
        )
    };

    if at == data_blocks {
        // Anything not relocated above was stale; account it so the
        // chunk can be reclaimed.
        let md = NvCache::chunk_md(&dev.nvc, chunk);
        let remaining = md.blocks_written.saturating_sub(md.blocks_compacted);
        if remaining > 0 {
            NvCache::mark_compacted(&dev.nvc, chunk, remaining);
        }
        cb(Ok(()));
        return;
    }

    let lba = codec.lba_load(map.borrow().as_slice(), at);
    if lba == FTL_LBA_INVALID {
        compact_entry_at(dev, chunk, map, at + 1, cb);
        return;
    }

    let weak = Addr::Cached(chunk_offset + at);
    let dev2 = Rc::clone(dev);
    dev.l2p.pin(
        lba,
        1,
        Box::new(move |status| {
            if status.is_err() {
                // The mapping cannot be examined; skip the block.
                compact_entry_at(&dev2, chunk, map, at + 1, cb);
                return;
            }
            if dev2.l2p.get(lba) != weak {
                // User data moved on; nothing to relocate.
                dev2.l2p.unpin(lba, 1);
                compact_entry_at(&dev2, chunk, map, at + 1, cb);
                return;
            }
            relocate_block(&dev2, chunk, map, at, lba, weak, cb);
        }),
    );
}

#[allow(clippy::too_many_arguments)]
fn relocate_block(
    dev: &FtlDevRef,
    chunk: usize,
    map: SharedBuf,
    at: u64,
    lba: u64,
    weak: Addr,
    cb: FtlCb,
) {
    // Ensure an open band with room for one block.
    let band = current_open_band(dev);
    let Some(band) = band else {
        log::error!("no band available for relocation");
        dev.l2p.unpin(lba, 1);
        cb(Err(FtlError::Io));
        return;
    };

    let payload = shared_buf(FTL_BLOCK_SIZE);
    let dev2 = Rc::clone(dev);
    let payload2 = payload.clone();
    NvCache::read(
        &dev.nvc,
        weak,
        1,
        &payload,
        0,
        Box::new(move |status| {
            if !status.is_ok() {
                dev2.l2p.unpin(lba, 1);
                cb(Err(FtlError::Io));
                return;
            }
            let dev3 = Rc::clone(&dev2);
            BandSet::write_blocks(
                &dev2.bands,
                band,
                &payload2,
                0,
                1,
                Box::new(move |result| {
                    match result {
                        Ok(report) => {
                            dev3.core.update(
                                lba,
                                Addr::Flash(report.first_offset),
                                weak,
                                report.seq_id,
                            );
                            NvCache::mark_compacted(&dev3.nvc, chunk, 1);
                            dev3.l2p.unpin(lba, 1);

                            // Checkpoint the band map so a crash can
                            // replay the relocation.
                            let dev4 = Rc::clone(&dev3);
                            crate::band::p2l::ckpt_persist(
                                &dev3.bands,
                                band,
                                Box::new(move |status| {
                                    if let Err(e) = status {
                                        cb(Err(e.into()));
                                        return;
                                    }
                                    maybe_close_band(&dev4, band);
                                    compact_entry_at(&dev4, chunk, map, at + 1, cb);
                                }),
                            );
                        }
                        Err(e) => {
                            dev3.l2p.unpin(lba, 1);
                            cb(Err(e.into()));
                        }
                    }
                }),
            );
        }),
    );
}

fn current_open_band(dev: &FtlDevRef) -> Option<usize> {
    let usable = BandSet::usable_blocks(&dev.bands);
    let open = BandSet::open_bands(&dev.bands);
    for idx in open {
        let md = BandSet::band_md(&dev.bands, idx);
        if md.state == crate::band::BandState::Open && md.write_pointer < usable {
            return Some(idx);
        }
    }
    let idx = BandSet::open_next(&dev.bands)?;
    Some(idx)
}

fn maybe_close_band(dev: &FtlDevRef, band: usize) {
    let md = BandSet::band_md(&dev.bands, band);
    if md.state == crate::band::BandState::Full {
        BandSet::close(
            &dev.bands,
            band,
            Box::new(move |status| {
                if let Err(e) = status {
                    log::error!("band {} close failed: {}", band, e);
                }
            }),
        );
    }
}
